//! PostgreSQL type identifiers and result statuses.
//!
//! Maps backend type OIDs onto the shared cell taxonomy and defines the
//! per-response execution status with its fixed classification table.
//! Reference: https://www.postgresql.org/docs/current/catalog-pg-type.html

use crate::error::ErrorCode;
use crate::types::CellType;

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub u32);

impl Oid {
    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const OID: Oid = Oid(26);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const UNKNOWN: Oid = Oid(705);
    pub const MONEY: Oid = Oid(790);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const DATE: Oid = Oid(1082);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const NUMERIC: Oid = Oid(1700);
    pub const UUID: Oid = Oid(2950);
    pub const JSONB: Oid = Oid(3802);

    pub const BOOL_ARRAY: Oid = Oid(1000);
    pub const INT2_ARRAY: Oid = Oid(1005);
    pub const INT4_ARRAY: Oid = Oid(1007);
    pub const TEXT_ARRAY: Oid = Oid(1009);
    pub const INT8_ARRAY: Oid = Oid(1016);
    pub const FLOAT4_ARRAY: Oid = Oid(1021);
    pub const FLOAT8_ARRAY: Oid = Oid(1022);
    pub const VARCHAR_ARRAY: Oid = Oid(1015);

    #[inline]
    pub fn from_u32(oid: u32) -> Self {
        Oid(oid)
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// Map a column OID onto the cell taxonomy.
///
/// Grouped by `pg_type.typcategory`. Anything not listed, including the
/// `unknown` pseudo-type, is [`CellType::Invalid`].
pub fn cell_type_for(oid: Oid) -> CellType {
    match oid.0 {
        // B: boolean
        16 => CellType::BOOLEAN,

        // N: int2, int4, int8, regproc, oid and the other reg* aliases
        20 | 21 | 23 | 24 | 26 => CellType::INTEGER,
        2202 | 2203 | 2204 | 2205 | 2206 | 3734 | 3769 | 4089 | 4096 | 4191 => CellType::INTEGER,

        // N: float4, float8, numeric
        700 | 701 | 1700 => CellType::FLOAT,

        // S: name, text, bpchar, varchar, char
        18 | 19 | 25 | 1042 | 1043 => CellType::STRING,
        // N: money carries a currency symbol in text form
        790 => CellType::STRING,
        // C: composite catalog rows
        71 | 75 | 81 | 83 => CellType::STRING,
        // D, T: date/time and interval
        1082 | 1083 | 1114 | 1184 | 1186 | 1266 => CellType::STRING,
        // G: geometric
        600..=604 | 628 | 718 => CellType::STRING,
        // I: network address
        650 | 869 => CellType::STRING,
        // P: pseudo-types
        32 | 269 | 325 | 2249 | 2275..=2281 | 2283 | 2776 | 3115 | 3310 | 3500 | 3831 | 3838
        | 4537 | 4538 | 5077..=5080 => CellType::STRING,
        // R: ranges and multiranges
        3904 | 3906 | 3908 | 3910 | 3912 | 3926 | 4451 | 4532..=4536 => CellType::STRING,
        // U: bytea, tid, xid, cid, json, xml, uuid, tsvector and friends
        17 | 27 | 28 | 29 | 114 | 142 | 774 | 829 | 1033 | 1790 | 2950 | 2970 | 3220 | 3614
        | 3615 | 3642 | 3802 | 4072 | 5038 | 5069 => CellType::STRING,
        // V: bit strings
        1560 | 1562 => CellType::STRING,
        // Z: internal-use
        194 | 3361 | 3402 | 4600 | 4601 | 5017 => CellType::STRING,

        // A: arrays
        1000 => CellType::BOOLEAN_ARRAY,
        1005 | 1007 | 1011 | 1012 | 1016 | 1028 => CellType::INTEGER_ARRAY,
        1021 | 1022 | 1231 => CellType::FLOAT_ARRAY,
        // int2vector and oidvector print as arrays of names
        22 | 30 => CellType::STRING_ARRAY,
        143 | 199 | 210 | 270..=273 | 629 | 651 | 719 | 775 | 791 | 1001..=1003 | 1006
        | 1008..=1010 | 1013..=1015 | 1017..=1020 | 1027 | 1034 | 1040 | 1041 | 1115
        | 1182 | 1183 | 1185 | 1187 | 1263 | 1270 | 1561 | 1563 | 2201 | 2207..=2211
        | 2949 | 2951 | 3221 | 3643..=3645 | 3735 | 3770 | 3807 | 3905 | 3907 | 3909
        | 3911 | 3913 | 3927 | 4073 | 4090 | 4097 | 4192 | 5039 | 6150..=6153 | 6155
        | 6157 => CellType::STRING_ARRAY,

        // X: unknown, and anything unlisted
        _ => CellType::Invalid,
    }
}

// ============================================================================
// Execution status
// ============================================================================

/// Outcome of one backend round trip, numbered like libpq's `ExecStatusType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExecStatus {
    EmptyQuery = 0,
    CommandOk = 1,
    TuplesOk = 2,
    CopyOut = 3,
    CopyIn = 4,
    BadResponse = 5,
    NonfatalError = 6,
    FatalError = 7,
    CopyBoth = 8,
    SingleTuple = 9,
    PipelineSync = 10,
    PipelineAborted = 11,
}

impl ExecStatus {
    pub fn from_i32(status: i32) -> Option<Self> {
        let status = match status {
            0 => ExecStatus::EmptyQuery,
            1 => ExecStatus::CommandOk,
            2 => ExecStatus::TuplesOk,
            3 => ExecStatus::CopyOut,
            4 => ExecStatus::CopyIn,
            5 => ExecStatus::BadResponse,
            6 => ExecStatus::NonfatalError,
            7 => ExecStatus::FatalError,
            8 => ExecStatus::CopyBoth,
            9 => ExecStatus::SingleTuple,
            10 => ExecStatus::PipelineSync,
            11 => ExecStatus::PipelineAborted,
            _ => return None,
        };
        Some(status)
    }

    #[inline]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Fixed status table.
    pub fn error_code(self) -> ErrorCode {
        match self {
            ExecStatus::EmptyQuery
            | ExecStatus::CommandOk
            | ExecStatus::TuplesOk
            | ExecStatus::SingleTuple
            | ExecStatus::NonfatalError => ErrorCode::Ok,
            ExecStatus::CopyOut
            | ExecStatus::CopyIn
            | ExecStatus::CopyBoth
            | ExecStatus::PipelineSync => ErrorCode::Processing,
            ExecStatus::BadResponse | ExecStatus::FatalError | ExecStatus::PipelineAborted => {
                ErrorCode::Unknown
            }
        }
    }
}
