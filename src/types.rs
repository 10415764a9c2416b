//! Shared type vocabulary for parameters and result cells.

use serde::Serialize;

/// Scalar base type; every parameter and cell is one of these, a `null`,
/// or an array of one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseType {
    Integer,
    Boolean,
    Float,
    String,
}

/// Semantic type of a result column or cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CellType {
    Null,
    /// Column descriptor the driver could not map; such cells are skipped.
    Invalid,
    Scalar(BaseType),
    Array(BaseType),
}

impl CellType {
    pub const INTEGER: CellType = CellType::Scalar(BaseType::Integer);
    pub const BOOLEAN: CellType = CellType::Scalar(BaseType::Boolean);
    pub const FLOAT: CellType = CellType::Scalar(BaseType::Float);
    pub const STRING: CellType = CellType::Scalar(BaseType::String);
    pub const INTEGER_ARRAY: CellType = CellType::Array(BaseType::Integer);
    pub const BOOLEAN_ARRAY: CellType = CellType::Array(BaseType::Boolean);
    pub const FLOAT_ARRAY: CellType = CellType::Array(BaseType::Float);
    pub const STRING_ARRAY: CellType = CellType::Array(BaseType::String);

    #[inline]
    pub fn is_array(self) -> bool {
        matches!(self, CellType::Array(_))
    }

    /// Base type of a scalar or array type.
    pub fn base(self) -> Option<BaseType> {
        match self {
            CellType::Scalar(base) | CellType::Array(base) => Some(base),
            CellType::Null | CellType::Invalid => None,
        }
    }
}
