//! Owned, typed result sets.
//!
//! A [`ResultSet`] is the single ownership root for every decoded value: the
//! cells live in one row-major arena indexed by `(row, column)`, so dropping
//! (or [`ResultSet::destroy`]ing) the set frees everything in one pass.
//! Errors are reported through the set's code and message, never by absence.

use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};

use crate::error::ErrorCode;
use crate::types::{BaseType, CellType};

// ============================================================================
// Typed Cell
// ============================================================================

/// One decoded column value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    /// Column type the driver could not map; carries no value.
    Invalid,
    Integer(i64),
    Boolean(bool),
    Float(f64),
    String(String),
    IntegerArray(Vec<i64>),
    BooleanArray(Vec<bool>),
    FloatArray(Vec<f64>),
    StringArray(Vec<String>),
}

impl Cell {
    pub fn cell_type(&self) -> CellType {
        match self {
            Cell::Null => CellType::Null,
            Cell::Invalid => CellType::Invalid,
            Cell::Integer(_) => CellType::Scalar(BaseType::Integer),
            Cell::Boolean(_) => CellType::Scalar(BaseType::Boolean),
            Cell::Float(_) => CellType::Scalar(BaseType::Float),
            Cell::String(_) => CellType::Scalar(BaseType::String),
            Cell::IntegerArray(_) => CellType::Array(BaseType::Integer),
            Cell::BooleanArray(_) => CellType::Array(BaseType::Boolean),
            Cell::FloatArray(_) => CellType::Array(BaseType::Float),
            Cell::StringArray(_) => CellType::Array(BaseType::String),
        }
    }

    /// Element count (0 for scalars, null and invalid cells).
    pub fn count(&self) -> usize {
        match self {
            Cell::IntegerArray(v) => v.len(),
            Cell::BooleanArray(v) => v.len(),
            Cell::FloatArray(v) => v.len(),
            Cell::StringArray(v) => v.len(),
            _ => 0,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

// ============================================================================
// Result Set
// ============================================================================

/// Outcome of one query execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    code: ErrorCode,
    message: String,
    fields: Vec<String>,
    entries: usize,
    /// Row-major: `cells[row * fields.len() + col]`.
    cells: Vec<Cell>,
}

impl ResultSet {
    /// A result set carrying only an outcome, with no fields or entries.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            fields: Vec::new(),
            entries: 0,
            cells: Vec::new(),
        }
    }

    /// Assemble a populated result set. `cells.len()` must equal
    /// `fields.len() * entries`.
    pub(crate) fn from_grid(fields: Vec<String>, entries: usize, cells: Vec<Cell>) -> Self {
        debug_assert_eq!(cells.len(), fields.len() * entries);
        Self {
            code: ErrorCode::Ok,
            message: String::new(),
            fields,
            entries,
            cells,
        }
    }

    pub(crate) fn set_outcome(&mut self, code: ErrorCode, message: String) {
        self.code = code;
        self.message = message;
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    pub fn entries_count(&self) -> usize {
        self.entries
    }

    pub fn fields_count(&self) -> usize {
        self.fields.len()
    }

    /// Field names in column order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn field_name(&self, col: usize) -> Option<&str> {
        self.fields.get(col).map(String::as_str)
    }

    /// Column index of the first field with this name.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == name)
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<&Cell> {
        if row >= self.entries || col >= self.fields.len() {
            return None;
        }
        self.cells.get(row * self.fields.len() + col)
    }

    pub fn row(&self, row: usize) -> Option<&[Cell]> {
        if row >= self.entries {
            return None;
        }
        let width = self.fields.len();
        Some(&self.cells[row * width..(row + 1) * width])
    }

    /// Iterate over entries as column slices.
    ///
    /// Entries with no fields still yield one empty slice each.
    pub fn rows(&self) -> impl Iterator<Item = &[Cell]> {
        (0..self.entries).filter_map(move |i| self.row(i))
    }

    /// The cell exists and its column type was recognized.
    pub fn is_valid(&self, row: usize, col: usize) -> bool {
        matches!(self.cell(row, col), Some(cell) if *cell != Cell::Invalid)
    }

    pub fn is_null(&self, row: usize, col: usize) -> bool {
        matches!(self.cell(row, col), Some(Cell::Null))
    }

    pub fn is_valid_and_not_null(&self, row: usize, col: usize) -> bool {
        self.is_valid(row, col) && !self.is_null(row, col)
    }

    pub fn read_integer(&self, row: usize, col: usize) -> Option<i64> {
        match self.cell(row, col)? {
            Cell::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn read_bool(&self, row: usize, col: usize) -> Option<bool> {
        match self.cell(row, col)? {
            Cell::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn read_float(&self, row: usize, col: usize) -> Option<f64> {
        match self.cell(row, col)? {
            Cell::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn read_string(&self, row: usize, col: usize) -> Option<&str> {
        match self.cell(row, col)? {
            Cell::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn read_integer_array(&self, row: usize, col: usize) -> Option<&[i64]> {
        match self.cell(row, col)? {
            Cell::IntegerArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn read_bool_array(&self, row: usize, col: usize) -> Option<&[bool]> {
        match self.cell(row, col)? {
            Cell::BooleanArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn read_float_array(&self, row: usize, col: usize) -> Option<&[f64]> {
        match self.cell(row, col)? {
            Cell::FloatArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn read_string_array(&self, row: usize, col: usize) -> Option<&[String]> {
        match self.cell(row, col)? {
            Cell::StringArray(v) => Some(v),
            _ => None,
        }
    }

    /// Entries as JSON objects keyed by field name.
    ///
    /// With `squash_if_single`, exactly one entry renders as a bare object
    /// instead of a one-element array.
    pub fn to_json(&self, squash_if_single: bool) -> JsonValue {
        let mut objects: Vec<JsonValue> = self
            .rows()
            .map(|row| {
                let mut obj = Map::with_capacity(self.fields.len());
                for (name, cell) in self.fields.iter().zip(row) {
                    obj.insert(
                        name.clone(),
                        serde_json::to_value(cell).unwrap_or(JsonValue::Null),
                    );
                }
                JsonValue::Object(obj)
            })
            .collect();

        if squash_if_single && objects.len() == 1 {
            objects.pop().unwrap_or(JsonValue::Null)
        } else {
            JsonValue::Array(objects)
        }
    }

    /// Release the result set and every value it owns.
    pub fn destroy(self) {
        drop(self);
    }
}

/// Serializes as `{code, message, fields, entries: [{field: value}]}`.
impl Serialize for ResultSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        struct Entry<'a>(&'a [String], &'a [Cell]);

        impl Serialize for Entry<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let mut map = serializer.serialize_map(Some(self.0.len()))?;
                for (name, cell) in self.0.iter().zip(self.1) {
                    map.serialize_entry(name, cell)?;
                }
                map.end()
            }
        }

        let entries: Vec<Entry<'_>> = self
            .rows()
            .map(|row| Entry(&self.fields, row))
            .collect();

        let mut s = serializer.serialize_struct("ResultSet", 4)?;
        s.serialize_field("code", &self.code)?;
        s.serialize_field("message", &self.message)?;
        s.serialize_field("fields", &self.fields)?;
        s.serialize_field("entries", &entries)?;
        s.end()
    }
}
