//! Result decoding: raw text responses into owned, typed result sets.
//!
//! Column descriptors are mapped through the driver's type table first; each
//! cell is then parsed from its text form. Array cells use the backend's
//! bracketed literal syntax:
//!
//! ```text
//! {1,2,3}            {"hello world",b,"with \"quote\""}            {}
//! ```
//!
//! Decoding is all-or-nothing: any cell that fails to parse fails the whole
//! response and no result set is produced.

use std::borrow::Cow;

use smallvec::SmallVec;

use crate::driver::RawResponse;
use crate::error::{DbError, Result};
use crate::result::{Cell, ResultSet};
use crate::types::{BaseType, CellType};

/// Decode a successful response using `map_type` for column descriptors.
pub fn decode<F>(raw: RawResponse, map_type: F) -> Result<ResultSet>
where
    F: Fn(u32) -> CellType,
{
    let types: SmallVec<[CellType; 16]> = raw.columns.iter().map(|c| map_type(c.type_id)).collect();
    let fields: Vec<String> = raw.columns.into_iter().map(|c| c.name).collect();

    let entries = raw.rows.len();
    let mut cells = Vec::with_capacity(entries * fields.len());

    for (r, row) in raw.rows.into_iter().enumerate() {
        if row.len() != fields.len() {
            return Err(DbError::Decode(format!(
                "entry {} has {} values for {} fields",
                r,
                row.len(),
                fields.len()
            )));
        }

        for (c, value) in row.into_iter().enumerate() {
            let cell = match value {
                None => Cell::Null,
                Some(text) => decode_cell(types[c], text).map_err(|e| {
                    DbError::Decode(format!("entry {}, field '{}': {}", r, fields[c], e))
                })?,
            };
            cells.push(cell);
        }
    }

    Ok(ResultSet::from_grid(fields, entries, cells))
}

/// Parse one non-null cell according to its column type.
pub fn decode_cell(ty: CellType, text: String) -> std::result::Result<Cell, String> {
    match ty {
        CellType::Null | CellType::Invalid => Ok(Cell::Invalid),
        CellType::Scalar(BaseType::Integer) => parse_integer(&text).map(Cell::Integer),
        CellType::Scalar(BaseType::Float) => parse_float(&text).map(Cell::Float),
        CellType::Scalar(BaseType::Boolean) => Ok(Cell::Boolean(parse_bool(&text))),
        CellType::Scalar(BaseType::String) => Ok(Cell::String(text)),
        CellType::Array(base) => parse_array(&text, base),
    }
}

fn parse_integer(text: &str) -> std::result::Result<i64, String> {
    text.trim()
        .parse::<i64>()
        .map_err(|e| format!("invalid integer {:?}: {}", text, e))
}

fn parse_float(text: &str) -> std::result::Result<f64, String> {
    text.trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid float {:?}: {}", text, e))
}

/// Anything other than the literal `false` token is true, except that the
/// PostgreSQL text form `f` is also read as false.
fn parse_bool(text: &str) -> bool {
    !matches!(text.trim(), "false" | "f")
}

// ============================================================================
// Array literals
// ============================================================================

/// Parse a `{elem,elem,...}` literal into an owned array cell.
pub fn parse_array(text: &str, base: BaseType) -> std::result::Result<Cell, String> {
    let inner = array_body(text)?;
    let count = count_elements(inner)?;

    let cell = match base {
        BaseType::Integer => {
            let mut out = Vec::with_capacity(count);
            for element in Elements::new(inner) {
                out.push(parse_integer(&element?)?);
            }
            Cell::IntegerArray(out)
        }
        BaseType::Float => {
            let mut out = Vec::with_capacity(count);
            for element in Elements::new(inner) {
                out.push(parse_float(&element?)?);
            }
            Cell::FloatArray(out)
        }
        BaseType::Boolean => {
            let mut out = Vec::with_capacity(count);
            for element in Elements::new(inner) {
                out.push(parse_bool(&element?));
            }
            Cell::BooleanArray(out)
        }
        BaseType::String => {
            let mut out = Vec::with_capacity(count);
            for element in Elements::new(inner) {
                out.push(element?.into_owned());
            }
            Cell::StringArray(out)
        }
    };

    Ok(cell)
}

/// Strip the enclosing braces (and an optional `[lo:hi]=` dimension prefix).
fn array_body(text: &str) -> std::result::Result<&str, String> {
    let text = text.trim();
    let text = if text.starts_with('[') {
        text.split_once('=')
            .map(|(_, rest)| rest)
            .ok_or_else(|| format!("malformed array dimensions in {:?}", text))?
    } else {
        text
    };

    text.strip_prefix('{')
        .and_then(|t| t.strip_suffix('}'))
        .ok_or_else(|| format!("array literal must be enclosed in braces: {:?}", text))
}

/// Count top-level elements without allocating.
fn count_elements(inner: &str) -> std::result::Result<usize, String> {
    if inner.trim().is_empty() {
        return Ok(0);
    }

    let mut count = 1;
    let mut in_quotes = false;
    let mut escaped = false;

    for c in inner.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => count += 1,
            '{' | '}' if !in_quotes => {
                return Err("multi-dimensional arrays are not supported".to_string())
            }
            _ => {}
        }
    }

    if in_quotes {
        return Err("unterminated quoted array element".to_string());
    }

    Ok(count)
}

/// Left-to-right splitter over the body of an array literal.
struct Elements<'a> {
    rest: &'a str,
    finished: bool,
}

impl<'a> Elements<'a> {
    fn new(inner: &'a str) -> Self {
        Self {
            rest: inner,
            finished: inner.trim().is_empty(),
        }
    }

    fn next_element(&mut self) -> std::result::Result<Option<Cow<'a, str>>, String> {
        if self.finished {
            return Ok(None);
        }

        let rest = self.rest.trim_start();

        if let Some(body) = rest.strip_prefix('"') {
            // Borrow unless an escape forces a copy
            let mut owned: Option<String> = None;
            let mut escaped = false;
            let mut end = None;

            for (i, c) in body.char_indices() {
                if escaped {
                    if let Some(s) = owned.as_mut() {
                        s.push(c);
                    }
                    escaped = false;
                    continue;
                }
                match c {
                    '\\' => {
                        if owned.is_none() {
                            owned = Some(body[..i].to_string());
                        }
                        escaped = true;
                    }
                    '"' => {
                        end = Some(i);
                        break;
                    }
                    _ => {
                        if let Some(s) = owned.as_mut() {
                            s.push(c);
                        }
                    }
                }
            }

            let end = end.ok_or_else(|| "unterminated quoted array element".to_string())?;
            let value = match owned {
                Some(s) => Cow::Owned(s),
                None => Cow::Borrowed(&body[..end]),
            };

            let after = body[end + 1..].trim_start();
            if after.is_empty() {
                self.finished = true;
            } else if let Some(next) = after.strip_prefix(',') {
                self.rest = next;
            } else {
                return Err(format!("unexpected text after quoted element: {:?}", after));
            }

            return Ok(Some(value));
        }

        let (raw, after) = match rest.find(',') {
            Some(i) => (&rest[..i], Some(&rest[i + 1..])),
            None => (rest, None),
        };

        if raw.contains(['{', '}', '"']) {
            return Err(format!("malformed array element {:?}", raw));
        }

        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("NULL") {
            return Err("array contains a null element".to_string());
        }

        match after {
            Some(next) => self.rest = next,
            None => self.finished = true,
        }

        Ok(Some(Cow::Borrowed(raw)))
    }
}

impl<'a> Iterator for Elements<'a> {
    type Item = std::result::Result<Cow<'a, str>, String>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_element() {
            Ok(Some(element)) => Some(Ok(element)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
