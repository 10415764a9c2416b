//! Query parameters and their wire-text marshaling.
//!
//! A [`Param`] is validated when it is built: a missing scalar value, an empty
//! string, or an array holding a missing element produce [`Param::Invalid`],
//! which [`marshal`] rejects before anything reaches the wire.
//!
//! Encoding rules:
//! - integers and floats use locale-independent formatting
//! - booleans render as `true` / `false`
//! - strings pass through verbatim
//! - null renders as the literal token `null`
//! - arrays render as `{e1,e2,...}` using the same per-element rules

use std::fmt::Write;

use smallvec::SmallVec;

use crate::error::{DbError, Result};
use crate::types::BaseType;

/// Marshaled parameters, inline for the common short parameter list.
pub type WireParams = SmallVec<[String; 8]>;

/// A single non-null value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Boolean(bool),
    Float(f64),
    String(String),
}

impl Value {
    pub fn base_type(&self) -> BaseType {
        match self {
            Value::Integer(_) => BaseType::Integer,
            Value::Boolean(_) => BaseType::Boolean,
            Value::Float(_) => BaseType::Float,
            Value::String(_) => BaseType::String,
        }
    }
}

/// A query parameter: the variant carries both the base type and array-ness.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Null,
    Scalar(Value),
    Array { base: BaseType, elements: Vec<Value> },
    /// Built from a missing value; rejected by [`marshal`].
    Invalid(&'static str),
}

impl Param {
    /// Explicit null parameter.
    pub fn null() -> Self {
        Param::Null
    }

    /// Scalar parameter. `None` or an empty string yields [`Param::Invalid`].
    pub fn new<T: ParamValue>(value: T) -> Self {
        match value.into_value() {
            Some(v) => Param::Scalar(v),
            None => Param::Invalid("scalar value is null or empty"),
        }
    }

    /// Array parameter. Any missing element yields [`Param::Invalid`].
    pub fn array<I>(items: I) -> Self
    where
        I: IntoIterator,
        I::Item: ParamValue,
    {
        let elements: Option<Vec<Value>> = items.into_iter().map(ParamValue::into_value).collect();
        match elements {
            Some(elements) => Param::Array {
                base: <I::Item as ParamValue>::BASE,
                elements,
            },
            None => Param::Invalid("array contains a null element"),
        }
    }

    /// Number of elements (0 for scalars and null).
    pub fn count(&self) -> usize {
        match self {
            Param::Array { elements, .. } => elements.len(),
            _ => 0,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        !matches!(self, Param::Invalid(_))
    }
}

/// Rust values accepted by the parameter constructors.
pub trait ParamValue {
    const BASE: BaseType;

    /// `None` marks the value as missing.
    fn into_value(self) -> Option<Value>;
}

macro_rules! integer_param {
    ($($t:ty),*) => {
        $(
            impl ParamValue for $t {
                const BASE: BaseType = BaseType::Integer;

                fn into_value(self) -> Option<Value> {
                    Some(Value::Integer(i64::from(self)))
                }
            }
        )*
    };
}

integer_param!(i8, i16, i32, i64, u8, u16, u32);

impl ParamValue for f64 {
    const BASE: BaseType = BaseType::Float;

    fn into_value(self) -> Option<Value> {
        Some(Value::Float(self))
    }
}

impl ParamValue for f32 {
    const BASE: BaseType = BaseType::Float;

    fn into_value(self) -> Option<Value> {
        Some(Value::Float(f64::from(self)))
    }
}

impl ParamValue for bool {
    const BASE: BaseType = BaseType::Boolean;

    fn into_value(self) -> Option<Value> {
        Some(Value::Boolean(self))
    }
}

impl ParamValue for String {
    const BASE: BaseType = BaseType::String;

    fn into_value(self) -> Option<Value> {
        if self.is_empty() {
            None
        } else {
            Some(Value::String(self))
        }
    }
}

impl<'a> ParamValue for &'a str {
    const BASE: BaseType = BaseType::String;

    fn into_value(self) -> Option<Value> {
        if self.is_empty() {
            None
        } else {
            Some(Value::String(self.to_owned()))
        }
    }
}

impl<T: ParamValue> ParamValue for Option<T> {
    const BASE: BaseType = T::BASE;

    fn into_value(self) -> Option<Value> {
        self.and_then(ParamValue::into_value)
    }
}

// ============================================================================
// Marshaling
// ============================================================================

/// Convert parameters into the backend's textual parameter encoding.
///
/// Fails fast with an `invalid_type` error on the first invalid parameter.
pub fn marshal(params: &[Param]) -> Result<WireParams> {
    let mut wire = WireParams::with_capacity(params.len());

    for (index, param) in params.iter().enumerate() {
        let mut text = String::new();
        match param {
            Param::Invalid(reason) => return Err(DbError::InvalidParam { index, reason }),
            Param::Null => text.push_str("null"),
            Param::Scalar(value) => encode_value(value, false, &mut text),
            Param::Array { elements, .. } => {
                text.push('{');
                for (i, element) in elements.iter().enumerate() {
                    if i != 0 {
                        text.push(',');
                    }
                    encode_value(element, true, &mut text);
                }
                text.push('}');
            }
        }
        wire.push(text);
    }

    Ok(wire)
}

fn encode_value(value: &Value, in_array: bool, out: &mut String) {
    match value {
        Value::Integer(v) => {
            let _ = write!(out, "{}", v);
        }
        Value::Boolean(v) => out.push_str(if *v { "true" } else { "false" }),
        Value::Float(v) => encode_float(*v, out),
        Value::String(s) if in_array && needs_quotes(s) => {
            out.push('"');
            for c in s.chars() {
                if c == '"' || c == '\\' {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push('"');
        }
        Value::String(s) => out.push_str(s),
    }
}

fn encode_float(v: f64, out: &mut String) {
    if v.is_nan() {
        out.push_str("NaN");
    } else if v.is_infinite() {
        out.push_str(if v > 0.0 { "Infinity" } else { "-Infinity" });
    } else {
        let _ = write!(out, "{}", v);
    }
}

/// Array elements that would not re-parse verbatim must be quoted.
fn needs_quotes(s: &str) -> bool {
    s.is_empty()
        || s.eq_ignore_ascii_case("null")
        || s
            .chars()
            .any(|c| matches!(c, '{' | '}' | ',' | '"' | '\\') || c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_encoding() {
        let params = [
            Param::new(42i32),
            Param::new(true),
            Param::new(false),
            Param::new(1.5f64),
            Param::new("hello world"),
            Param::null(),
        ];
        let wire = marshal(&params).unwrap();
        assert_eq!(
            wire.as_slice(),
            ["42", "true", "false", "1.5", "hello world", "null"]
        );
    }

    #[test]
    fn test_float_formatting_is_round_trip() {
        let wire = marshal(&[Param::new(0.1f64), Param::new(-2.0f64), Param::new(f64::NAN)]).unwrap();
        assert_eq!(wire[0], "0.1");
        assert_eq!(wire[1], "-2");
        assert_eq!(wire[2], "NaN");
        assert_eq!(wire[0].parse::<f64>().unwrap(), 0.1);
    }

    #[test]
    fn test_array_encoding() {
        let wire = marshal(&[
            Param::array(vec![1i64, 2, 3]),
            Param::array(vec!["c#", "c++", "c"]),
            Param::array(vec![true, false]),
            Param::array(Vec::<i64>::new()),
        ])
        .unwrap();
        assert_eq!(wire[0], "{1,2,3}");
        assert_eq!(wire[1], "{c#,c++,c}");
        assert_eq!(wire[2], "{true,false}");
        assert_eq!(wire[3], "{}");
    }

    #[test]
    fn test_array_elements_use_their_own_index() {
        // Each element must come from its own position, never from the
        // parameter's position in the list.
        let wire = marshal(&[
            Param::new("first"),
            Param::array(vec![10i64, 20, 30]),
            Param::array(vec!["x", "y"]),
        ])
        .unwrap();
        assert_eq!(wire[1], "{10,20,30}");
        assert_eq!(wire[2], "{x,y}");
    }

    #[test]
    fn test_array_string_quoting() {
        let wire = marshal(&[Param::array(vec!["a b", "x,y", "NULL", "q\"uote", "plain"])]).unwrap();
        assert_eq!(wire[0], r#"{"a b","x,y","NULL","q\"uote",plain}"#);
    }

    #[test]
    fn test_marshaled_arrays_reparse_to_the_same_elements() {
        use crate::decoder::parse_array;
        use crate::result::Cell;

        let strings = vec!["a\\b", "NULL", "x,y", "{br}", "q\"", " lead", "tab\there", "plain"];
        let integers = vec![-3i64, 0, 42, i64::MAX];
        let floats = vec![0.1f64, -2.5, 1e10, 3.0];
        let bools = vec![true, false, false, true];

        let wire = marshal(&[
            Param::array(strings.clone()),
            Param::array(integers.clone()),
            Param::array(floats.clone()),
            Param::array(bools.clone()),
        ])
        .unwrap();

        let expected_strings: Vec<String> = strings.iter().map(|s| s.to_string()).collect();
        assert_eq!(
            parse_array(&wire[0], BaseType::String).unwrap(),
            Cell::StringArray(expected_strings)
        );
        assert_eq!(
            parse_array(&wire[1], BaseType::Integer).unwrap(),
            Cell::IntegerArray(integers)
        );
        assert_eq!(
            parse_array(&wire[2], BaseType::Float).unwrap(),
            Cell::FloatArray(floats)
        );
        assert_eq!(
            parse_array(&wire[3], BaseType::Boolean).unwrap(),
            Cell::BooleanArray(bools)
        );
    }

    #[test]
    fn test_invalid_params_are_rejected() {
        assert!(!Param::new(None::<i64>).is_valid());
        assert!(!Param::new("").is_valid());
        assert!(!Param::array(vec![Some(1i64), None]).is_valid());
        assert!(Param::array(vec![Some(1i64), Some(2)]).is_valid());

        let err = marshal(&[Param::new(1i32), Param::new(String::new())]).unwrap_err();
        match err {
            DbError::InvalidParam { index, .. } => assert_eq!(index, 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_param_count_and_base() {
        let p = Param::array(vec![1.0f32, 2.0]);
        assert_eq!(p.count(), 2);
        assert!(matches!(p, Param::Array { base: BaseType::Float, .. }));
        assert_eq!(Param::new(7u8).count(), 0);
    }
}
