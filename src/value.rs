//! Dynamic values used for context substitution, parameters and rows.

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Name to value map used to fill `{name}` placeholders.
pub type Context = HashMap<String, DjaqValue>;

/// Dynamic value type for context entries, bound parameters and row cells.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DjaqValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    List(Vec<DjaqValue>),
}

impl DjaqValue {
    /// Whether the value counts as supplied when pruning conditions.
    ///
    /// Numeric zero and `false` are supplied; null, empty text and lists
    /// without any supplied element are not.
    pub fn is_present(&self) -> bool {
        match self {
            DjaqValue::Null => false,
            DjaqValue::Text(s) => !s.is_empty(),
            DjaqValue::List(items) => items.iter().any(DjaqValue::is_present),
            _ => true,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DjaqValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        use rust_decimal::prelude::ToPrimitive;
        match self {
            DjaqValue::Int(v) => Some(*v),
            DjaqValue::Float(v) => Some(*v as i64),
            DjaqValue::Decimal(v) => v.to_i64(),
            DjaqValue::Bool(v) => Some(*v as i64),
            DjaqValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DjaqValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Convert into a JSON value. Decimals keep their exact text.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for DjaqValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DjaqValue::Null => Ok(()),
            DjaqValue::Bool(v) => write!(f, "{}", v),
            DjaqValue::Int(v) => write!(f, "{}", v),
            DjaqValue::Float(v) => write!(f, "{}", v),
            DjaqValue::Decimal(v) => write!(f, "{}", v),
            DjaqValue::Text(v) => write!(f, "{}", v),
            DjaqValue::Date(v) => write!(f, "{}", v),
            DjaqValue::DateTime(v) => write!(f, "{}", v),
            DjaqValue::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

impl From<bool> for DjaqValue {
    fn from(v: bool) -> Self {
        DjaqValue::Bool(v)
    }
}

impl From<i32> for DjaqValue {
    fn from(v: i32) -> Self {
        DjaqValue::Int(v as i64)
    }
}

impl From<i64> for DjaqValue {
    fn from(v: i64) -> Self {
        DjaqValue::Int(v)
    }
}

impl From<u32> for DjaqValue {
    fn from(v: u32) -> Self {
        DjaqValue::Int(v as i64)
    }
}

impl From<f64> for DjaqValue {
    fn from(v: f64) -> Self {
        DjaqValue::Float(v)
    }
}

impl From<Decimal> for DjaqValue {
    fn from(v: Decimal) -> Self {
        DjaqValue::Decimal(v)
    }
}

impl From<&str> for DjaqValue {
    fn from(v: &str) -> Self {
        DjaqValue::Text(v.to_string())
    }
}

impl From<String> for DjaqValue {
    fn from(v: String) -> Self {
        DjaqValue::Text(v)
    }
}

impl From<NaiveDate> for DjaqValue {
    fn from(v: NaiveDate) -> Self {
        DjaqValue::Date(v)
    }
}

impl From<NaiveDateTime> for DjaqValue {
    fn from(v: NaiveDateTime) -> Self {
        DjaqValue::DateTime(v)
    }
}

impl<T: Into<DjaqValue>> From<Option<T>> for DjaqValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(DjaqValue::Null)
    }
}

impl<T: Into<DjaqValue>> From<Vec<T>> for DjaqValue {
    fn from(v: Vec<T>) -> Self {
        DjaqValue::List(v.into_iter().map(Into::into).collect())
    }
}

impl From<serde_json::Value> for DjaqValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => DjaqValue::Null,
            serde_json::Value::Bool(b) => DjaqValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => DjaqValue::Int(i),
                None => DjaqValue::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => DjaqValue::Text(s),
            serde_json::Value::Array(items) => {
                DjaqValue::List(items.into_iter().map(DjaqValue::from).collect())
            }
            other => DjaqValue::Text(other.to_string()),
        }
    }
}

/// Build a [`Context`] from `(name, value)` pairs.
///
/// ```
/// use djaq::value::{context, DjaqValue};
///
/// let ctx = context([("ids", DjaqValue::from(vec![1, 2, 3]))]);
/// assert_eq!(ctx.len(), 1);
/// ```
pub fn context<K, V, I>(pairs: I) -> Context
where
    K: Into<String>,
    V: Into<DjaqValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
