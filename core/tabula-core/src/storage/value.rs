//! Scalar values and rows as they come back from the backing store.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A single cell value.
///
/// Serialized untagged so that rows round-trip as plain JSON objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum ScalarValue {
    #[default]
    Null,
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

static NULL: ScalarValue = ScalarValue::Null;

impl ScalarValue {
    /// Null or the empty string. Aggregates skip missing values.
    pub fn is_missing(&self) -> bool {
        match self {
            ScalarValue::Null => true,
            ScalarValue::Utf8(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Numeric coercion. Missing and non-numeric text yield `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Null => None,
            ScalarValue::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            ScalarValue::Int64(i) => Some(*i as f64),
            ScalarValue::Float64(f) if f.is_finite() => Some(*f),
            ScalarValue::Float64(_) => None,
            ScalarValue::Utf8(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    trimmed.parse::<f64>().ok().filter(|f| f.is_finite())
                }
            }
        }
    }

    /// Text form used for LIKE matching, group keys and text comparison.
    pub fn as_text(&self) -> String {
        match self {
            ScalarValue::Null => String::new(),
            ScalarValue::Boolean(b) => b.to_string(),
            ScalarValue::Int64(i) => i.to_string(),
            ScalarValue::Float64(f) => format_float(*f),
            ScalarValue::Utf8(s) => s.clone(),
        }
    }

    /// Equality used by `=`, `!=`, `IN`: numeric when both sides coerce,
    /// otherwise exact text. Missing values equal only missing values.
    pub fn loose_eq(&self, other: &ScalarValue) -> bool {
        match (self.is_missing(), other.is_missing()) {
            (true, true) => return true,
            (true, false) | (false, true) => return false,
            _ => {}
        }
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => self.as_text() == other.as_text(),
        }
    }

    /// Ordering used by `<`, `>` etc. `None` when either side is missing.
    pub fn partial_compare(&self, other: &ScalarValue) -> Option<Ordering> {
        if self.is_missing() || other.is_missing() {
            return None;
        }
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => Some(self.as_text().cmp(&other.as_text())),
        }
    }

    /// Total order for ORDER BY: Null < Boolean < numbers < text.
    ///
    /// Text that parses as a number sorts with the numbers, matching the
    /// coercion `partial_compare` and the aggregates apply.
    pub fn total_cmp(&self, other: &ScalarValue) -> Ordering {
        match (self, other) {
            (ScalarValue::Boolean(a), ScalarValue::Boolean(b)) => a.cmp(b),
            (ScalarValue::Int64(a), ScalarValue::Int64(b)) => a.cmp(b),
            _ => match (self.sort_number(), other.sort_number()) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                _ => match self.sort_rank().cmp(&other.sort_rank()) {
                    Ordering::Equal if self.sort_rank() == 3 => self.as_text().cmp(&other.as_text()),
                    ord => ord,
                },
            },
        }
    }

    fn sort_rank(&self) -> u8 {
        match self {
            _ if self.is_missing() => 0,
            ScalarValue::Boolean(_) => 1,
            _ if self.sort_number().is_some() => 2,
            _ => 3,
        }
    }

    /// Numeric view for sorting. Booleans stay in their own rank.
    fn sort_number(&self) -> Option<f64> {
        match self {
            ScalarValue::Int64(i) => Some(*i as f64),
            ScalarValue::Float64(f) => Some(*f),
            ScalarValue::Utf8(_) => self.as_f64(),
            ScalarValue::Null | ScalarValue::Boolean(_) => None,
        }
    }

    /// Name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            ScalarValue::Null => "null",
            ScalarValue::Boolean(_) => "boolean",
            ScalarValue::Int64(_) => "int64",
            ScalarValue::Float64(_) => "float64",
            ScalarValue::Utf8(_) => "utf8",
        }
    }
}

fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.is_finite() && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        f.to_string()
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => f.write_str("NULL"),
            other => f.write_str(&other.as_text()),
        }
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Int64(v)
    }
}

impl From<i32> for ScalarValue {
    fn from(v: i32) -> Self {
        ScalarValue::Int64(v as i64)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::Float64(v)
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        ScalarValue::Boolean(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        ScalarValue::Utf8(v.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        ScalarValue::Utf8(v)
    }
}

impl<T: Into<ScalarValue>> From<Option<T>> for ScalarValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(ScalarValue::Null)
    }
}

/// One row of a tenant table.
///
/// `position` is the 1-based row number inside the backing store table and
/// is what updates and deletes address. Freshly built rows have none. It
/// serializes as `_position` so that a user column named `position` keeps
/// its own key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Row {
    #[serde(rename = "_position", default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, ScalarValue>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn with_position(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }

    /// Field value; missing fields read as `Null`.
    pub fn get(&self, field: &str) -> &ScalarValue {
        self.fields.get(field).unwrap_or(&NULL)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<ScalarValue>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Row
where
    K: Into<String>,
    V: Into<ScalarValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Row {
            position: None,
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
