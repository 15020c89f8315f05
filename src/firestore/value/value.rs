use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::firestore::model::{GeoPoint, Timestamp};
use crate::firestore::value::{ArrayValue, BytesValue, MapValue};

/// A single field value inside a document.
///
/// Equality and ordering follow the backend's rules rather than Rust's
/// numeric defaults: `NaN` equals `NaN`, `-0.0` and `0.0` are distinct under
/// equality but sort together, and integers never equal doubles even when
/// they sort as equal.
#[derive(Clone, Debug)]
pub struct FirestoreValue {
    kind: ValueKind,
}

#[derive(Clone, Debug)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    /// Locally applied server timestamp that the backend has not resolved yet.
    ServerTimestamp {
        local_write_time: Timestamp,
        previous_value: Option<Box<FirestoreValue>>,
    },
    String(String),
    Bytes(BytesValue),
    /// Path of another document in the same database, e.g. `rooms/a`.
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
}

/// Cross-type precedence used when ordering values of different kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeOrder {
    Null = 0,
    Boolean = 1,
    Number = 2,
    Timestamp = 3,
    ServerTimestamp = 4,
    String = 5,
    Bytes = 6,
    Reference = 7,
    GeoPoint = 8,
    Array = 9,
    Map = 10,
}

impl FirestoreValue {
    pub fn null() -> Self {
        Self {
            kind: ValueKind::Null,
        }
    }

    pub fn from_bool(value: bool) -> Self {
        Self {
            kind: ValueKind::Boolean(value),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            kind: ValueKind::Integer(value),
        }
    }

    pub fn from_double(value: f64) -> Self {
        Self {
            kind: ValueKind::Double(value),
        }
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self {
            kind: ValueKind::Timestamp(value),
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(value.into()),
        }
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self {
            kind: ValueKind::Bytes(value),
        }
    }

    pub fn from_reference(path: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::Reference(path.into()),
        }
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self {
            kind: ValueKind::GeoPoint(value),
        }
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Array(ArrayValue::new(values)),
        }
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Map(MapValue::new(map)),
        }
    }

    /// Placeholder written by a local server-timestamp transform. The previous
    /// value is kept so callers may choose to show it until the write commits;
    /// nested placeholders collapse to the original previous value.
    pub fn server_timestamp(
        local_write_time: Timestamp,
        previous_value: Option<FirestoreValue>,
    ) -> Self {
        let previous_value = previous_value.and_then(|previous| match previous.kind {
            ValueKind::ServerTimestamp { previous_value, .. } => previous_value.map(|v| *v),
            _ => Some(previous),
        });
        Self {
            kind: ValueKind::ServerTimestamp {
                local_write_time,
                previous_value: previous_value.map(Box::new),
            },
        }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn into_kind(self) -> ValueKind {
        self.kind
    }

    pub fn type_order(&self) -> TypeOrder {
        match &self.kind {
            ValueKind::Null => TypeOrder::Null,
            ValueKind::Boolean(_) => TypeOrder::Boolean,
            ValueKind::Integer(_) | ValueKind::Double(_) => TypeOrder::Number,
            ValueKind::Timestamp(_) => TypeOrder::Timestamp,
            ValueKind::ServerTimestamp { .. } => TypeOrder::ServerTimestamp,
            ValueKind::String(_) => TypeOrder::String,
            ValueKind::Bytes(_) => TypeOrder::Bytes,
            ValueKind::Reference(_) => TypeOrder::Reference,
            ValueKind::GeoPoint(_) => TypeOrder::GeoPoint,
            ValueKind::Array(_) => TypeOrder::Array,
            ValueKind::Map(_) => TypeOrder::Map,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    pub fn is_server_timestamp(&self) -> bool {
        matches!(self.kind, ValueKind::ServerTimestamp { .. })
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match &self.kind {
            ValueKind::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.kind {
            ValueKind::Integer(value) => Some(value as f64),
            ValueKind::Double(value) => Some(value),
            _ => None,
        }
    }

    /// Deterministic textual form used to build query canonical ids.
    pub fn canonical_id(&self) -> String {
        match &self.kind {
            ValueKind::Null => "null".to_string(),
            ValueKind::Boolean(value) => value.to_string(),
            ValueKind::Integer(value) => value.to_string(),
            ValueKind::Double(value) => format_double(*value),
            ValueKind::Timestamp(value) => {
                format!("time({},{})", value.seconds, value.nanos)
            }
            ValueKind::ServerTimestamp {
                local_write_time, ..
            } => format!(
                "serverTimestamp({},{})",
                local_write_time.seconds, local_write_time.nanos
            ),
            ValueKind::String(value) => value.clone(),
            ValueKind::Bytes(value) => value.to_base64(),
            ValueKind::Reference(value) => value.clone(),
            ValueKind::GeoPoint(value) => {
                format!("geo({},{})", value.latitude(), value.longitude())
            }
            ValueKind::Array(array) => {
                let parts: Vec<String> = array.values().iter().map(Self::canonical_id).collect();
                format!("[{}]", parts.join(","))
            }
            ValueKind::Map(map) => {
                let parts: Vec<String> = map
                    .fields()
                    .iter()
                    .map(|(key, value)| format!("{key}:{}", value.canonical_id()))
                    .collect();
                format!("{{{}}}", parts.join(","))
            }
        }
    }

    /// Total ordering across all value kinds.
    pub fn compare(&self, other: &Self) -> Ordering {
        let left_order = self.type_order();
        let right_order = other.type_order();
        if left_order != right_order {
            return left_order.cmp(&right_order);
        }

        match (&self.kind, &other.kind) {
            (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
            (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l.cmp(r),
            (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
            (
                ValueKind::ServerTimestamp {
                    local_write_time: l,
                    ..
                },
                ValueKind::ServerTimestamp {
                    local_write_time: r,
                    ..
                },
            ) => l.cmp(r),
            (ValueKind::String(l), ValueKind::String(r)) => l.cmp(r),
            (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.cmp(r),
            (ValueKind::Reference(l), ValueKind::Reference(r)) => compare_references(l, r),
            (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => {
                compare_doubles(l.latitude(), r.latitude())
                    .then_with(|| compare_doubles(l.longitude(), r.longitude()))
            }
            (ValueKind::Array(l), ValueKind::Array(r)) => {
                for (left, right) in l.values().iter().zip(r.values()) {
                    let ordering = left.compare(right);
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                l.values().len().cmp(&r.values().len())
            }
            (ValueKind::Map(l), ValueKind::Map(r)) => {
                for ((left_key, left), (right_key, right)) in l.fields().iter().zip(r.fields()) {
                    let ordering = left_key
                        .cmp(right_key)
                        .then_with(|| left.compare(right));
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                l.fields().len().cmp(&r.fields().len())
            }
            _ => compare_numbers(&self.kind, &other.kind),
        }
    }
}

fn format_double(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == 0.0 && value.is_sign_negative() {
        "-0".to_string()
    } else {
        value.to_string()
    }
}

fn compare_numbers(left: &ValueKind, right: &ValueKind) -> Ordering {
    match (left, right) {
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Double(r)) => compare_mixed(*l, *r),
        (ValueKind::Double(l), ValueKind::Integer(r)) => compare_mixed(*r, *l).reverse(),
        (ValueKind::Double(l), ValueKind::Double(r)) => compare_doubles(*l, *r),
        _ => Ordering::Equal,
    }
}

/// NaN sorts before every other number; `-0.0` and `0.0` sort as equal.
fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_mixed(integer: i64, double: f64) -> Ordering {
    if double.is_nan() {
        return Ordering::Greater;
    }
    compare_doubles(integer as f64, double).then_with(|| {
        // Both round to the same double: decide on the exact integer part.
        if double >= 9.223_372_036_854_776e18 {
            Ordering::Less
        } else if double < -9.223_372_036_854_776e18 {
            Ordering::Greater
        } else {
            integer.cmp(&(double as i64))
        }
    })
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let left_segments = left.split('/');
    let right_segments = right.split('/');
    left_segments.cmp(right_segments)
}

impl PartialEq for FirestoreValue {
    fn eq(&self, other: &Self) -> bool {
        match (&self.kind, &other.kind) {
            (ValueKind::Null, ValueKind::Null) => true,
            (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l == r,
            (ValueKind::Integer(l), ValueKind::Integer(r)) => l == r,
            (ValueKind::Double(l), ValueKind::Double(r)) => {
                (l.is_nan() && r.is_nan()) || l.to_bits() == r.to_bits()
            }
            (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l == r,
            (
                ValueKind::ServerTimestamp {
                    local_write_time: l,
                    ..
                },
                ValueKind::ServerTimestamp {
                    local_write_time: r,
                    ..
                },
            ) => l == r,
            (ValueKind::String(l), ValueKind::String(r)) => l == r,
            (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l == r,
            (ValueKind::Reference(l), ValueKind::Reference(r)) => l == r,
            (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => {
                l.latitude().to_bits() == r.latitude().to_bits()
                    && l.longitude().to_bits() == r.longitude().to_bits()
            }
            (ValueKind::Array(l), ValueKind::Array(r)) => l.values() == r.values(),
            (ValueKind::Map(l), ValueKind::Map(r)) => l.fields() == r.fields(),
            _ => false,
        }
    }
}

impl From<bool> for FirestoreValue {
    fn from(value: bool) -> Self {
        Self::from_bool(value)
    }
}

impl From<i64> for FirestoreValue {
    fn from(value: i64) -> Self {
        Self::from_integer(value)
    }
}

impl From<f64> for FirestoreValue {
    fn from(value: f64) -> Self {
        Self::from_double(value)
    }
}

impl From<&str> for FirestoreValue {
    fn from(value: &str) -> Self {
        Self::from_string(value)
    }
}

impl From<String> for FirestoreValue {
    fn from(value: String) -> Self {
        Self::from_string(value)
    }
}
