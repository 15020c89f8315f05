use crate::firestore::model::Timestamp;
use crate::firestore::value::{ArrayValue, FirestoreValue, ValueKind};

/// A field transform computed partly on the client and partly by the backend.
#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    /// Adds `operand` to the current value, treating non-numbers as zero.
    NumericIncrement(FirestoreValue),
}

impl TransformOperation {
    /// Result shown in the local view before the backend confirms the write.
    pub fn apply_to_local_view(
        &self,
        previous_value: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => {
                FirestoreValue::server_timestamp(local_write_time, previous_value.cloned())
            }
            TransformOperation::ArrayUnion(elements) => {
                coerce_to_array(previous_value).union(elements).into_value()
            }
            TransformOperation::ArrayRemove(elements) => {
                coerce_to_array(previous_value).remove(elements).into_value()
            }
            TransformOperation::NumericIncrement(operand) => {
                let base = self
                    .compute_base_value(previous_value)
                    .unwrap_or_else(|| FirestoreValue::from_integer(0));
                add_numbers(&base, operand)
            }
        }
    }

    /// Result once the backend acknowledged the write with `transform_result`.
    pub fn apply_to_remote_document(
        &self,
        previous_value: Option<&FirestoreValue>,
        transform_result: Option<&FirestoreValue>,
    ) -> FirestoreValue {
        match self {
            // Array transforms are deterministic, so the local computation is exact.
            TransformOperation::ArrayUnion(elements) => {
                coerce_to_array(previous_value).union(elements).into_value()
            }
            TransformOperation::ArrayRemove(elements) => {
                coerce_to_array(previous_value).remove(elements).into_value()
            }
            TransformOperation::ServerTimestamp | TransformOperation::NumericIncrement(_) => {
                transform_result.cloned().unwrap_or_else(FirestoreValue::null)
            }
        }
    }

    /// The value a non-idempotent transform must be replayed against, or
    /// `None` for idempotent transforms.
    pub fn compute_base_value(
        &self,
        previous_value: Option<&FirestoreValue>,
    ) -> Option<FirestoreValue> {
        match self {
            TransformOperation::NumericIncrement(_) => Some(match previous_value {
                Some(value) if value.is_number() => value.clone(),
                _ => FirestoreValue::from_integer(0),
            }),
            _ => None,
        }
    }

    pub fn is_idempotent(&self) -> bool {
        !matches!(self, TransformOperation::NumericIncrement(_))
    }
}

fn coerce_to_array(value: Option<&FirestoreValue>) -> ArrayValue {
    value
        .and_then(FirestoreValue::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Integer sums stay integral until they overflow, then continue as doubles
/// rather than saturating.
fn add_numbers(base: &FirestoreValue, operand: &FirestoreValue) -> FirestoreValue {
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(left), ValueKind::Integer(right)) => match left.checked_add(*right) {
            Some(sum) => FirestoreValue::from_integer(sum),
            None => FirestoreValue::from_double(*left as f64 + *right as f64),
        },
        _ => {
            let left = base.as_f64().unwrap_or(0.0);
            let right = operand.as_f64().unwrap_or(0.0);
            FirestoreValue::from_double(left + right)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_treats_missing_values_as_zero() {
        let op = TransformOperation::NumericIncrement(5i64.into());
        let time = Timestamp::new(0, 0);
        assert_eq!(op.apply_to_local_view(None, time), 5i64.into());
        assert_eq!(op.apply_to_local_view(Some(&"x".into()), time), 5i64.into());
        assert_eq!(
            op.apply_to_local_view(Some(&1.5f64.into()), time),
            FirestoreValue::from_double(6.5)
        );
    }

    #[test]
    fn increment_overflow_falls_back_to_double() {
        let op = TransformOperation::NumericIncrement(1i64.into());
        let result = op.apply_to_local_view(Some(&i64::MAX.into()), Timestamp::new(0, 0));
        assert!(matches!(result.kind(), ValueKind::Double(_)));
    }

    #[test]
    fn remote_results_replace_server_values() {
        let op = TransformOperation::ServerTimestamp;
        let server = FirestoreValue::from_timestamp(Timestamp::new(10, 0));
        assert_eq!(op.apply_to_remote_document(None, Some(&server)), server);

        let local = op.apply_to_local_view(Some(&1i64.into()), Timestamp::new(3, 0));
        assert!(local.is_server_timestamp());
    }

    #[test]
    fn array_transforms_are_computed_locally() {
        let previous = FirestoreValue::from_array(vec![1i64.into(), 2i64.into()]);
        let union = TransformOperation::ArrayUnion(vec![2i64.into(), 3i64.into()]);
        assert_eq!(
            union.apply_to_remote_document(Some(&previous), None),
            FirestoreValue::from_array(vec![1i64.into(), 2i64.into(), 3i64.into()])
        );
        let remove = TransformOperation::ArrayRemove(vec![1i64.into()]);
        assert_eq!(
            remove.apply_to_local_view(Some(&previous), Timestamp::new(0, 0)),
            FirestoreValue::from_array(vec![2i64.into()])
        );
        assert!(remove.compute_base_value(Some(&previous)).is_none());
    }
}
