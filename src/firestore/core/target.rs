use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::firestore::model::{Document, DocumentKey, FieldPath, ResourcePath};
use crate::firestore::value::{FirestoreValue, TypeOrder, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThanOrEqual,
    GreaterThan,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::GreaterThanOrEqual => ">=",
            Operator::GreaterThan => ">",
            Operator::ArrayContains => "array-contains",
            Operator::ArrayContainsAny => "array-contains-any",
            Operator::In => "in",
            Operator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            Operator::LessThan
                | Operator::LessThanOrEqual
                | Operator::GreaterThan
                | Operator::GreaterThanOrEqual
                | Operator::NotEqual
                | Operator::NotIn
        )
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self {
            Operator::LessThan => ordering == Ordering::Less,
            Operator::LessThanOrEqual => ordering != Ordering::Greater,
            Operator::Equal => ordering == Ordering::Equal,
            Operator::NotEqual => ordering != Ordering::Equal,
            Operator::GreaterThan => ordering == Ordering::Greater,
            Operator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }
}

/// `field <op> value`. Filters on `__name__` take reference values holding
/// the document path.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: FieldPath,
    op: Operator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: Operator, value: FirestoreValue) -> Self {
        Self { field, op, value }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn op(&self) -> Operator {
        self.op
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn is_inequality(&self) -> bool {
        self.op.is_inequality()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        if self.field.is_key_field() {
            return self.matches_key(doc.key());
        }
        let Some(other) = doc.field(&self.field) else {
            return false;
        };

        match self.op {
            Operator::ArrayContains => other
                .as_array()
                .is_some_and(|array| array.contains(&self.value)),
            Operator::ArrayContainsAny => match (other.as_array(), self.value.as_array()) {
                (Some(array), Some(needles)) => {
                    needles.values().iter().any(|needle| array.contains(needle))
                }
                _ => false,
            },
            Operator::In => self
                .value
                .as_array()
                .is_some_and(|values| values.values().iter().any(|v| v.compare(other).is_eq())),
            Operator::NotIn => match self.value.as_array() {
                Some(values) if !values.values().iter().any(FirestoreValue::is_null) => {
                    !values.values().iter().any(|v| v.compare(other).is_eq())
                }
                _ => false,
            },
            Operator::NotEqual => self.op.matches_comparison(other.compare(&self.value)),
            _ => {
                other.type_order() == self.value.type_order()
                    && self.op.matches_comparison(other.compare(&self.value))
            }
        }
    }

    fn matches_key(&self, key: &DocumentKey) -> bool {
        match self.op {
            Operator::In | Operator::NotIn => {
                let listed = self.value.as_array().is_some_and(|values| {
                    values
                        .values()
                        .iter()
                        .filter_map(reference_key)
                        .any(|candidate| &candidate == key)
                });
                listed == (self.op == Operator::In)
            }
            _ => match reference_key(&self.value) {
                Some(expected) => self.op.matches_comparison(key.cmp(&expected)),
                None => false,
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.as_str(),
            self.value.canonical_id()
        )
    }
}

pub(crate) fn reference_key(value: &FirestoreValue) -> Option<DocumentKey> {
    match value.kind() {
        ValueKind::Reference(path) => DocumentKey::from_string(path).ok(),
        _ => None,
    }
}

/// Reference value used to filter or order on `__name__`.
pub fn key_value(key: &DocumentKey) -> FirestoreValue {
    FirestoreValue::from_reference(key.path().canonical_string())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn flip(self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OrderBy {
    field: FieldPath,
    direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn ascending(field: FieldPath) -> Self {
        Self::new(field, Direction::Ascending)
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn flipped(&self) -> Self {
        Self::new(self.field.clone(), self.direction.flip())
    }

    /// Compares two documents on this ordering alone.
    pub fn compare(&self, left: &Document, right: &Document) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => l.compare(r),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            }
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }

    pub fn canonical_id(&self) -> String {
        let direction = match self.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        format!("{}{}", self.field.canonical_string(), direction)
    }
}

/// Query cursor. `before` means the position itself sorts after the bound
/// (`start_at` / `end_before`); otherwise it sorts before (`start_after` / `end_at`).
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    position: Vec<FirestoreValue>,
    before: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, before: bool) -> Self {
        Self { position, before }
    }

    pub fn position(&self) -> &[FirestoreValue] {
        &self.position
    }

    pub fn before(&self) -> bool {
        self.before
    }

    /// True when the bound lies before `doc` under `order_by`.
    pub fn sorts_before_document(&self, order_by: &[OrderBy], doc: &Document) -> bool {
        let mut comparison = Ordering::Equal;
        for (component, order) in self.position.iter().zip(order_by) {
            comparison = if order.field().is_key_field() {
                match reference_key(component) {
                    Some(key) => key.cmp(doc.key()),
                    None => component.type_order().cmp(&TypeOrder::Reference),
                }
            } else {
                match doc.field(order.field()) {
                    Some(value) => component.compare(value),
                    None => Ordering::Greater,
                }
            };
            if order.direction() == Direction::Descending {
                comparison = comparison.reverse();
            }
            if comparison != Ordering::Equal {
                break;
            }
        }
        if self.before {
            comparison != Ordering::Greater
        } else {
            comparison == Ordering::Less
        }
    }

    pub fn canonical_id(&self) -> String {
        let position: Vec<String> = self.position.iter().map(FirestoreValue::canonical_id).collect();
        format!("{}:{}", if self.before { "b" } else { "a" }, position.join(","))
    }
}

/// What the backend watches: the server-side half of a query.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub order_by: Vec<OrderBy>,
    pub filters: Vec<FieldFilter>,
    pub limit: Option<i64>,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Target {
    /// Target watching a single document.
    pub fn for_document(key: &DocumentKey) -> Self {
        Self {
            path: key.path().clone(),
            collection_group: None,
            order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            start_at: None,
            end_at: None,
        }
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    /// Stable textual identity; equal targets have equal canonical ids.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_id());
        }
        id.push_str("|ob:");
        for order in &self.order_by {
            id.push_str(&order.canonical_id());
        }
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
        }
        if let Some(bound) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(&bound.canonical_id());
        }
        if let Some(bound) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(&bound.canonical_id());
        }
        id
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Target({})", self.canonical_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::SnapshotVersion;
    use crate::firestore::value::ObjectValue;

    fn doc(path: &str, field: &str, value: FirestoreValue) -> Document {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_dot_separated(field).unwrap(), value);
        Document::synced(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            data,
        )
    }

    fn filter(field: &str, op: Operator, value: FirestoreValue) -> FieldFilter {
        FieldFilter::new(FieldPath::from_dot_separated(field).unwrap(), op, value)
    }

    #[test]
    fn comparison_filters_require_matching_types() {
        let d = doc("c/a", "n", 5i64.into());
        assert!(filter("n", Operator::GreaterThan, 1.5f64.into()).matches(&d));
        assert!(!filter("n", Operator::GreaterThan, "a".into()).matches(&d));
        assert!(filter("n", Operator::Equal, 5.0f64.into()).matches(&d));
        assert!(filter("n", Operator::NotEqual, "a".into()).matches(&d));
        assert!(!filter("missing", Operator::NotEqual, 1i64.into()).matches(&d));
    }

    #[test]
    fn array_and_membership_filters() {
        let d = doc("c/a", "tags", FirestoreValue::from_array(vec!["x".into(), "y".into()]));
        assert!(filter("tags", Operator::ArrayContains, "x".into()).matches(&d));
        assert!(filter(
            "tags",
            Operator::ArrayContainsAny,
            FirestoreValue::from_array(vec!["z".into(), "y".into()])
        )
        .matches(&d));

        let n = doc("c/b", "n", 2i64.into());
        let list = FirestoreValue::from_array(vec![1i64.into(), 2i64.into()]);
        assert!(filter("n", Operator::In, list.clone()).matches(&n));
        assert!(!filter("n", Operator::NotIn, list).matches(&n));
        let with_null = FirestoreValue::from_array(vec![FirestoreValue::null()]);
        assert!(!filter("n", Operator::NotIn, with_null).matches(&n));
    }

    #[test]
    fn key_filters_compare_document_keys() {
        let d = doc("c/b", "n", 1i64.into());
        let key_filter = FieldFilter::new(
            FieldPath::document_id(),
            Operator::GreaterThan,
            key_value(&DocumentKey::from_string("c/a").unwrap()),
        );
        assert!(key_filter.matches(&d));
    }

    #[test]
    fn bounds_respect_before_flag() {
        let order = vec![OrderBy::ascending(FieldPath::from_single("n"))];
        let d = doc("c/a", "n", 5i64.into());
        assert!(Bound::new(vec![5i64.into()], true).sorts_before_document(&order, &d));
        assert!(!Bound::new(vec![5i64.into()], false).sorts_before_document(&order, &d));
        assert!(Bound::new(vec![4i64.into()], false).sorts_before_document(&order, &d));
    }

    #[test]
    fn canonical_ids_distinguish_targets() {
        let mut target = Target::for_document(&DocumentKey::from_string("c/a").unwrap());
        assert!(target.is_document_query());
        let plain = target.canonical_id();
        target.limit = Some(2);
        assert_ne!(plain, target.canonical_id());
        assert!(target.canonical_id().ends_with("|l:2"));
    }
}
