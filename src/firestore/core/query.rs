use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::firestore::core::target::{Bound, Direction, FieldFilter, OrderBy, Target};
use crate::firestore::model::{Document, DocumentKey, FieldPath, ResourcePath};
use crate::util::Comparator;

/// Which end of the result set a limit keeps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitType {
    First,
    Last,
}

/// A client query: a [`Target`] plus the client-only limit semantics.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    explicit_order_by: Vec<OrderBy>,
    filters: Vec<FieldFilter>,
    limit: Option<i64>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    pub fn new(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            explicit_order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    /// Query across every collection named `collection_id` below `parent`.
    pub fn collection_group(parent: ResourcePath, collection_id: impl Into<String>) -> Self {
        let mut query = Self::new(parent);
        query.collection_group = Some(collection_id.into());
        query
    }

    pub fn for_document(key: &DocumentKey) -> Self {
        Self::new(key.path().clone())
    }

    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_by.push(order_by);
        self
    }

    pub fn with_limit_to_first(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn with_limit_to_last(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn without_limit(mut self) -> Self {
        self.limit = None;
        self.limit_type = LimitType::First;
        self
    }

    pub fn with_start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn with_end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// Query for a target known only from persistence. The limit type is
    /// lost, so limit-to-last targets come back as limit-to-first.
    pub fn from_target(target: Target) -> Self {
        Self {
            path: target.path,
            collection_group: target.collection_group,
            explicit_order_by: target.order_by,
            filters: target.filters,
            limit: target.limit,
            limit_type: LimitType::First,
            start_at: target.start_at,
            end_at: target.end_at,
        }
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    /// Collection id whose changed documents can affect this query.
    pub fn changed_collection_group(&self) -> String {
        if let Some(group) = &self.collection_group {
            return group.clone();
        }
        let len = self.path.len();
        let index = if len % 2 == 1 { len - 1 } else { len.saturating_sub(2) };
        self.path.get(index).unwrap_or_default().to_string()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<i64> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn has_limit_to_first(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::First
    }

    pub fn has_limit_to_last(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::Last
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// True for a plain collection scan with no filtering, limit or cursors.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field().is_key_field()))
    }

    /// Field of the first inequality filter, if any.
    pub fn inequality_field(&self) -> Option<&FieldPath> {
        self.filters
            .iter()
            .find(|filter| filter.is_inequality())
            .map(FieldFilter::field)
    }

    /// Explicit orderings, then the inequality field when not already
    /// ordered, then `__name__` in the direction of the last ordering.
    pub fn order_by(&self) -> Vec<OrderBy> {
        let mut order_by = self.explicit_order_by.clone();
        if let Some(field) = self.inequality_field() {
            if !field.is_key_field() && !order_by.iter().any(|order| order.field() == field) {
                order_by.push(OrderBy::ascending(field.clone()));
            }
        }
        if !order_by.iter().any(|order| order.field().is_key_field()) {
            let direction = order_by
                .last()
                .map(OrderBy::direction)
                .unwrap_or(Direction::Ascending);
            order_by.push(OrderBy::new(FieldPath::document_id(), direction));
        }
        order_by
    }

    /// The backend target. Limit-to-last queries flip every ordering and
    /// swap their cursors so the backend returns the tail.
    pub fn to_target(&self) -> Target {
        let order_by = self.order_by();
        match self.limit_type {
            LimitType::First => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                order_by,
                filters: self.filters.clone(),
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            },
            LimitType::Last => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                order_by: order_by.iter().map(OrderBy::flipped).collect(),
                filters: self.filters.clone(),
                limit: self.limit,
                start_at: self
                    .end_at
                    .as_ref()
                    .map(|bound| Bound::new(bound.position().to_vec(), !bound.before())),
                end_at: self
                    .start_at
                    .as_ref()
                    .map(|bound| Bound::new(bound.position().to_vec(), !bound.before())),
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{limit_type}", self.to_target().canonical_id())
    }

    /// Collection query for one concrete collection of a collection group.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        let mut query = self.clone();
        query.path = path;
        query.collection_group = None;
        query
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.matches_path(doc)
            && self.matches_order_by(doc)
            && self.filters.iter().all(|filter| filter.matches(doc))
            && self.matches_bounds(doc)
    }

    fn matches_path(&self, doc: &Document) -> bool {
        let doc_path = doc.key().path();
        match &self.collection_group {
            Some(group) => doc.key().has_collection_id(group) && self.path.is_prefix_of(doc_path),
            None if DocumentKey::is_document_key(&self.path) => &self.path == doc_path,
            None => self.path.is_immediate_parent_of(doc_path),
        }
    }

    fn matches_order_by(&self, doc: &Document) -> bool {
        self.order_by()
            .iter()
            .all(|order| order.field().is_key_field() || doc.field(order.field()).is_some())
    }

    fn matches_bounds(&self, doc: &Document) -> bool {
        let order_by = self.order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, doc) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if end.sorts_before_document(&order_by, doc) {
                return false;
            }
        }
        true
    }

    /// Orders documents by the normalized orderings; always total because
    /// the last ordering is on the document key.
    pub fn comparator(&self) -> Comparator<Document> {
        let order_by = self.order_by();
        Arc::new(move |left: &Document, right: &Document| {
            order_by
                .iter()
                .map(|order| order.compare(left, right))
                .find(|ordering| *ordering != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        })
    }
}

impl Display for Query {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Query({})", self.canonical_id())
    }
}
