use std::cmp::Ordering;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use crate::firestore::model::{Document, DocumentKey};
use crate::util::{Comparator, SortedMap, SortedSet};

/// Documents of a query result: addressable by key, iterated in query order.
#[derive(Clone)]
pub struct DocumentSet {
    key_index: SortedMap<DocumentKey, Document>,
    sorted: SortedSet<Document>,
}

impl DocumentSet {
    /// `comparator` decides the iteration order; ties fall back to the key.
    pub fn new(comparator: Comparator<Document>) -> Self {
        let ordering: Comparator<Document> = Arc::new(move |left: &Document, right: &Document| {
            comparator(left, right).then_with(|| left.key().cmp(right.key()))
        });
        Self {
            key_index: SortedMap::default(),
            sorted: SortedSet::new(ordering),
        }
    }

    pub fn empty_by_key() -> Self {
        Self::new(Arc::new(|_: &Document, _: &Document| Ordering::Equal))
    }

    pub fn has(&self, key: &DocumentKey) -> bool {
        self.key_index.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.key_index.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.last()
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    /// Position of `key` in query order.
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let doc = self.key_index.get(key)?;
        self.sorted.index_of(doc)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> + '_ {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> + '_ {
        self.sorted.iter().map(Document::key)
    }

    /// Inserts `doc`, replacing any document with the same key.
    pub fn add(&self, doc: Document) -> Self {
        let set = self.delete(doc.key());
        Self {
            key_index: set.key_index.insert(doc.key().clone(), doc.clone()),
            sorted: set.sorted.add(doc),
        }
    }

    pub fn delete(&self, key: &DocumentKey) -> Self {
        let Some(existing) = self.key_index.get(key) else {
            return self.clone();
        };
        Self {
            key_index: self.key_index.remove(key),
            sorted: self.sorted.delete(existing),
        }
    }

    /// Same documents, same contents, same order.
    pub fn is_equal(&self, other: &DocumentSet) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(l, r)| l == r)
    }
}

impl Debug for DocumentSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}
