use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use crate::util::sorted_map::{Comparator, SortedMap, SortedMapIter};

/// Persistent sorted set layered over [`SortedMap`].
pub struct SortedSet<T> {
    data: SortedMap<T, ()>,
}

impl<T> Clone for SortedSet<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
        }
    }
}

impl<T: Ord + Clone + 'static> Default for SortedSet<T> {
    fn default() -> Self {
        Self {
            data: SortedMap::default(),
        }
    }
}

impl<T: Clone> SortedSet<T> {
    pub fn new(comparator: Comparator<T>) -> Self {
        Self {
            data: SortedMap::new(comparator),
        }
    }

    pub fn has(&self, value: &T) -> bool {
        self.data.contains_key(value)
    }

    pub fn first(&self) -> Option<&T> {
        self.data.min_key()
    }

    pub fn last(&self) -> Option<&T> {
        self.data.max_key()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn index_of(&self, value: &T) -> Option<usize> {
        self.data.index_of(value)
    }

    pub fn add(&self, value: T) -> Self {
        Self {
            data: self.data.insert(value, ()),
        }
    }

    pub fn delete(&self, value: &T) -> Self {
        if !self.has(value) {
            return self.clone();
        }
        Self {
            data: self.data.remove(value),
        }
    }

    pub fn union_with(&self, other: &SortedSet<T>) -> Self {
        let (mut result, smaller) = if self.len() >= other.len() {
            (self.clone(), other)
        } else {
            (other.clone(), self)
        };
        for value in smaller.iter() {
            result = result.add(value.clone());
        }
        result
    }

    pub fn iter(&self) -> SortedSetIter<'_, T> {
        SortedSetIter {
            inner: self.data.iter(),
        }
    }

    pub fn iter_from<'a>(&'a self, value: &T) -> SortedSetIter<'a, T> {
        SortedSetIter {
            inner: self.data.iter_from(value),
        }
    }

    pub fn reverse_iter(&self) -> SortedSetIter<'_, T> {
        SortedSetIter {
            inner: self.data.reverse_iter(),
        }
    }

    pub fn comparator(&self) -> &Comparator<T> {
        self.data.comparator()
    }

    /// Structural equality under the set's own ordering.
    pub fn is_equal(&self, other: &SortedSet<T>) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let comparator = Arc::clone(self.comparator());
        self.iter()
            .zip(other.iter())
            .all(|(left, right)| comparator(left, right).is_eq())
    }
}

impl<T: Clone> PartialEq for SortedSet<T> {
    fn eq(&self, other: &Self) -> bool {
        self.is_equal(other)
    }
}

impl<T: Ord + Clone + 'static> FromIterator<T> for SortedSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        iter.into_iter()
            .fold(SortedSet::default(), |set, value| set.add(value))
    }
}

impl<T: Clone + Debug> Debug for SortedSet<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

pub struct SortedSetIter<'a, T> {
    inner: SortedMapIter<'a, T, ()>,
}

impl<'a, T> Iterator for SortedSetIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(key, _)| key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_delete_and_union() {
        let left: SortedSet<i32> = [3, 1, 2].into_iter().collect();
        let right: SortedSet<i32> = [2, 5].into_iter().collect();
        let union = left.union_with(&right);
        assert_eq!(union.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3, 5]);

        let trimmed = union.delete(&3);
        assert!(!trimmed.has(&3));
        assert!(union.has(&3));
        assert_eq!(trimmed.first(), Some(&1));
        assert_eq!(trimmed.last(), Some(&5));
    }

    #[test]
    fn equality_ignores_insertion_order() {
        let a: SortedSet<i32> = [1, 2, 3].into_iter().collect();
        let b: SortedSet<i32> = [3, 2, 1].into_iter().collect();
        assert!(a.is_equal(&b));
        assert!(!a.is_equal(&b.delete(&2)));
    }
}
