use std::cmp::Ordering;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use crate::util::assert::fail;

/// Shared ordering function used by [`SortedMap`] and [`SortedSet`](super::SortedSet).
pub type Comparator<K> = Arc<dyn Fn(&K, &K) -> Ordering + Send + Sync>;

const RED: bool = true;
const BLACK: bool = false;

type Link<K, V> = Option<Arc<Node<K, V>>>;

struct Node<K, V> {
    key: K,
    value: V,
    color: bool,
    left: Link<K, V>,
    right: Link<K, V>,
    size: usize,
}

fn size<K, V>(link: &Link<K, V>) -> usize {
    link.as_ref().map_or(0, |node| node.size)
}

fn is_red<K, V>(link: &Link<K, V>) -> bool {
    link.as_ref().is_some_and(|node| node.color == RED)
}

fn left_child_is_red<K, V>(link: &Link<K, V>) -> bool {
    link.as_ref().is_some_and(|node| is_red(&node.left))
}

impl<K: Clone, V: Clone> Node<K, V> {
    fn new(key: K, value: V, color: bool, left: Link<K, V>, right: Link<K, V>) -> Self {
        let size = size(&left) + 1 + size(&right);
        Self {
            key,
            value,
            color,
            left,
            right,
            size,
        }
    }

    fn with_children(&self, left: Link<K, V>, right: Link<K, V>) -> Self {
        Self::new(self.key.clone(), self.value.clone(), self.color, left, right)
    }

    fn with_color(&self, color: bool, left: Link<K, V>, right: Link<K, V>) -> Self {
        Self::new(self.key.clone(), self.value.clone(), color, left, right)
    }

    fn min(&self) -> &Node<K, V> {
        match &self.left {
            Some(left) => left.min(),
            None => self,
        }
    }

    fn insert(link: &Link<K, V>, key: K, value: V, cmp: &Comparator<K>) -> Node<K, V> {
        let node = match link {
            None => return Node::new(key, value, RED, None, None),
            Some(node) => node,
        };
        let updated = match cmp(&key, &node.key) {
            Ordering::Less => node.with_children(
                Some(Arc::new(Self::insert(&node.left, key, value, cmp))),
                node.right.clone(),
            ),
            Ordering::Equal => Node::new(
                node.key.clone(),
                value,
                node.color,
                node.left.clone(),
                node.right.clone(),
            ),
            Ordering::Greater => node.with_children(
                node.left.clone(),
                Some(Arc::new(Self::insert(&node.right, key, value, cmp))),
            ),
        };
        updated.fix_up()
    }

    fn remove_min(&self) -> Link<K, V> {
        if self.left.is_none() {
            return None;
        }
        let mut n = self.shallow();
        if !is_red(&n.left) && !left_child_is_red(&n.left) {
            n = n.move_red_left();
        }
        let left = n.left.as_ref().and_then(|left| left.remove_min());
        let n = n.with_children(left, n.right.clone());
        Some(Arc::new(n.fix_up()))
    }

    fn remove(&self, key: &K, cmp: &Comparator<K>) -> Link<K, V> {
        let mut n = self.shallow();
        if cmp(key, &n.key) == Ordering::Less {
            if n.left.is_some() && !is_red(&n.left) && !left_child_is_red(&n.left) {
                n = n.move_red_left();
            }
            let left = n.left.as_ref().and_then(|left| left.remove(key, cmp));
            n = n.with_children(left, n.right.clone());
        } else {
            if is_red(&n.left) {
                n = n.rotate_right();
            }
            if n.right.is_some() && !is_red(&n.right) && !left_child_is_red(&n.right) {
                n = n.move_red_right();
            }
            if cmp(key, &n.key) == Ordering::Equal {
                let right = match &n.right {
                    None => return None,
                    Some(right) => right,
                };
                let smallest = right.min();
                n = Node::new(
                    smallest.key.clone(),
                    smallest.value.clone(),
                    n.color,
                    n.left.clone(),
                    right.remove_min(),
                );
            } else {
                let right = n.right.as_ref().and_then(|right| right.remove(key, cmp));
                n = n.with_children(n.left.clone(), right);
            }
        }
        Some(Arc::new(n.fix_up()))
    }

    fn shallow(&self) -> Node<K, V> {
        self.with_children(self.left.clone(), self.right.clone())
    }

    fn fix_up(self) -> Node<K, V> {
        let mut n = self;
        if is_red(&n.right) && !is_red(&n.left) {
            n = n.rotate_left();
        }
        if is_red(&n.left) && left_child_is_red(&n.left) {
            n = n.rotate_right();
        }
        if is_red(&n.left) && is_red(&n.right) {
            n = n.color_flip();
        }
        n
    }

    fn move_red_left(&self) -> Node<K, V> {
        let mut n = self.color_flip();
        if left_child_is_red(&n.right) {
            let right = n.right.as_ref().map(|right| Arc::new(right.rotate_right()));
            n = n.with_children(n.left.clone(), right);
            n = n.rotate_left();
            n = n.color_flip();
        }
        n
    }

    fn move_red_right(&self) -> Node<K, V> {
        let mut n = self.color_flip();
        if left_child_is_red(&n.left) {
            n = n.rotate_right();
            n = n.color_flip();
        }
        n
    }

    fn rotate_left(&self) -> Node<K, V> {
        let right = match &self.right {
            Some(right) => right,
            None => fail("rotate_left requires a right child"),
        };
        let new_left = self.with_color(RED, self.left.clone(), right.left.clone());
        right.with_color(self.color, Some(Arc::new(new_left)), right.right.clone())
    }

    fn rotate_right(&self) -> Node<K, V> {
        let left = match &self.left {
            Some(left) => left,
            None => fail("rotate_right requires a left child"),
        };
        let new_right = self.with_color(RED, left.right.clone(), self.right.clone());
        left.with_color(self.color, left.left.clone(), Some(Arc::new(new_right)))
    }

    fn color_flip(&self) -> Node<K, V> {
        let flip = |link: &Link<K, V>| {
            link.as_ref().map(|child| {
                Arc::new(child.with_color(!child.color, child.left.clone(), child.right.clone()))
            })
        };
        self.with_color(!self.color, flip(&self.left), flip(&self.right))
    }

    fn black_depth(link: &Link<K, V>) -> usize {
        let node = match link {
            None => return 0,
            Some(node) => node,
        };
        if node.color == RED && is_red(&node.left) {
            fail("red node has a red child");
        }
        if is_red(&node.right) {
            fail("right child is red");
        }
        let depth = Self::black_depth(&node.left);
        if depth != Self::black_depth(&node.right) {
            fail("black depths differ");
        }
        depth + usize::from(node.color == BLACK)
    }
}

/// Immutable, persistent sorted map backed by a left-leaning red-black tree.
///
/// Every mutating operation returns a new map that shares unchanged nodes with
/// the original, so older versions stay valid and cloning is O(1).
pub struct SortedMap<K, V> {
    comparator: Comparator<K>,
    root: Link<K, V>,
}

impl<K, V> Clone for SortedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            comparator: Arc::clone(&self.comparator),
            root: self.root.clone(),
        }
    }
}

impl<K: Ord + Clone + 'static, V: Clone> Default for SortedMap<K, V> {
    fn default() -> Self {
        Self::new(Arc::new(|left: &K, right: &K| left.cmp(right)))
    }
}

impl<K: Clone, V: Clone> SortedMap<K, V> {
    pub fn new(comparator: Comparator<K>) -> Self {
        Self {
            comparator,
            root: None,
        }
    }

    pub fn comparator(&self) -> &Comparator<K> {
        &self.comparator
    }

    pub fn insert(&self, key: K, value: V) -> Self {
        let mut root = Node::insert(&self.root, key, value, &self.comparator);
        root.color = BLACK;
        Self {
            comparator: Arc::clone(&self.comparator),
            root: Some(Arc::new(root)),
        }
    }

    pub fn remove(&self, key: &K) -> Self {
        if !self.contains_key(key) {
            return self.clone();
        }
        let root = self.root.as_ref().and_then(|root| root.remove(key, &self.comparator));
        let root = root.map(|node| {
            Arc::new(node.with_color(BLACK, node.left.clone(), node.right.clone()))
        });
        Self {
            comparator: Arc::clone(&self.comparator),
            root,
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let mut link = &self.root;
        while let Some(node) = link {
            match (self.comparator)(key, &node.key) {
                Ordering::Equal => return Some(&node.value),
                Ordering::Less => link = &node.left,
                Ordering::Greater => link = &node.right,
            }
        }
        None
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Position of `key` in iteration order, or `None` when absent.
    pub fn index_of(&self, key: &K) -> Option<usize> {
        let mut prune_count = 0;
        let mut link = &self.root;
        while let Some(node) = link {
            match (self.comparator)(key, &node.key) {
                Ordering::Equal => return Some(prune_count + size(&node.left)),
                Ordering::Less => link = &node.left,
                Ordering::Greater => {
                    prune_count += size(&node.left) + 1;
                    link = &node.right;
                }
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        size(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn min_key(&self) -> Option<&K> {
        self.root.as_ref().map(|root| &root.min().key)
    }

    pub fn max_key(&self) -> Option<&K> {
        let mut node = self.root.as_ref()?;
        while let Some(right) = &node.right {
            node = right;
        }
        Some(&node.key)
    }

    pub fn iter(&self) -> SortedMapIter<'_, K, V> {
        SortedMapIter::new(&self.root, None, &self.comparator, false)
    }

    /// Iterates entries whose key is greater than or equal to `key`.
    pub fn iter_from<'a>(&'a self, key: &K) -> SortedMapIter<'a, K, V> {
        SortedMapIter::new(&self.root, Some(key), &self.comparator, false)
    }

    pub fn reverse_iter(&self) -> SortedMapIter<'_, K, V> {
        SortedMapIter::new(&self.root, None, &self.comparator, true)
    }

    /// Iterates entries whose key is less than or equal to `key`, descending.
    pub fn reverse_iter_from<'a>(&'a self, key: &K) -> SortedMapIter<'a, K, V> {
        SortedMapIter::new(&self.root, Some(key), &self.comparator, true)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.iter().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.iter().map(|(_, value)| value)
    }

    /// Verifies the red-black invariants; panics when they do not hold.
    pub fn check_max_depth(&self) -> bool {
        let black_depth = Node::black_depth(&self.root);
        2f64.powi(black_depth as i32) <= (self.len() + 1) as f64
    }
}

impl<K: Ord + Clone + 'static, V: Clone> FromIterator<(K, V)> for SortedMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(SortedMap::default(), |map, (key, value)| map.insert(key, value))
    }
}

impl<K: Clone + Debug, V: Clone + Debug> Debug for SortedMap<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

pub struct SortedMapIter<'a, K, V> {
    stack: Vec<&'a Node<K, V>>,
    reverse: bool,
}

impl<'a, K, V> SortedMapIter<'a, K, V> {
    fn new(
        root: &'a Link<K, V>,
        start: Option<&K>,
        comparator: &Comparator<K>,
        reverse: bool,
    ) -> Self {
        let mut stack = Vec::new();
        let mut link = root;
        while let Some(node) = link {
            let mut cmp = match start {
                Some(start) => comparator(&node.key, start),
                None => Ordering::Greater,
            };
            if start.is_some() && reverse {
                cmp = cmp.reverse();
            }
            match cmp {
                Ordering::Less => {
                    link = if reverse { &node.left } else { &node.right };
                }
                Ordering::Equal => {
                    stack.push(node.as_ref());
                    break;
                }
                Ordering::Greater => {
                    stack.push(node.as_ref());
                    link = if reverse { &node.right } else { &node.left };
                }
            }
        }
        Self { stack, reverse }
    }

    pub fn peek(&self) -> Option<(&'a K, &'a V)> {
        self.stack.last().map(|node| (&node.key, &node.value))
    }
}

impl<'a, K, V> Iterator for SortedMapIter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        let mut link = if self.reverse { &node.left } else { &node.right };
        while let Some(child) = link {
            self.stack.push(child.as_ref());
            link = if self.reverse { &child.right } else { &child.left };
        }
        Some((&node.key, &node.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_map<V: Clone>() -> SortedMap<i32, V> {
        SortedMap::default()
    }

    #[test]
    fn insert_get_and_remove() {
        let map = int_map().insert(1, 10).insert(5, 50).insert(3, 30);
        assert_eq!(map.get(&3), Some(&30));
        assert_eq!(map.len(), 3);

        let removed = map.remove(&3);
        assert_eq!(removed.get(&3), None);
        assert_eq!(removed.len(), 2);
        assert_eq!(map.get(&3), Some(&30));
    }

    #[test]
    fn older_versions_survive_updates() {
        let first = int_map().insert(1, 1);
        let second = first.insert(1, 2).insert(2, 2);
        assert_eq!(first.get(&1), Some(&1));
        assert_eq!(first.len(), 1);
        assert_eq!(second.get(&1), Some(&2));
    }

    #[test]
    fn iterates_in_order_and_reverse() {
        let mut map = int_map();
        for key in [7, 2, 9, 4, 1, 8] {
            map = map.insert(key, key * 10);
        }
        let keys: Vec<_> = map.keys().copied().collect();
        assert_eq!(keys, vec![1, 2, 4, 7, 8, 9]);

        let reversed: Vec<_> = map.reverse_iter().map(|(k, _)| *k).collect();
        assert_eq!(reversed, vec![9, 8, 7, 4, 2, 1]);
    }

    #[test]
    fn iterates_from_key() {
        let mut map = int_map();
        for key in [10, 20, 30, 40] {
            map = map.insert(key, ());
        }
        let from: Vec<_> = map.iter_from(&25).map(|(k, _)| *k).collect();
        assert_eq!(from, vec![30, 40]);
        let back: Vec<_> = map.reverse_iter_from(&25).map(|(k, _)| *k).collect();
        assert_eq!(back, vec![20, 10]);
        let exact: Vec<_> = map.iter_from(&20).map(|(k, _)| *k).collect();
        assert_eq!(exact, vec![20, 30, 40]);
    }

    #[test]
    fn index_of_and_bounds() {
        let mut map = int_map();
        for key in 0..50 {
            map = map.insert(key * 2, ());
        }
        assert_eq!(map.index_of(&0), Some(0));
        assert_eq!(map.index_of(&20), Some(10));
        assert_eq!(map.index_of(&21), None);
        assert_eq!(map.min_key(), Some(&0));
        assert_eq!(map.max_key(), Some(&98));
    }

    #[test]
    fn stays_balanced_under_churn() {
        let mut map = int_map();
        for key in 0..500 {
            map = map.insert((key * 7919) % 1000, key);
        }
        assert!(map.check_max_depth());
        for key in (0..1000).step_by(3) {
            map = map.remove(&key);
        }
        assert!(map.check_max_depth());
        let keys: Vec<_> = map.keys().copied().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn custom_comparator_orders_descending() {
        let map: SortedMap<i32, ()> = SortedMap::new(Arc::new(|a: &i32, b: &i32| b.cmp(a)));
        let map = map.insert(1, ()).insert(3, ()).insert(2, ());
        let keys: Vec<_> = map.keys().copied().collect();
        assert_eq!(keys, vec![3, 2, 1]);
    }
}
