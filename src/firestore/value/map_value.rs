use std::collections::BTreeMap;

use crate::firestore::model::{FieldMask, FieldPath};
use crate::firestore::value::{FirestoreValue, ValueKind};

#[derive(Clone, Debug, PartialEq, Default)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, FirestoreValue> {
        self.fields
    }
}

/// Document contents: a top-level map addressed by [`FieldPath`]s.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ObjectValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl ObjectValue {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, FirestoreValue> {
        self.fields
    }

    pub fn to_value(&self) -> FirestoreValue {
        FirestoreValue::from_map(self.fields.clone())
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let mut current = &self.fields;
        let segments = path.segments();
        for (index, segment) in segments.iter().enumerate() {
            let value = current.get(segment)?;
            if index + 1 == segments.len() {
                return Some(value);
            }
            match value.kind() {
                ValueKind::Map(map) => current = map.fields(),
                _ => return None,
            }
        }
        None
    }

    /// Writes `value` at `path`, replacing any non-map value found on the way.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        set_in(&mut self.fields, path.segments(), value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        delete_in(&mut self.fields, path.segments());
    }

    /// Applies several writes; `None` deletes the field.
    pub fn set_all(&mut self, updates: BTreeMap<FieldPath, Option<FirestoreValue>>) {
        for (path, value) in updates {
            match value {
                Some(value) => self.set(&path, value),
                None => self.delete(&path),
            }
        }
    }

    /// Every leaf path of the object. Empty maps count as leaves.
    pub fn field_mask(&self) -> FieldMask {
        let mut paths = Vec::new();
        collect_leaf_paths(&self.fields, None, &mut paths);
        FieldMask::new(paths)
    }
}

fn set_in(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String], value: FirestoreValue) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }
    let mut child = match fields.remove(first).map(FirestoreValue::into_kind) {
        Some(ValueKind::Map(map)) => map.into_fields(),
        _ => BTreeMap::new(),
    };
    set_in(&mut child, rest, value);
    fields.insert(first.clone(), FirestoreValue::from_map(child));
}

fn delete_in(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.remove(first);
        return;
    }
    let Some(existing) = fields.get(first) else {
        return;
    };
    let ValueKind::Map(map) = existing.kind() else {
        return;
    };
    let mut child = map.fields().clone();
    delete_in(&mut child, rest);
    fields.insert(first.clone(), FirestoreValue::from_map(child));
}

fn collect_leaf_paths(
    fields: &BTreeMap<String, FirestoreValue>,
    parent: Option<&FieldPath>,
    out: &mut Vec<FieldPath>,
) {
    for (key, value) in fields {
        let path = match parent {
            Some(parent) => parent.child(key.clone()),
            None => FieldPath::from_single(key.clone()),
        };
        match value.kind() {
            ValueKind::Map(map) if !map.fields().is_empty() => {
                collect_leaf_paths(map.fields(), Some(&path), out)
            }
            _ => out.push(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    #[test]
    fn stores_map_entries() {
        let mut map = BTreeMap::new();
        map.insert("foo".to_string(), FirestoreValue::from_integer(1));
        let value = MapValue::new(map.clone());
        assert_eq!(value.fields().get("foo"), map.get("foo"));
    }

    #[test]
    fn set_creates_intermediate_maps() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b.c"), 1i64.into());
        object.set(&path("a.d"), "x".into());
        assert_eq!(object.field(&path("a.b.c")), Some(&1i64.into()));
        assert_eq!(object.field(&path("a.d")), Some(&"x".into()));
        assert_eq!(object.field(&path("a.b.c.z")), None);

        object.set(&path("a.d.e"), true.into());
        assert_eq!(object.field(&path("a.d.e")), Some(&true.into()));
    }

    #[test]
    fn delete_removes_nested_field_only() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b"), 1i64.into());
        object.set(&path("a.c"), 2i64.into());
        object.delete(&path("a.b"));
        object.delete(&path("missing.path"));
        assert_eq!(object.field(&path("a.b")), None);
        assert_eq!(object.field(&path("a.c")), Some(&2i64.into()));
    }

    #[test]
    fn field_mask_lists_leaves() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b"), 1i64.into());
        object.set(&path("c"), FirestoreValue::from_map(BTreeMap::new()));
        let mask = object.field_mask();
        assert_eq!(mask.fields(), &[path("a.b"), path("c")]);
    }
}
