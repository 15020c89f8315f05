use crate::firestore::model::FieldPath;

/// Sorted, de-duplicated set of field paths a patch touches.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct FieldMask {
    fields: Vec<FieldPath>,
}

impl FieldMask {
    pub fn new(mut fields: Vec<FieldPath>) -> Self {
        fields.sort();
        fields.dedup();
        Self { fields }
    }

    pub fn fields(&self) -> &[FieldPath] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True when `path` equals or lies below one of the mask's fields.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union(&self, other: &FieldMask) -> FieldMask {
        let mut fields = self.fields.clone();
        fields.extend(other.fields.iter().cloned());
        FieldMask::new(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_nested_paths() {
        let mask = FieldMask::new(vec![
            FieldPath::from_dot_separated("b").unwrap(),
            FieldPath::from_dot_separated("a.x").unwrap(),
            FieldPath::from_dot_separated("b").unwrap(),
        ]);
        assert_eq!(mask.fields().len(), 2);
        assert!(mask.covers(&FieldPath::from_dot_separated("a.x.y").unwrap()));
        assert!(!mask.covers(&FieldPath::from_dot_separated("a").unwrap()));
    }
}
