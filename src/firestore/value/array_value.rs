use crate::firestore::value::FirestoreValue;

#[derive(Clone, Debug, PartialEq, Default)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn into_value(self) -> FirestoreValue {
        FirestoreValue::from_array(self.values)
    }

    pub fn contains(&self, value: &FirestoreValue) -> bool {
        self.values.iter().any(|existing| existing == value)
    }

    /// Appends each element not already present, keeping existing order.
    pub fn union(&self, elements: &[FirestoreValue]) -> Self {
        let mut values = self.values.clone();
        for element in elements {
            if !values.iter().any(|existing| existing == element) {
                values.push(element.clone());
            }
        }
        Self { values }
    }

    /// Drops every occurrence of each element.
    pub fn remove(&self, elements: &[FirestoreValue]) -> Self {
        let values = self
            .values
            .iter()
            .filter(|existing| !elements.iter().any(|element| element == *existing))
            .cloned()
            .collect();
        Self { values }
    }
}
