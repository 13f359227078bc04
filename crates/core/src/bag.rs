use serde::{Deserialize, Serialize};

use crate::{Identity, Object};

/// Lifecycle class of an expected object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    /// Owned and fully created/updated/deleted by the engine.
    #[default]
    Managed,
    /// Must pre-exist; only ever read.
    Referenced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedObject {
    pub obj: Object,
    pub lifecycle: Lifecycle,
}

impl TaggedObject {
    pub fn managed(obj: Object) -> Self { Self { obj, lifecycle: Lifecycle::Managed } }
    pub fn referenced(obj: Object) -> Self { Self { obj, lifecycle: Lifecycle::Referenced } }
    pub fn is_managed(&self) -> bool { self.lifecycle == Lifecycle::Managed }
}

/// Ordered, append-only collection of tagged objects.
///
/// Identities are expected to be unique by the time a bag reaches the diff;
/// the bag itself never deduplicates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectBag {
    items: Vec<TaggedObject>,
}

impl ObjectBag {
    pub fn new() -> Self { Self::default() }

    pub fn add(&mut self, item: TaggedObject) { self.items.push(item); }

    pub fn add_managed(&mut self, obj: Object) { self.add(TaggedObject::managed(obj)); }

    pub fn add_referenced(&mut self, obj: Object) { self.add(TaggedObject::referenced(obj)); }

    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn items(&self) -> &[TaggedObject] { &self.items }
    pub fn into_items(self) -> Vec<TaggedObject> { self.items }

    pub fn iter(&self) -> std::slice::Iter<'_, TaggedObject> { self.items.iter() }
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, TaggedObject> { self.items.iter_mut() }

    pub fn objects(&self) -> impl Iterator<Item = &Object> + '_ { self.items.iter().map(|t| &t.obj) }

    /// First entry with the given identity.
    pub fn find(&self, id: &Identity) -> Option<&TaggedObject> {
        self.items.iter().find(|t| t.obj.matches(id))
    }
}

impl IntoIterator for ObjectBag {
    type Item = TaggedObject;
    type IntoIter = std::vec::IntoIter<TaggedObject>;
    fn into_iter(self) -> Self::IntoIter { self.items.into_iter() }
}

impl<'a> IntoIterator for &'a ObjectBag {
    type Item = &'a TaggedObject;
    type IntoIter = std::slice::Iter<'a, TaggedObject>;
    fn into_iter(self) -> Self::IntoIter { self.items.iter() }
}

impl FromIterator<TaggedObject> for ObjectBag {
    fn from_iter<I: IntoIterator<Item = TaggedObject>>(iter: I) -> Self {
        Self { items: iter.into_iter().collect() }
    }
}

impl Extend<TaggedObject> for ObjectBag {
    fn extend<I: IntoIterator<Item = TaggedObject>>(&mut self, iter: I) { self.items.extend(iter); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Gvk;

    fn pod(name: &str) -> Object { Object::new(Gvk::new("", "v1", "Pod"), Some("a"), name) }

    #[test]
    fn keeps_insertion_order_and_duplicates() {
        let mut bag = ObjectBag::new();
        bag.add_managed(pod("x"));
        bag.add_referenced(pod("y"));
        bag.add_managed(pod("x"));
        let names: Vec<_> = bag.objects().map(|o| o.name().to_string()).collect();
        assert_eq!(names, vec!["x", "y", "x"]);
        assert_eq!(bag.len(), 3);
    }

    #[test]
    fn find_returns_first_match() {
        let mut bag = ObjectBag::new();
        bag.add_referenced(pod("x"));
        bag.add_managed(pod("x"));
        let id = pod("x").identity();
        assert_eq!(bag.find(&id).map(|t| t.lifecycle), Some(Lifecycle::Referenced));
        assert!(bag.find(&pod("z").identity()).is_none());
    }
}
