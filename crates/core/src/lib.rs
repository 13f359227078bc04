//! Rekon core types: identity-bearing objects and the bags passed between
//! reconciliation stages.
//!
//! Objects are kept in the Kubernetes wire shape (`apiVersion`, `kind`,
//! `metadata`, then arbitrary top-level fields) so that any kind, built-in or
//! custom, flows through the engine without a compile-time type per kind.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use smallvec::SmallVec;

mod bag;
mod error;
mod registry;
mod select;

pub use bag::{Lifecycle, ObjectBag, TaggedObject};
pub use error::StoreError;
pub use registry::{KindRegistry, Scope};
pub use select::{LabelSelector, Observable};

pub mod prelude {
    pub use super::{
        Gvk, Identity, KindRegistry, LabelSelector, Lifecycle, NamespacedName, Object, ObjectBag,
        ObjectMeta, Observable, OwnerRef, Scope, StoreError, TaggedObject,
    };
}

/// Group/Version/Kind of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    /// Split an `apiVersion` (`v1` or `group/v1`) and pair it with `kind`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    /// Parse a key of the form `v1/Kind` or `group/v1/Kind`.
    pub fn parse_key(key: &str) -> Option<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Some(Self::new("", version, kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Some(Self::new(group, version, kind)),
            _ => None,
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Identity of an object: `(namespace, kind, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub namespace: Option<String>,
    pub kind: Gvk,
    pub name: String,
}

impl Identity {
    pub fn new(kind: Gvk, namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), kind, name: name.to_string() }
    }

    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName { namespace: self.namespace.clone(), name: self.name.clone() }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace.as_deref().unwrap_or(""), self.kind.kind, self.name)
    }
}

/// Namespace + name of a custom resource, as handed over by a work queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: Option<String>,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Back-link from an owned object to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

impl OwnerRef {
    /// Controller reference pointing at `owner`.
    pub fn controller_of(owner: &Object) -> Self {
        Self {
            api_version: owner.gvk.api_version(),
            kind: owner.gvk.kind.clone(),
            name: owner.metadata.name.clone(),
            uid: owner.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}

pub type OwnerRefs = SmallVec<[OwnerRef; 2]>;

fn no_owner_refs(v: &OwnerRefs) -> bool { v.is_empty() }

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Opaque optimistic-concurrency token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "no_owner_refs")]
    pub owner_references: OwnerRefs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
    /// Deletion-pending marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<String>,
}

/// An identity-bearing unit of desired or observed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireObject", into = "WireObject")]
pub struct Object {
    pub gvk: Gvk,
    pub metadata: ObjectMeta,
    /// Every top-level field other than `apiVersion`, `kind` and `metadata`.
    pub body: Map<String, Json>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireObject {
    api_version: String,
    kind: String,
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(flatten)]
    body: Map<String, Json>,
}

impl TryFrom<WireObject> for Object {
    type Error = String;

    fn try_from(w: WireObject) -> Result<Self, Self::Error> {
        if w.api_version.is_empty() { return Err("object missing apiVersion".into()); }
        if w.kind.is_empty() { return Err("object missing kind".into()); }
        Ok(Self { gvk: Gvk::from_api_version(&w.api_version, &w.kind), metadata: w.metadata, body: w.body })
    }
}

impl From<Object> for WireObject {
    fn from(o: Object) -> Self {
        Self { api_version: o.gvk.api_version(), kind: o.gvk.kind, metadata: o.metadata, body: o.body }
    }
}

impl Object {
    pub fn new(gvk: Gvk, namespace: Option<&str>, name: &str) -> Self {
        let metadata = ObjectMeta {
            name: name.to_string(),
            namespace: namespace.map(|s| s.to_string()),
            ..ObjectMeta::default()
        };
        Self { gvk, metadata, body: Map::new() }
    }

    /// Set a top-level field (`spec`, `data`, ...).
    pub fn with_field(mut self, key: &str, value: Json) -> Self {
        self.body.insert(key.to_string(), value);
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.metadata.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.metadata.annotations.insert(key.to_string(), value.to_string());
        self
    }

    pub fn identity(&self) -> Identity {
        Identity {
            namespace: self.metadata.namespace.clone(),
            kind: self.gvk.clone(),
            name: self.metadata.name.clone(),
        }
    }

    /// Identity comparison without allocating.
    pub fn same_identity(&self, other: &Object) -> bool {
        self.metadata.name == other.metadata.name
            && self.metadata.namespace == other.metadata.namespace
            && self.gvk == other.gvk
    }

    pub fn matches(&self, id: &Identity) -> bool {
        self.metadata.name == id.name && self.metadata.namespace == id.namespace && self.gvk == id.kind
    }

    pub fn name(&self) -> &str { &self.metadata.name }
    pub fn namespace(&self) -> Option<&str> { self.metadata.namespace.as_deref() }
    pub fn resource_version(&self) -> Option<&str> { self.metadata.resource_version.as_deref() }
    pub fn labels(&self) -> &BTreeMap<String, String> { &self.metadata.labels }
    pub fn owner_refs(&self) -> &[OwnerRef] { &self.metadata.owner_references }
    pub fn is_deletion_pending(&self) -> bool { self.metadata.deletion_timestamp.is_some() }

    pub fn set_resource_version(&mut self, rv: Option<String>) {
        self.metadata.resource_version = rv;
    }

    /// Replace the owner-reference list wholesale.
    pub fn set_owner_refs(&mut self, refs: &[OwnerRef]) {
        self.metadata.owner_references = refs.iter().cloned().collect();
    }

    /// Natural comparable payload: `spec`, or `data` for kinds without a spec.
    pub fn payload(&self) -> Option<&Json> {
        self.body.get("spec").or_else(|| self.body.get("data"))
    }

    pub fn from_value(v: Json) -> serde_json::Result<Self> {
        serde_json::from_value(v)
    }

    pub fn to_value(&self) -> serde_json::Result<Json> {
        serde_json::to_value(self)
    }

    /// Build an object from a typed value (e.g. a custom resource struct).
    /// `apiVersion`/`kind` are taken from `gvk`, overriding whatever `value` carries.
    pub fn from_typed<T: Serialize>(gvk: &Gvk, value: &T) -> serde_json::Result<Self> {
        let mut v = serde_json::to_value(value)?;
        if let Some(map) = v.as_object_mut() {
            map.insert("apiVersion".into(), Json::String(gvk.api_version()));
            map.insert("kind".into(), Json::String(gvk.kind.clone()));
        }
        Self::from_value(v)
    }

    pub fn to_typed<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.to_value()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_keys_and_api_versions() {
        let core = Gvk::from_api_version("v1", "ConfigMap");
        assert_eq!(core.key(), "v1/ConfigMap");
        assert_eq!(core.api_version(), "v1");
        let apps = Gvk::parse_key("apps/v1/Deployment").unwrap();
        assert_eq!(apps.api_version(), "apps/v1");
        assert_eq!(apps.kind, "Deployment");
        assert!(Gvk::parse_key("Deployment").is_none());
        assert!(Gvk::parse_key("a/b/c/d").is_none());
    }

    #[test]
    fn object_reads_wire_shape() {
        let v = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "c",
                "namespace": "a",
                "resourceVersion": "7",
                "ownerReferences": [{"apiVersion": "x.dev/v1", "kind": "App", "name": "app", "uid": "u1", "controller": true}]
            },
            "data": { "k": "v1" }
        });
        let o = Object::from_value(v.clone()).unwrap();
        assert_eq!(o.identity().to_string(), "a/ConfigMap/c");
        assert_eq!(o.resource_version(), Some("7"));
        assert_eq!(o.owner_refs().len(), 1);
        assert_eq!(o.payload(), Some(&serde_json::json!({"k": "v1"})));
        assert_eq!(o.to_value().unwrap(), v);
    }

    #[test]
    fn object_without_kind_is_rejected() {
        let e = Object::from_value(serde_json::json!({"apiVersion": "v1", "metadata": {"name": "x"}}));
        assert!(e.is_err());
    }

    #[test]
    fn payload_prefers_spec_over_data() {
        let o = Object::new(Gvk::new("", "v1", "Service"), Some("a"), "s")
            .with_field("data", serde_json::json!({"d": 1}))
            .with_field("spec", serde_json::json!({"s": 1}));
        assert_eq!(o.payload(), Some(&serde_json::json!({"s": 1})));
        let bare = Object::new(Gvk::new("", "v1", "Namespace"), None, "n");
        assert!(bare.payload().is_none());
    }

    #[test]
    fn typed_conversion_stamps_gvk() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Widget { metadata: ObjectMeta, spec: BTreeMap<String, u32> }

        let gvk = Gvk::new("example.dev", "v1", "Widget");
        let w = Widget {
            metadata: ObjectMeta { name: "w".into(), namespace: Some("a".into()), ..Default::default() },
            spec: BTreeMap::from([("size".to_string(), 3)]),
        };
        let o = Object::from_typed(&gvk, &w).unwrap();
        assert_eq!(o.gvk, gvk);
        assert_eq!(o.identity(), Identity::new(gvk, Some("a"), "w"));
        let back: Widget = o.to_typed().unwrap();
        assert_eq!(back, w);
    }

    #[test]
    fn owner_ref_points_at_owner() {
        let mut owner = Object::new(Gvk::new("example.dev", "v1", "App"), Some("a"), "app");
        owner.metadata.uid = Some("uid-1".into());
        let r = OwnerRef::controller_of(&owner);
        assert_eq!(r.api_version, "example.dev/v1");
        assert_eq!(r.uid, "uid-1");
        assert_eq!(r.controller, Some(true));
    }
}
