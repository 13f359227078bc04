//! A component whose expected set comes from a multi-document YAML manifest.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rekon_core::{Gvk, Identity, KindRegistry, LabelSelector, Object, ObjectBag, Observable, OwnerRef, Scope};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::component::Component;
use crate::error::ReconcileError;
use crate::observe::{labelled, point_lookups};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const SET_LABEL: &str = "rekon.dev/set";
pub const LIFECYCLE_ANNOTATION: &str = "rekon.dev/lifecycle";

fn max_yaml_bytes() -> usize {
    std::env::var("REKON_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000)
}

fn max_yaml_nodes() -> usize {
    std::env::var("REKON_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub objects: Vec<Object>,
}

/// Parse every non-empty document of `yaml`. Objects without a namespace get
/// `default_ns`.
pub fn parse_manifest(yaml: &str, default_ns: Option<&str>) -> Result<Manifest> {
    if yaml.len() > max_yaml_bytes() {
        return Err(anyhow!("YAML payload too large (>{} bytes)", max_yaml_bytes()));
    }
    let mut objects = Vec::new();
    for (idx, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).with_context(|| format!("parsing YAML document {}", idx + 1))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).context("converting YAML to JSON")?;
        if json_node_budget_exceeded(&json, max_yaml_nodes()) {
            return Err(anyhow!("YAML document {} too complex (>{} nodes)", idx + 1, max_yaml_nodes()));
        }
        objects.push(object_from_json(json, default_ns).with_context(|| format!("YAML document {}", idx + 1))?);
    }
    Ok(Manifest { objects })
}

fn object_from_json(json: Json, default_ns: Option<&str>) -> Result<Object> {
    json.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("YAML missing apiVersion"))?;
    json.get("kind").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("YAML missing kind"))?;
    json.get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("YAML missing metadata.name"))?;
    let mut obj = Object::from_value(json).context("decoding object")?;
    if obj.metadata.namespace.is_none() {
        obj.metadata.namespace = default_ns.map(str::to_string);
    }
    Ok(obj)
}

impl Manifest {
    /// Drop namespaces from cluster-scoped kinds.
    pub fn normalize(&mut self, registry: &KindRegistry) {
        for o in self.objects.iter_mut() {
            if registry.scope(&o.gvk) == Some(Scope::Cluster) {
                o.metadata.namespace = None;
            }
        }
    }

    /// Kinds `registry` has never heard of.
    pub fn unknown_kinds(&self, registry: &KindRegistry) -> Vec<Gvk> {
        let mut out: Vec<Gvk> = self.objects.iter().map(|o| o.gvk.clone()).filter(|g| !registry.is_registered(g)).collect();
        out.sort();
        out.dedup();
        out
    }
}

fn is_referenced(o: &Object) -> bool {
    o.metadata.annotations.get(LIFECYCLE_ANNOTATION).map(|v| v == "referenced").unwrap_or(false)
}

/// Status of one manifest apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestStatus {
    pub reconciled: Vec<Identity>,
    pub errors: Vec<String>,
}

impl ManifestStatus {
    pub fn is_ok(&self) -> bool { self.errors.is_empty() }
}

/// Applies a manifest as one named set. Managed objects carry the set labels
/// so a later apply can find (and delete) what it no longer contains.
#[derive(Debug, Clone)]
pub struct ManifestComponent {
    set: String,
    namespace: Option<String>,
    manifest: Manifest,
    owner_refs: Vec<OwnerRef>,
    prune_kinds: Vec<Gvk>,
}

impl ManifestComponent {
    /// `namespace: None` observes the set across all namespaces.
    pub fn new(set: &str, namespace: Option<&str>, manifest: Manifest) -> Self {
        Self {
            set: set.to_string(),
            namespace: namespace.map(str::to_string),
            manifest,
            owner_refs: Vec::new(),
            prune_kinds: Vec::new(),
        }
    }

    pub fn with_owner(mut self, owner: OwnerRef) -> Self {
        self.owner_refs.push(owner);
        self
    }

    /// Extra kinds to list when looking for leftovers of earlier applies.
    pub fn with_prune_kinds(mut self, kinds: impl IntoIterator<Item = Gvk>) -> Self {
        self.prune_kinds.extend(kinds);
        self
    }

    pub fn set_name(&self) -> &str { &self.set }

    pub fn manifest(&self) -> &Manifest { &self.manifest }
}

#[async_trait]
impl<R: Send + Sync> Component<R, ManifestStatus> for ManifestComponent {
    fn name(&self) -> &str { &self.set }

    fn labels(&self) -> BTreeMap<String, String> {
        let mut l = BTreeMap::new();
        l.insert(MANAGED_BY_LABEL.to_string(), "rekon".to_string());
        l.insert(SET_LABEL.to_string(), self.set.clone());
        l
    }

    fn owner_refs(&self) -> Vec<OwnerRef> { self.owner_refs.clone() }

    fn expected_resources(&self, _rsrc: &R, labels: &BTreeMap<String, String>, _aggregated: &ObjectBag) -> Result<ObjectBag> {
        let mut bag = ObjectBag::new();
        for o in &self.manifest.objects {
            if is_referenced(o) {
                bag.add_referenced(o.clone());
            } else {
                let mut o = o.clone();
                o.metadata.labels.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
                bag.add_managed(o);
            }
        }
        Ok(bag)
    }

    fn observables(
        &self,
        registry: &KindRegistry,
        _rsrc: &R,
        labels: &BTreeMap<String, String>,
        expected: &ObjectBag,
    ) -> Vec<Observable> {
        let managed_kinds = expected.iter().filter(|t| t.is_managed()).map(|t| &t.obj.gvk);
        let selector = LabelSelector::from_labels(labels);
        let mut out = labelled(registry, self.namespace.as_deref(), &selector, managed_kinds.chain(self.prune_kinds.iter()));
        let referenced: ObjectBag = expected.iter().filter(|t| !t.is_managed()).cloned().collect();
        out.extend(point_lookups(&referenced));
        out
    }

    fn update_component_status(&self, _rsrc: &R, status: &mut ManifestStatus, reconciled: &[Object], err: Option<&ReconcileError>) {
        status.reconciled.extend(reconciled.iter().map(Object::identity));
        if let Some(e) = err {
            status.errors.extend(e.errors().into_iter().map(|e| e.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_DOCS: &str = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: web-config
data:
  k: v
---
apiVersion: v1
kind: Secret
metadata:
  name: db-creds
  namespace: shared
  annotations:
    rekon.dev/lifecycle: referenced
---
";

    #[test]
    fn parses_multi_document_manifests() {
        let m = parse_manifest(TWO_DOCS, Some("a")).unwrap();
        assert_eq!(m.objects.len(), 2);
        assert_eq!(m.objects[0].identity().to_string(), "a/ConfigMap/web-config");
        assert_eq!(m.objects[1].namespace(), Some("shared"));
        assert!(is_referenced(&m.objects[1]));
    }

    #[test]
    fn parse_errors_are_friendly() {
        let e1 = parse_manifest("kind: Foo\nmetadata:\n  name: x\n", None).unwrap_err();
        assert!(format!("{e1:#}").contains("missing apiVersion"), "e1={e1:#}");
        let e2 = parse_manifest("apiVersion: v1\nmetadata:\n  name: x\n", None).unwrap_err();
        assert!(format!("{e2:#}").contains("missing kind"), "e2={e2:#}");
        let e3 = parse_manifest("apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n", None).unwrap_err();
        assert!(format!("{e3:#}").contains("missing metadata.name"), "e3={e3:#}");
    }

    #[test]
    fn node_budget_is_enforced() {
        let v = serde_json::json!({"a": [1, 2, 3], "b": {"c": 1}});
        assert!(json_node_budget_exceeded(&v, 4));
        assert!(!json_node_budget_exceeded(&v, 100));
    }

    #[test]
    fn normalize_strips_namespace_from_cluster_kinds() {
        let mut m = parse_manifest("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: team\n", Some("a")).unwrap();
        m.normalize(&KindRegistry::with_builtins());
        assert_eq!(m.objects[0].namespace(), None);
        let widgets = parse_manifest("apiVersion: example.com/v1\nkind: Widget\nmetadata:\n  name: w\n", None).unwrap();
        assert_eq!(widgets.unknown_kinds(&KindRegistry::with_builtins()), vec![Gvk::new("example.com", "v1", "Widget")]);
    }

    #[test]
    fn managed_objects_get_set_labels_and_referenced_get_point_lookups() {
        let c = ManifestComponent::new("web", Some("a"), parse_manifest(TWO_DOCS, Some("a")).unwrap());
        let labels = <ManifestComponent as Component<(), ManifestStatus>>::labels(&c);
        let bag = Component::<(), ManifestStatus>::expected_resources(&c, &(), &labels, &ObjectBag::new()).unwrap();
        assert!(bag.items()[0].is_managed());
        assert_eq!(bag.items()[0].obj.labels().get(SET_LABEL).map(String::as_str), Some("web"));
        assert!(!bag.items()[1].is_managed());
        assert!(bag.items()[1].obj.labels().is_empty());

        let obs = Component::<(), ManifestStatus>::observables(&c, &KindRegistry::with_builtins(), &(), &labels, &bag);
        assert_eq!(obs.len(), 2);
        assert!(matches!(&obs[0], Observable::List { namespace: Some(ns), .. } if ns == "a"));
        assert_eq!(obs[1], Observable::Get(bag.items()[1].obj.identity()));
    }
}
