//! Rekon store: the object-store seam the engine writes through, plus an
//! in-memory implementation used by tests and dry demos.
//!
//! Every call is atomic on a single object; nothing here batches or spans
//! transactions across objects.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use metrics::counter;
use rekon_core::{Gvk, Identity, LabelSelector, Object, StoreError};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// get/list/create/update/delete by identity.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, id: &Identity) -> Result<Object, StoreError>;

    /// `namespace: None` lists across all namespaces.
    async fn list(&self, kind: &Gvk, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<Object>, StoreError>;

    async fn create(&self, obj: &Object) -> Result<Object, StoreError>;

    /// Replace an existing object. A resource version on `obj` is an optimistic-concurrency precondition.
    async fn update(&self, obj: &Object) -> Result<Object, StoreError>;

    async fn delete(&self, obj: &Object) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Create => "create",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// A mutating call as it was attempted against the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Op {
    pub kind: OpKind,
    pub identity: Identity,
    /// Payload as sent by the caller.
    pub obj: Object,
}

#[derive(Default)]
struct Inner {
    objects: FxHashMap<Identity, Object>,
    rv: u64,
    journal: Vec<Op>,
    faults: Vec<(OpKind, Identity)>,
}

impl Inner {
    fn next_rv(&mut self) -> String {
        self.rv += 1;
        self.rv.to_string()
    }

    fn take_fault(&mut self, kind: OpKind, id: &Identity) -> bool {
        match self.faults.iter().position(|(k, i)| *k == kind && i == id) {
            Some(idx) => { self.faults.remove(idx); true }
            None => false,
        }
    }

    fn record(&mut self, kind: OpKind, obj: &Object) -> Result<Identity, StoreError> {
        let identity = obj.identity();
        self.journal.push(Op { kind, identity: identity.clone(), obj: obj.clone() });
        counter!("store_ops_total", 1u64, "op" => kind.as_str());
        if self.take_fault(kind, &identity) {
            return Err(StoreError::Backend(anyhow::anyhow!("injected {} failure for {}", kind.as_str(), identity)));
        }
        Ok(identity)
    }
}

/// In-memory object store with server-side bookkeeping (uid, resource version,
/// creation timestamp), a journal of mutating calls and fault injection.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert (or overwrite) an object as if it already existed; not journaled.
    pub fn seed(&self, mut obj: Object) -> Object {
        let mut inner = self.lock();
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        let rv = inner.next_rv();
        obj.metadata.resource_version = Some(rv);
        inner.objects.insert(obj.identity(), obj.clone());
        obj
    }

    /// Current stored copy, bypassing the async seam.
    pub fn snapshot(&self, id: &Identity) -> Option<Object> { self.lock().objects.get(id).cloned() }

    pub fn contains(&self, id: &Identity) -> bool { self.lock().objects.contains_key(id) }

    pub fn len(&self) -> usize { self.lock().objects.len() }
    pub fn is_empty(&self) -> bool { self.lock().objects.is_empty() }

    /// Set the deletion-pending marker on a stored object.
    pub fn mark_deleting(&self, id: &Identity) -> bool {
        let mut inner = self.lock();
        match inner.objects.get_mut(id) {
            Some(o) => {
                o.metadata.deletion_timestamp = Some(chrono::Utc::now().to_rfc3339());
                true
            }
            None => false,
        }
    }

    /// Make the next `kind` call on `id` fail with a backend error.
    pub fn fail_next(&self, kind: OpKind, id: Identity) { self.lock().faults.push((kind, id)); }

    pub fn journal(&self) -> Vec<Op> { self.lock().journal.clone() }

    pub fn take_journal(&self) -> Vec<Op> { std::mem::take(&mut self.lock().journal) }

    pub fn mutation_count(&self) -> usize { self.lock().journal.len() }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn get(&self, id: &Identity) -> Result<Object, StoreError> {
        trace!(id = %id, "mem get");
        self.lock().objects.get(id).cloned().ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn list(&self, kind: &Gvk, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<Object>, StoreError> {
        let inner = self.lock();
        let mut out: Vec<(Identity, Object)> = inner
            .objects
            .iter()
            .filter(|(id, o)| {
                &id.kind == kind
                    && namespace.map(|n| id.namespace.as_deref() == Some(n)).unwrap_or(true)
                    && selector.matches(o.labels())
            })
            .map(|(id, o)| (id.clone(), o.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        trace!(kind = %kind, ns = ?namespace, selector = %selector, count = out.len(), "mem list");
        Ok(out.into_iter().map(|(_, o)| o).collect())
    }

    async fn create(&self, obj: &Object) -> Result<Object, StoreError> {
        let mut inner = self.lock();
        let id = inner.record(OpKind::Create, obj)?;
        if obj.name().is_empty() {
            return Err(StoreError::Invalid(format!("{} has no name", obj.gvk)));
        }
        if obj.resource_version().is_some() {
            return Err(StoreError::Invalid(format!("resourceVersion must not be set on create: {}", id)));
        }
        if inner.objects.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        let mut stored = obj.clone();
        stored.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        stored.metadata.creation_timestamp = Some(chrono::Utc::now().to_rfc3339());
        stored.metadata.resource_version = Some(inner.next_rv());
        inner.objects.insert(id.clone(), stored.clone());
        debug!(id = %id, "mem create");
        Ok(stored)
    }

    async fn update(&self, obj: &Object) -> Result<Object, StoreError> {
        let mut inner = self.lock();
        let id = inner.record(OpKind::Update, obj)?;
        let current = inner.objects.get(&id).cloned().ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let current_rv = current.metadata.resource_version.clone().unwrap_or_default();
        if let Some(rv) = obj.resource_version() {
            if rv != current_rv {
                return Err(StoreError::Conflict { identity: id, expected: rv.to_string(), actual: current_rv });
            }
        }
        let mut stored = obj.clone();
        stored.metadata.uid = current.metadata.uid;
        stored.metadata.creation_timestamp = current.metadata.creation_timestamp;
        stored.metadata.deletion_timestamp = current.metadata.deletion_timestamp;
        stored.metadata.resource_version = Some(inner.next_rv());
        inner.objects.insert(id.clone(), stored.clone());
        debug!(id = %id, rv = ?stored.metadata.resource_version, "mem update");
        Ok(stored)
    }

    async fn delete(&self, obj: &Object) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let id = inner.record(OpKind::Delete, obj)?;
        match inner.objects.remove(&id) {
            Some(_) => { debug!(id = %id, "mem delete"); Ok(()) }
            None => Err(StoreError::NotFound(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(name: &str) -> Object {
        Object::new(Gvk::new("", "v1", "ConfigMap"), Some("a"), name)
            .with_field("data", serde_json::json!({"k": "v"}))
    }

    #[tokio::test]
    async fn create_assigns_server_fields() {
        let s = MemStore::new();
        let out = s.create(&cm("c")).await.unwrap();
        assert!(out.metadata.uid.is_some());
        assert!(out.metadata.creation_timestamp.is_some());
        assert_eq!(out.resource_version(), Some("1"));
        assert!(matches!(s.create(&cm("c")).await, Err(StoreError::AlreadyExists(_))));
        assert_eq!(s.mutation_count(), 2);
    }

    #[tokio::test]
    async fn update_checks_resource_version() {
        let s = MemStore::new();
        let seeded = s.seed(cm("c"));
        let mut stale = seeded.clone();
        stale.set_resource_version(Some("0".into()));
        assert!(s.update(&stale).await.unwrap_err().is_conflict());

        let updated = s.update(&seeded.clone().with_field("data", serde_json::json!({"k": "v2"}))).await.unwrap();
        assert_ne!(updated.resource_version(), seeded.resource_version());
        assert_eq!(updated.metadata.uid, seeded.metadata.uid);
        assert!(s.update(&cm("missing")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn list_filters_kind_namespace_and_labels() {
        let s = MemStore::new();
        s.seed(cm("b").with_label("app", "web"));
        s.seed(cm("a").with_label("app", "web"));
        s.seed(cm("c").with_label("app", "db"));
        s.seed(Object::new(Gvk::new("", "v1", "ConfigMap"), Some("other"), "d").with_label("app", "web"));
        s.seed(Object::new(Gvk::new("", "v1", "Secret"), Some("a"), "e").with_label("app", "web"));

        let sel = LabelSelector::new().with("app", "web");
        let kind = Gvk::new("", "v1", "ConfigMap");
        let names: Vec<_> = s.list(&kind, Some("a"), &sel).await.unwrap().iter().map(|o| o.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(s.list(&kind, None, &sel).await.unwrap().len(), 3);
        assert_eq!(s.list(&kind, None, &LabelSelector::new()).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn injected_fault_fires_once() {
        let s = MemStore::new();
        let obj = cm("c");
        s.fail_next(OpKind::Create, obj.identity());
        assert!(matches!(s.create(&obj).await, Err(StoreError::Backend(_))));
        assert!(s.create(&obj).await.is_ok());
        let kinds: Vec<_> = s.take_journal().into_iter().map(|op| op.kind).collect();
        assert_eq!(kinds, vec![OpKind::Create, OpKind::Create]);
        assert_eq!(s.mutation_count(), 0);
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let s = MemStore::new();
        assert!(s.delete(&cm("x")).await.unwrap_err().is_not_found());
        let seeded = s.seed(cm("x"));
        assert!(s.mark_deleting(&seeded.identity()));
        s.delete(&seeded).await.unwrap();
        assert!(s.is_empty());
    }
}
