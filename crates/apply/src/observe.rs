//! Resolving observables into live objects.

use rekon_core::{Gvk, KindRegistry, LabelSelector, ObjectBag, Observable, StoreError};
use rekon_store::ObjectStore;
use tracing::{trace, warn};

/// Resolve `observables` in order. A point lookup that finds nothing leaves
/// the object out; any other store failure aborts the whole call.
pub async fn observe(store: &dyn ObjectStore, observables: &[Observable]) -> Result<ObjectBag, StoreError> {
    let mut bag = ObjectBag::new();
    for obs in observables {
        match obs {
            Observable::Get(id) => match store.get(id).await {
                Ok(obj) => {
                    trace!(id = %id, "observed");
                    bag.add_managed(obj);
                }
                Err(StoreError::NotFound(_)) => trace!(id = %id, "absent"),
                Err(e) => return Err(e),
            },
            Observable::List { kind, namespace, selector } => {
                let items = store.list(kind, namespace.as_deref(), selector).await?;
                trace!(kind = %kind, selector = %selector, count = items.len(), "listed");
                bag.extend(items.into_iter().map(rekon_core::TaggedObject::managed));
            }
        }
    }
    Ok(bag)
}

/// One point lookup per expected object.
pub fn point_lookups(expected: &ObjectBag) -> Vec<Observable> {
    expected.objects().map(|o| Observable::Get(o.identity())).collect()
}

/// One labelled list per distinct kind. Cluster-scoped kinds are listed
/// without a namespace. Kinds the registry does not know are still listed in
/// `namespace`; the store resolves their scope or fails the observation.
pub fn labelled<'a>(
    registry: &KindRegistry,
    namespace: Option<&str>,
    selector: &LabelSelector,
    kinds: impl IntoIterator<Item = &'a Gvk>,
) -> Vec<Observable> {
    let mut seen: Vec<&Gvk> = Vec::new();
    let mut out = Vec::new();
    for kind in kinds {
        if seen.contains(&kind) {
            continue;
        }
        seen.push(kind);
        let namespace = match registry.scope(kind) {
            Some(rekon_core::Scope::Cluster) => None,
            Some(rekon_core::Scope::Namespaced) => namespace.map(str::to_string),
            None => {
                warn!(kind = %kind, "kind not registered; listing in the requested namespace");
                namespace.map(str::to_string)
            }
        };
        out.push(Observable::List { kind: kind.clone(), namespace, selector: selector.clone() });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekon_core::{Identity, Object};
    use rekon_store::MemStore;

    fn cm(name: &str) -> Object { Object::new(Gvk::new("", "v1", "ConfigMap"), Some("a"), name) }

    #[tokio::test]
    async fn missing_point_lookup_is_absent_not_error() {
        let store = MemStore::new();
        store.seed(cm("x"));
        let obs = vec![Observable::Get(cm("x").identity()), Observable::Get(cm("gone").identity())];
        let bag = observe(&store, &obs).await.unwrap();
        assert_eq!(bag.len(), 1);
        assert!(bag.find(&cm("x").identity()).is_some());
    }

    #[tokio::test]
    async fn list_failure_aborts() {
        struct Broken;
        #[async_trait::async_trait]
        impl ObjectStore for Broken {
            async fn get(&self, id: &Identity) -> Result<Object, StoreError> { Err(StoreError::NotFound(id.clone())) }
            async fn list(&self, _: &Gvk, _: Option<&str>, _: &LabelSelector) -> Result<Vec<Object>, StoreError> {
                Err(StoreError::Backend(anyhow::anyhow!("connection refused")))
            }
            async fn create(&self, o: &Object) -> Result<Object, StoreError> { Ok(o.clone()) }
            async fn update(&self, o: &Object) -> Result<Object, StoreError> { Ok(o.clone()) }
            async fn delete(&self, _: &Object) -> Result<(), StoreError> { Ok(()) }
        }
        let obs = vec![
            Observable::Get(cm("x").identity()),
            Observable::List { kind: Gvk::new("", "v1", "ConfigMap"), namespace: None, selector: LabelSelector::new() },
        ];
        let err = observe(&Broken, &obs).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[test]
    fn labelled_dedups_scopes_and_keeps_unregistered_kinds() {
        let reg = KindRegistry::with_builtins();
        let cm = Gvk::new("", "v1", "ConfigMap");
        let ns = Gvk::new("", "v1", "Namespace");
        let unknown = Gvk::new("example.com", "v1", "Widget");
        let sel = LabelSelector::new().with("app", "web");
        let out = labelled(&reg, Some("a"), &sel, [&cm, &ns, &cm, &unknown]);
        assert_eq!(
            out,
            vec![
                Observable::List { kind: cm.clone(), namespace: Some("a".into()), selector: sel.clone() },
                Observable::List { kind: ns, namespace: None, selector: sel.clone() },
                Observable::List { kind: unknown, namespace: Some("a".into()), selector: sel },
            ]
        );
    }
}
