//! Rekon kubehub – object store over a live Kubernetes API server, and
//! discovery of served kinds into a [`KindRegistry`].

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope as KubeScope},
    Client,
};
use metrics::counter;
use rekon_core::{Gvk, Identity, KindRegistry, LabelSelector, Object, Scope, StoreError};
use rekon_store::{ObjectStore, OpKind};
use rustc_hash::FxHashMap;
use tracing::{debug, info};

fn field_manager() -> String {
    std::env::var("REKON_FIELD_MANAGER").unwrap_or_else(|_| "rekon".to_string())
}

/// Client from the ambient kubeconfig / in-cluster environment.
pub async fn client() -> Result<Client> {
    Client::try_default().await.context("building kube client")
}

/// Every served kind (incl. CRDs) with its scope.
pub async fn discover_registry(client: Client) -> Result<KindRegistry> {
    let discovery = Discovery::new(client).run().await?;
    let mut reg = KindRegistry::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            let scope = match caps.scope {
                KubeScope::Namespaced => Scope::Namespaced,
                KubeScope::Cluster => Scope::Cluster,
            };
            reg.register(Gvk::new(&ar.group, &ar.version, &ar.kind), scope);
        }
    }
    info!(kinds = reg.len(), "discovery complete");
    Ok(reg)
}

async fn find_api_resource(client: Client, gvk: &Gvk) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, KubeScope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}", gvk))
}

pub fn to_dynamic(obj: &Object) -> Result<DynamicObject, StoreError> {
    let v = obj.to_value().map_err(|e| StoreError::Invalid(format!("serializing {}: {}", obj.identity(), e)))?;
    serde_json::from_value(v).map_err(|e| StoreError::Invalid(format!("converting {}: {}", obj.identity(), e)))
}

/// List items usually arrive without `apiVersion`/`kind`; `gvk` fills them in.
pub fn from_dynamic(gvk: &Gvk, d: &DynamicObject) -> Result<Object, StoreError> {
    let mut v = serde_json::to_value(d).map_err(|e| StoreError::Backend(e.into()))?;
    if let Some(map) = v.as_object_mut() {
        map.insert("apiVersion".into(), serde_json::Value::String(gvk.api_version()));
        map.insert("kind".into(), serde_json::Value::String(gvk.kind.clone()));
        if let Some(meta) = map.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.remove("managedFields");
        }
    }
    Object::from_value(v).map_err(|e| StoreError::Backend(e.into()))
}

pub fn map_kube_err(err: kube::Error, op: Option<OpKind>, obj_id: &Identity, rv: Option<&str>) -> StoreError {
    if let kube::Error::Api(ae) = &err {
        match ae.code {
            404 => return StoreError::NotFound(obj_id.clone()),
            409 if op == Some(OpKind::Create) => return StoreError::AlreadyExists(obj_id.clone()),
            409 => {
                return StoreError::Conflict {
                    identity: obj_id.clone(),
                    expected: rv.unwrap_or_default().to_string(),
                    actual: ae.message.clone(),
                }
            }
            400 | 422 => return StoreError::Invalid(ae.message.clone()),
            _ => {}
        }
    }
    StoreError::Backend(anyhow::Error::new(err))
}

/// A rejected list query (bad selector, unsupported parameters) is `Invalid`;
/// anything else stays a backend failure.
pub fn map_list_err(err: kube::Error, kind: &Gvk, selector: &LabelSelector) -> StoreError {
    if let kube::Error::Api(ae) = &err {
        if matches!(ae.code, 400 | 422) {
            return StoreError::Invalid(format!("listing {} ({}): {}", kind, selector, ae.message));
        }
    }
    StoreError::Backend(anyhow::Error::new(err).context(format!("listing {} ({})", kind, selector)))
}

/// [`ObjectStore`] backed by `Api<DynamicObject>`; API resources are resolved
/// through discovery once per kind and cached.
pub struct KubeStore {
    client: Client,
    resources: ArcSwap<FxHashMap<Gvk, (ApiResource, bool)>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client, resources: ArcSwap::from_pointee(FxHashMap::default()) }
    }

    async fn resolve(&self, gvk: &Gvk) -> Result<(ApiResource, bool), StoreError> {
        if let Some(hit) = self.resources.load().get(gvk) {
            return Ok(hit.clone());
        }
        let found = find_api_resource(self.client.clone(), gvk).await?;
        debug!(gvk = %gvk, namespaced = found.1, "resolved api resource");
        self.resources.rcu(|cur| {
            let mut next = FxHashMap::clone(cur);
            next.insert(gvk.clone(), found.clone());
            next
        });
        Ok(found)
    }

    async fn api_for(&self, id: &Identity) -> Result<Api<DynamicObject>, StoreError> {
        let (ar, namespaced) = self.resolve(&id.kind).await?;
        match (namespaced, id.namespace.as_deref()) {
            (true, Some(ns)) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
            (true, None) => Err(StoreError::Invalid(format!("namespace required for namespaced kind: {}", id))),
            (false, _) => Ok(Api::all_with(self.client.clone(), &ar)),
        }
    }

    fn post_params() -> PostParams {
        PostParams { field_manager: Some(field_manager()), ..PostParams::default() }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, id: &Identity) -> Result<Object, StoreError> {
        let api = self.api_for(id).await?;
        let d = api.get(&id.name).await.map_err(|e| map_kube_err(e, None, id, None))?;
        from_dynamic(&id.kind, &d)
    }

    async fn list(&self, kind: &Gvk, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<Object>, StoreError> {
        let (ar, namespaced) = self.resolve(kind).await?;
        let api: Api<DynamicObject> = match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(&selector.to_string());
        }
        let list = api.list(&lp).await.map_err(|e| map_list_err(e, kind, selector))?;
        list.items.iter().map(|d| from_dynamic(kind, d)).collect()
    }

    async fn create(&self, obj: &Object) -> Result<Object, StoreError> {
        let id = obj.identity();
        let api = self.api_for(&id).await?;
        counter!("store_ops_total", 1u64, "op" => "create");
        let created = api
            .create(&Self::post_params(), &to_dynamic(obj)?)
            .await
            .map_err(|e| map_kube_err(e, Some(OpKind::Create), &id, None))?;
        from_dynamic(&id.kind, &created)
    }

    async fn update(&self, obj: &Object) -> Result<Object, StoreError> {
        let id = obj.identity();
        let api = self.api_for(&id).await?;
        counter!("store_ops_total", 1u64, "op" => "update");
        let replaced = api
            .replace(&id.name, &Self::post_params(), &to_dynamic(obj)?)
            .await
            .map_err(|e| map_kube_err(e, Some(OpKind::Update), &id, obj.resource_version()))?;
        from_dynamic(&id.kind, &replaced)
    }

    async fn delete(&self, obj: &Object) -> Result<(), StoreError> {
        let id = obj.identity();
        let api = self.api_for(&id).await?;
        counter!("store_ops_total", 1u64, "op" => "delete");
        api.delete(&id.name, &DeleteParams::background())
            .await
            .map_err(|e| map_kube_err(e, Some(OpKind::Delete), &id, None))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_err(code: u16, msg: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: msg.into(), reason: "x".into(), code })
    }

    fn pod_id() -> Identity { Identity::new(Gvk::new("", "v1", "Pod"), Some("a"), "x") }

    #[test]
    fn kube_errors_map_to_store_errors() {
        let id = pod_id();
        assert!(map_kube_err(api_err(404, "gone"), None, &id, None).is_not_found());
        assert!(matches!(
            map_kube_err(api_err(409, "exists"), Some(OpKind::Create), &id, None),
            StoreError::AlreadyExists(_)
        ));
        match map_kube_err(api_err(409, "modified"), Some(OpKind::Update), &id, Some("5")) {
            StoreError::Conflict { expected, actual, .. } => {
                assert_eq!(expected, "5");
                assert_eq!(actual, "modified");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(map_kube_err(api_err(422, "bad"), Some(OpKind::Create), &id, None), StoreError::Invalid(_)));
        assert!(matches!(map_kube_err(api_err(500, "boom"), None, &id, None), StoreError::Backend(_)));
    }

    #[test]
    fn rejected_list_query_is_invalid() {
        let kind = Gvk::new("", "v1", "Pod");
        let sel = LabelSelector::new().with("app", "web");
        match map_list_err(api_err(400, "unable to parse requirement"), &kind, &sel) {
            StoreError::Invalid(msg) => {
                assert!(msg.contains("app=web"), "{msg}");
                assert!(msg.ends_with("unable to parse requirement"), "{msg}");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(map_list_err(api_err(422, "bad"), &kind, &sel), StoreError::Invalid(_)));
        assert!(matches!(map_list_err(api_err(503, "unavailable"), &kind, &sel), StoreError::Backend(_)));
    }

    #[test]
    fn dynamic_conversion_fills_type_meta_and_drops_managed_fields() {
        let d: DynamicObject = serde_json::from_value(serde_json::json!({
            "metadata": {
                "name": "c",
                "namespace": "a",
                "resourceVersion": "42",
                "managedFields": [{"manager": "kubectl"}]
            },
            "data": {"k": "v"}
        }))
        .unwrap();
        let gvk = Gvk::new("", "v1", "ConfigMap");
        let o = from_dynamic(&gvk, &d).unwrap();
        assert_eq!(o.gvk, gvk);
        assert_eq!(o.identity().to_string(), "a/ConfigMap/c");
        assert_eq!(o.resource_version(), Some("42"));
        assert_eq!(o.payload(), Some(&serde_json::json!({"k": "v"})));

        let back = to_dynamic(&o).unwrap();
        assert_eq!(back.metadata.name.as_deref(), Some("c"));
        assert_eq!(back.types.map(|t| t.kind), Some("ConfigMap".to_string()));
    }
}
