//! Explicit kind registry handed to the engine and to components.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::Gvk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    Namespaced,
    Cluster,
}

/// Kinds known to the hosting system and their scope.
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    kinds: FxHashMap<Gvk, Scope>,
}

impl KindRegistry {
    pub fn new() -> Self { Self::default() }

    /// Registry seeded with the built-in kinds components most commonly produce.
    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        for (g, v, k) in [
            ("", "v1", "Pod"),
            ("", "v1", "ConfigMap"),
            ("", "v1", "Secret"),
            ("", "v1", "Service"),
            ("", "v1", "ServiceAccount"),
            ("", "v1", "PersistentVolumeClaim"),
            ("apps", "v1", "Deployment"),
            ("apps", "v1", "StatefulSet"),
            ("apps", "v1", "DaemonSet"),
            ("batch", "v1", "Job"),
            ("batch", "v1", "CronJob"),
            ("networking.k8s.io", "v1", "Ingress"),
            ("policy", "v1", "PodDisruptionBudget"),
            ("rbac.authorization.k8s.io", "v1", "Role"),
            ("rbac.authorization.k8s.io", "v1", "RoleBinding"),
        ] {
            r.register(Gvk::new(g, v, k), Scope::Namespaced);
        }
        for (g, v, k) in [
            ("", "v1", "Namespace"),
            ("", "v1", "Node"),
            ("rbac.authorization.k8s.io", "v1", "ClusterRole"),
            ("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding"),
        ] {
            r.register(Gvk::new(g, v, k), Scope::Cluster);
        }
        r
    }

    pub fn register(&mut self, gvk: Gvk, scope: Scope) { self.kinds.insert(gvk, scope); }

    pub fn scope(&self, gvk: &Gvk) -> Option<Scope> { self.kinds.get(gvk).copied() }
    pub fn is_registered(&self, gvk: &Gvk) -> bool { self.kinds.contains_key(gvk) }
    pub fn is_namespaced(&self, gvk: &Gvk) -> bool { self.scope(gvk) == Some(Scope::Namespaced) }
    pub fn len(&self) -> usize { self.kinds.len() }
    pub fn is_empty(&self) -> bool { self.kinds.is_empty() }

    /// Registered kinds in key order.
    pub fn kinds(&self) -> Vec<(Gvk, Scope)> {
        let mut out: Vec<_> = self.kinds.iter().map(|(g, s)| (g.clone(), *s)).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_know_scope() {
        let r = KindRegistry::with_builtins();
        assert!(r.is_namespaced(&Gvk::new("", "v1", "ConfigMap")));
        assert_eq!(r.scope(&Gvk::new("", "v1", "Namespace")), Some(Scope::Cluster));
        assert!(!r.is_registered(&Gvk::new("example.dev", "v1", "App")));
    }

    #[test]
    fn register_overrides_scope() {
        let mut r = KindRegistry::new();
        let g = Gvk::new("example.dev", "v1", "App");
        r.register(g.clone(), Scope::Cluster);
        r.register(g.clone(), Scope::Namespaced);
        assert_eq!(r.len(), 1);
        assert!(r.is_namespaced(&g));
    }
}
