//! Structural comparison of expected vs observed objects.

use rekon_core::Object;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::component::Component;

/// Natural payload (`spec`, else `data`); kinds with neither compare their
/// whole body minus server-populated `status`.
pub fn comparable_state(obj: &Object) -> Json {
    match obj.payload() {
        Some(p) => p.clone(),
        None => {
            let mut body = obj.body.clone();
            body.remove("status");
            Json::Object(body)
        }
    }
}

pub fn structurally_differs<R, S, C>(c: &C, expected: &Object, observed: &Object) -> bool
where
    R: Send + Sync,
    S: Send,
    C: Component<R, S> + ?Sized,
{
    c.comparable(expected) != c.comparable(observed)
}

/// Wire form with server-owned bookkeeping removed, for reporting diffs.
pub fn strip_noisy(obj: &Object) -> Json {
    let mut v = obj.to_value().unwrap_or(Json::Null);
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for k in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid"] {
            meta.remove(k);
        }
    }
    if let Some(map) = v.as_object_mut() { map.remove("status"); }
    v
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

/// Count leaf-level adds/updates/removes turning `base` into `target`.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => { if av != bv { s.updates += 1; } }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}
