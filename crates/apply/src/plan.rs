//! Matching expected against observed objects by identity.

use rekon_core::{Identity, Object, ObjectBag};
use serde::Serialize;

use crate::diff::{diff_summary, strip_noisy, DiffSummary};

/// One step of a reconciliation, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Managed and absent from the live set.
    Create(Object),
    /// Managed, present, and divergent. `expected` already carries the
    /// observed resource version.
    Update { expected: Object, observed: Object, diff: DiffSummary },
    /// Present and left alone (referenced, or no divergence).
    Unchanged(Object),
    /// Referenced and absent; never created.
    MissingReferenced(Identity),
    /// Live but no longer expected.
    Delete(Object),
}

impl Action {
    pub fn identity(&self) -> Identity {
        match self {
            Action::Create(o) | Action::Unchanged(o) | Action::Delete(o) => o.identity(),
            Action::Update { expected, .. } => expected.identity(),
            Action::MissingReferenced(id) => id.clone(),
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(self, Action::Create(_) | Action::Update { .. } | Action::Delete(_))
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Action::Create(_) => "create",
            Action::Update { .. } => "update",
            Action::Unchanged(_) => "unchanged",
            Action::MissingReferenced(_) => "missing",
            Action::Delete(_) => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub unchanged: usize,
    pub missing: usize,
    pub delete: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub actions: Vec<Action>,
}

impl Plan {
    pub fn summary(&self) -> PlanSummary {
        let mut s = PlanSummary::default();
        for a in &self.actions {
            match a {
                Action::Create(_) => s.create += 1,
                Action::Update { .. } => s.update += 1,
                Action::Unchanged(_) => s.unchanged += 1,
                Action::MissingReferenced(_) => s.missing += 1,
                Action::Delete(_) => s.delete += 1,
            }
        }
        s
    }

    /// No create, update or delete would be issued.
    pub fn is_noop(&self) -> bool { !self.actions.iter().any(Action::is_mutation) }

    pub fn mutations(&self) -> impl Iterator<Item = &Action> + '_ { self.actions.iter().filter(|a| a.is_mutation()) }
}

/// Match every expected object against `observed` (first identity match
/// wins), then delete every observed object nothing expects.
///
/// Resource versions are copied onto matched entries of `expected` in place.
/// `should_update` is only consulted for managed objects with a live match.
pub fn plan<F>(expected: &mut ObjectBag, observed: &ObjectBag, should_update: F) -> Plan
where
    F: Fn(&Object, &Object) -> bool,
{
    let mut actions = Vec::with_capacity(expected.len() + observed.len());
    for e in expected.iter_mut() {
        match observed.objects().find(|o| o.same_identity(&e.obj)) {
            Some(o) => {
                e.obj.set_resource_version(o.metadata.resource_version.clone());
                if e.is_managed() && should_update(&e.obj, o) {
                    let diff = diff_summary(&strip_noisy(&e.obj), &strip_noisy(o));
                    actions.push(Action::Update { expected: e.obj.clone(), observed: o.clone(), diff });
                } else {
                    actions.push(Action::Unchanged(o.clone()));
                }
            }
            None if e.is_managed() => actions.push(Action::Create(e.obj.clone())),
            None => actions.push(Action::MissingReferenced(e.obj.identity())),
        }
    }
    for o in observed.objects() {
        if !expected.objects().any(|e| e.same_identity(o)) {
            actions.push(Action::Delete(o.clone()));
        }
    }
    Plan { actions }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekon_core::Gvk;
    use serde_json::json;

    fn pod(name: &str) -> Object { Object::new(Gvk::new("", "v1", "Pod"), Some("a"), name) }

    fn cm(data: &str, rv: Option<&str>) -> Object {
        let mut o = Object::new(Gvk::new("", "v1", "ConfigMap"), Some("a"), "c").with_field("data", json!({"k": data}));
        o.set_resource_version(rv.map(String::from));
        o
    }

    #[test]
    fn missing_managed_is_created_and_stray_is_deleted() {
        let mut expected = ObjectBag::new();
        expected.add_managed(pod("x"));
        let mut observed = ObjectBag::new();
        observed.add_managed(pod("y"));
        let p = plan(&mut expected, &observed, |_, _| true);
        assert_eq!(p.actions, vec![Action::Create(pod("x")), Action::Delete(pod("y"))]);
        assert_eq!(p.summary(), PlanSummary { create: 1, delete: 1, ..Default::default() });
    }

    #[test]
    fn match_copies_resource_version_before_update() {
        let mut expected = ObjectBag::new();
        expected.add_managed(cm("v2", None));
        let mut observed = ObjectBag::new();
        observed.add_managed(cm("v1", Some("9")));
        let p = plan(&mut expected, &observed, |_, _| true);
        assert_eq!(expected.items()[0].obj.resource_version(), Some("9"));
        match &p.actions[..] {
            [Action::Update { expected, diff, .. }] => {
                assert_eq!(expected.resource_version(), Some("9"));
                assert_eq!(diff.updates, 1);
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn referenced_objects_are_never_created_or_updated() {
        let mut expected = ObjectBag::new();
        expected.add_referenced(pod("r"));
        expected.add_referenced(cm("v2", None));
        let mut observed = ObjectBag::new();
        observed.add_managed(cm("v1", Some("3")));
        let p = plan(&mut expected, &observed, |_, _| true);
        assert_eq!(
            p.actions,
            vec![Action::MissingReferenced(pod("r").identity()), Action::Unchanged(cm("v1", Some("3")))]
        );
        assert!(p.is_noop());
    }

    #[test]
    fn predicate_veto_leaves_match_unchanged() {
        let mut expected = ObjectBag::new();
        expected.add_managed(cm("v2", None));
        let mut observed = ObjectBag::new();
        observed.add_managed(cm("v1", Some("1")));
        let p = plan(&mut expected, &observed, |_, _| false);
        assert!(p.is_noop());
        assert_eq!(p.summary().unchanged, 1);
    }
}
