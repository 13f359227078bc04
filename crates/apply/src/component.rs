use std::collections::BTreeMap;

use async_trait::async_trait;
use rekon_core::{KindRegistry, Object, ObjectBag, Observable, OwnerRef};
use serde_json::Value as Json;

use crate::diff::comparable_state;
use crate::error::ReconcileError;

/// A named producer of part of a custom resource's desired state.
///
/// `R` is the custom resource the component belongs to and `S` the status
/// value components merge their outcome into during one pass. Components are
/// owned by the hosting application; the engine only calls the methods below.
#[async_trait]
pub trait Component<R, S>: Send + Sync
where
    R: Send + Sync,
    S: Send,
{
    fn name(&self) -> &str;

    /// Labels used to tag (and later find) everything this component produces.
    fn labels(&self) -> BTreeMap<String, String>;

    /// Owner references stamped onto every expected object.
    fn owner_refs(&self) -> Vec<OwnerRef>;

    /// Desired objects. `aggregated` holds what earlier components of the same
    /// resource produced in this pass.
    fn expected_resources(
        &self,
        rsrc: &R,
        labels: &BTreeMap<String, String>,
        aggregated: &ObjectBag,
    ) -> anyhow::Result<ObjectBag>;

    /// Read requests whose results are the live counterparts of `expected`.
    fn observables(
        &self,
        registry: &KindRegistry,
        rsrc: &R,
        labels: &BTreeMap<String, String>,
        expected: &ObjectBag,
    ) -> Vec<Observable>;

    /// Rewrite expected objects using observed state (e.g. carry over
    /// server-assigned fields). Only called when reconciling.
    fn mutate(&self, _rsrc: &R, _status: &mut S, expected: ObjectBag, _observed: &ObjectBag) -> anyhow::Result<ObjectBag> {
        Ok(expected)
    }

    /// State compared by the structural check.
    fn comparable(&self, obj: &Object) -> Json {
        comparable_state(obj)
    }

    /// Component-specific divergence check, consulted after the structural one.
    fn differs(&self, _expected: &Object, _observed: &Object) -> bool {
        true
    }

    /// Cleanup while the resource is pending deletion. The engine issues no
    /// deletes of its own on this path.
    async fn finalize(&self, _rsrc: &R, _status: &mut S, _observed: &ObjectBag) -> anyhow::Result<()> {
        Ok(())
    }

    /// Merge this component's outcome into the status.
    fn update_component_status(&self, rsrc: &R, status: &mut S, reconciled: &[Object], err: Option<&ReconcileError>);
}
