//! Rekon controller: one reconciliation pass per custom resource.
//!
//! Fetch → validate → default → reconcile (or finalize) every component →
//! commit status. Components never stop each other; all of their errors end
//! up in the pass result and in the status decision.

#![forbid(unsafe_code)]

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use rekon_apply::{Component, ReconcileError, Reconciler};
use rekon_core::{Gvk, Identity, KindRegistry, NamespacedName, Object, ObjectBag, ObjectMeta, StoreError};
use rekon_store::ObjectStore;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error, info, warn};

/// The root entity a controller reconciles. Instances travel through the
/// store as [`Object`]s and are converted with serde.
pub trait CustomResource: Serialize + DeserializeOwned + Send + Sync + Sized + 'static {
    type Status: Send;

    fn gvk() -> Gvk;

    fn meta(&self) -> &ObjectMeta;

    fn new_status(&self) -> Self::Status;

    fn validate(&self) -> anyhow::Result<()>;

    fn apply_defaults(&mut self) {}

    /// Components in reconciliation order.
    fn components(&self) -> Vec<Box<dyn Component<Self, Self::Status>>>;

    /// Take the pass outcome; `true` when the resource must be written back.
    fn update_status(&mut self, status: Self::Status, err: Option<&ReconcileError>) -> bool;
}

/// Carries no requeue hint; scheduling is the caller's business.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult;

pub struct Controller<R> {
    reconciler: Reconciler,
    _kind: PhantomData<fn() -> R>,
}

impl<R> Clone for Controller<R> {
    fn clone(&self) -> Self { Self { reconciler: self.reconciler.clone(), _kind: PhantomData } }
}

impl<R: CustomResource> Controller<R> {
    pub fn new(store: Arc<dyn ObjectStore>, registry: Arc<KindRegistry>) -> Self {
        Self { reconciler: Reconciler::new(store, registry), _kind: PhantomData }
    }

    pub fn reconciler(&self) -> &Reconciler { &self.reconciler }

    fn identity(nn: &NamespacedName) -> Identity { Identity::new(R::gvk(), nn.namespace.as_deref(), &nn.name) }

    /// One full pass. `NotFound` means the resource is gone and nothing was
    /// written.
    pub async fn reconcile_cr(&self, nn: &NamespacedName) -> Result<(), ReconcileError> {
        let id = Self::identity(nn);
        let name = id.to_string();
        let obj = match self.reconciler.store().get(&id).await {
            Ok(o) => o,
            Err(StoreError::NotFound(_)) => {
                warn!(cr = %name, "not found");
                return Err(ReconcileError::NotFound(id));
            }
            Err(source) => return Err(ReconcileError::Fetch { identity: id, source }),
        };
        let deleting = obj.is_deletion_pending();
        let mut rsrc: R = obj
            .to_typed()
            .map_err(|e| ReconcileError::Fetch { identity: id.clone(), source: StoreError::Invalid(e.to_string()) })?;

        let mut status = rsrc.new_status();
        let mut errs = Vec::new();
        debug!(cr = %name, generation = ?rsrc.meta().generation, "validating spec");
        match rsrc.validate() {
            Err(e) => {
                let msg = format!("{e:#}");
                warn!(cr = %name, error = %msg, "validation failed");
                errs.push(ReconcileError::Validation(msg));
            }
            Ok(()) => {
                debug!(cr = %name, "applying defaults");
                rsrc.apply_defaults();
                let mut aggregated = ObjectBag::new();
                for c in rsrc.components() {
                    let res = if deleting {
                        self.reconciler.finalize_component(&name, c.as_ref(), &rsrc, &mut status, &mut aggregated).await
                    } else {
                        self.reconciler.reconcile_component(&name, c.as_ref(), &rsrc, &mut status, &mut aggregated).await
                    };
                    if let Err(e) = res {
                        errs.push(e);
                    }
                }
            }
        }

        let mut err = ReconcileError::aggregate(errs);
        if rsrc.update_status(status, err.as_ref()) {
            match self.persist(&rsrc).await {
                Ok(_) => debug!(cr = %name, "status persisted"),
                Err(source) => {
                    error!(cr = %name, error = %source, "error updating status");
                    let persist = ReconcileError::Persist { identity: id, source };
                    err = ReconcileError::aggregate(err.into_iter().chain([persist]).collect());
                }
            }
        }
        err.map_or(Ok(()), Err)
    }

    async fn persist(&self, rsrc: &R) -> Result<Object, StoreError> {
        let obj = Object::from_typed(&R::gvk(), rsrc).map_err(|e| StoreError::Invalid(e.to_string()))?;
        self.reconciler.store().update(&obj).await
    }

    /// Entry point for the scheduling layer: a vanished resource is not an error.
    pub async fn reconcile(&self, nn: &NamespacedName) -> Result<ReconcileResult, ReconcileError> {
        let t0 = Instant::now();
        let res = self.reconcile_cr(nn).await;
        histogram!("reconcile_pass_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(()) => {
                counter!("reconcile_passes_total", 1u64, "outcome" => "ok");
                Ok(ReconcileResult)
            }
            Err(e) if e.is_not_found() => {
                counter!("reconcile_passes_total", 1u64, "outcome" => "gone");
                info!(cr = %nn, "resource gone; nothing to reconcile");
                Ok(ReconcileResult)
            }
            Err(e) => {
                counter!("reconcile_passes_total", 1u64, "outcome" => "error");
                error!(cr = %nn, errors = e.len(), error = %e, "reconcile failed");
                Err(e)
            }
        }
    }
}
