use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use rekon_core::{KindRegistry, Object, ObjectBag, Observable, StoreError};
use rekon_store::{ObjectStore, OpKind};
use tracing::{debug, info, trace, warn};

use crate::component::Component;
use crate::diff::structurally_differs;
use crate::error::{ReconcileError, Stage};
use crate::observe::observe;
use crate::plan::{plan, Action, Plan};

/// Outcome of observe-and-mutate. Both bags are empty (never absent) when
/// `error` is set; `stage` names the last step that ran.
#[derive(Debug)]
pub struct Observation {
    pub expected: ObjectBag,
    pub observed: ObjectBag,
    pub stage: Stage,
    pub error: Option<ReconcileError>,
}

impl Observation {
    fn failed(component: &str, stage: Stage, source: anyhow::Error) -> Self {
        Self {
            expected: ObjectBag::new(),
            observed: ObjectBag::new(),
            stage,
            error: Some(ReconcileError::Observation { component: component.to_string(), stage, source }),
        }
    }
}

/// Drives components against an object store. One pass is strictly
/// sequential; the caller owns the `aggregated` bag for the whole pass.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    registry: Arc<KindRegistry>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ObjectStore>, registry: Arc<KindRegistry>) -> Self { Self { store, registry } }

    pub fn store(&self) -> &Arc<dyn ObjectStore> { &self.store }
    pub fn registry(&self) -> &KindRegistry { &self.registry }

    pub async fn observe(&self, observables: &[Observable]) -> Result<ObjectBag, StoreError> {
        observe(self.store.as_ref(), observables).await
    }

    pub async fn observe_and_mutate<R, S>(
        &self,
        c: &dyn Component<R, S>,
        rsrc: &R,
        status: &mut S,
        mutate: bool,
        aggregated: &ObjectBag,
    ) -> Observation
    where
        R: Send + Sync,
        S: Send,
    {
        let labels = c.labels();
        let expected = match c.expected_resources(rsrc, &labels, aggregated) {
            Ok(bag) => bag,
            Err(e) => return Observation::failed(c.name(), Stage::GatheringExpected, e),
        };
        let observables = c.observables(&self.registry, rsrc, &labels, &expected);
        let observed = match self.observe(&observables).await {
            Ok(bag) => bag,
            Err(e) => return Observation::failed(c.name(), Stage::Observing, e.into()),
        };
        if !mutate {
            return Observation { expected, observed, stage: Stage::Observing, error: None };
        }
        match c.mutate(rsrc, status, expected, &observed) {
            Ok(expected) => Observation { expected, observed, stage: Stage::Mutating, error: None },
            Err(e) => Observation::failed(c.name(), Stage::Mutating, e),
        }
    }

    /// Create, update and delete toward the component's expected set, then
    /// hand the reconciled set and the collected errors to the component.
    ///
    /// Every expected and observed object is processed even after failures.
    pub async fn reconcile_component<R, S>(
        &self,
        cr_name: &str,
        c: &dyn Component<R, S>,
        rsrc: &R,
        status: &mut S,
        aggregated: &mut ObjectBag,
    ) -> Result<(), ReconcileError>
    where
        R: Send + Sync,
        S: Send,
    {
        let cname = format!("{}(cmpnt:{})", cr_name, c.name());
        debug!(component = %cname, "reconciling component");
        let Observation { mut expected, observed, stage, error } =
            self.observe_and_mutate(c, rsrc, status, true, aggregated).await;

        let mut errs = Vec::new();
        if let Some(e) = error {
            warn!(component = %cname, stage = %stage, error = %e, "observe failed");
            errs.push(e);
        }
        let refs = c.owner_refs();
        for t in expected.iter_mut() {
            t.obj.set_owner_refs(&refs);
            trace!(component = %cname, exp = %t.obj.identity(), "expected");
        }
        for o in observed.objects() {
            trace!(component = %cname, obs = %o.identity(), "observed");
        }

        let plan = plan(&mut expected, &observed, |e, o| structurally_differs::<R, S, _>(c, e, o) && c.differs(e, o));
        aggregated.extend(expected);

        let mut reconciled: Vec<Object> = Vec::new();
        for action in plan.actions {
            match action {
                Action::Create(obj) => match self.store.create(&obj).await {
                    Ok(_) => {
                        info!(component = %cname, id = %obj.identity(), "+create");
                        counter!("reconcile_create_total", 1u64, "kind" => obj.gvk.kind.clone());
                        reconciled.push(obj);
                    }
                    Err(e) => errs.push(mutation_failed(&cname, OpKind::Create, &obj, e)),
                },
                Action::Update { expected, observed, diff } => {
                    match self.store.update(&expected).await {
                        Ok(_) => {
                            info!(component = %cname, id = %expected.identity(), adds = diff.adds, updates = diff.updates, removes = diff.removes, "update");
                            counter!("reconcile_update_total", 1u64, "kind" => expected.gvk.kind.clone());
                        }
                        Err(e) => errs.push(mutation_failed(&cname, OpKind::Update, &expected, e)),
                    }
                    reconciled.push(observed);
                }
                Action::Unchanged(obj) => {
                    debug!(component = %cname, id = %obj.identity(), "nochange");
                    reconciled.push(obj);
                }
                Action::MissingReferenced(identity) => {
                    warn!(component = %cname, id = %identity, "referenced resource missing");
                    errs.push(ReconcileError::ReferencedMissing { component: cname.clone(), identity });
                }
                Action::Delete(obj) => match self.store.delete(&obj).await {
                    Ok(()) => {
                        info!(component = %cname, id = %obj.identity(), "-delete");
                        counter!("reconcile_delete_total", 1u64, "kind" => obj.gvk.kind.clone());
                    }
                    Err(e) => errs.push(mutation_failed(&cname, OpKind::Delete, &obj, e)),
                },
            }
        }

        let err = ReconcileError::aggregate(errs);
        if let Some(e) = &err {
            counter!("reconcile_errors_total", e.len() as u64, "component" => c.name().to_string());
        }
        c.update_component_status(rsrc, status, &reconciled, err.as_ref());
        err.map_or(Ok(()), Err)
    }

    /// Observe without mutating, record the expected set, then let the
    /// component clean up. No deletes are issued here.
    pub async fn finalize_component<R, S>(
        &self,
        cr_name: &str,
        c: &dyn Component<R, S>,
        rsrc: &R,
        status: &mut S,
        aggregated: &mut ObjectBag,
    ) -> Result<(), ReconcileError>
    where
        R: Send + Sync,
        S: Send,
    {
        let cname = format!("{}(cmpnt:{})", cr_name, c.name());
        debug!(component = %cname, "finalizing component");
        let Observation { expected, observed, stage, error } =
            self.observe_and_mutate(c, rsrc, status, false, aggregated).await;
        let mut errs = Vec::new();
        if let Some(e) = error {
            warn!(component = %cname, stage = %stage, error = %e, "observe failed");
            errs.push(e);
        }
        aggregated.extend(expected);
        if let Err(source) = c.finalize(rsrc, status, &observed).await {
            warn!(component = %cname, error = %source, "finalize failed");
            errs.push(ReconcileError::Finalize { component: cname, source });
        }
        ReconcileError::aggregate(errs).map_or(Ok(()), Err)
    }

    /// Dry run: what `reconcile_component` would do right now, without
    /// writing. `aggregated` is not extended.
    pub async fn plan_component<R, S>(
        &self,
        c: &dyn Component<R, S>,
        rsrc: &R,
        status: &mut S,
        aggregated: &ObjectBag,
    ) -> Result<Plan, ReconcileError>
    where
        R: Send + Sync,
        S: Send,
    {
        let t0 = Instant::now();
        let Observation { mut expected, observed, error, .. } =
            self.observe_and_mutate(c, rsrc, status, true, aggregated).await;
        if let Some(e) = error {
            return Err(e);
        }
        let refs = c.owner_refs();
        for t in expected.iter_mut() {
            t.obj.set_owner_refs(&refs);
        }
        let p = plan(&mut expected, &observed, |e, o| structurally_differs::<R, S, _>(c, e, o) && c.differs(e, o));
        histogram!("reconcile_plan_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(p)
    }
}

fn mutation_failed(cname: &str, op: OpKind, obj: &Object, source: StoreError) -> ReconcileError {
    let identity = obj.identity();
    warn!(component = %cname, op = %op, id = %identity, error = %source, "mutation failed");
    ReconcileError::Mutation { op, identity, source }
}
