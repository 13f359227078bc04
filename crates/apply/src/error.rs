use std::fmt;

use rekon_core::{Identity, StoreError};
use rekon_store::OpKind;

/// Step of observe-and-mutate that was running when a component failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    GatheringExpected,
    Observing,
    Mutating,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::GatheringExpected => "gathering expected resources",
            Stage::Observing => "observing resources",
            Stage::Mutating => "mutating resources",
        })
    }
}

/// Everything that can go wrong in one reconciliation pass. Nothing here is
/// fatal to the process: every variant is scoped to the pass that produced it.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The custom resource vanished before the pass started.
    #[error("not found: {0}")]
    NotFound(Identity),
    #[error("fetching {identity}: {source}")]
    Fetch { identity: Identity, source: StoreError },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{component}: {stage}: {source:#}")]
    Observation { component: String, stage: Stage, source: anyhow::Error },
    #[error("missing resource not managed by {component}: {identity}")]
    ReferencedMissing { component: String, identity: Identity },
    #[error("{op} {identity}: {source}")]
    Mutation { op: OpKind, identity: Identity, source: StoreError },
    #[error("finalizing {component}: {source:#}")]
    Finalize { component: String, source: anyhow::Error },
    #[error("persisting status of {identity}: {source}")]
    Persist { identity: Identity, source: StoreError },
    #[error("{}", render_aggregate(.0))]
    Aggregate(Vec<ReconcileError>),
}

fn render_aggregate(errs: &[ReconcileError]) -> String {
    let parts: Vec<String> = errs.iter().map(|e| e.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

impl ReconcileError {
    /// Collapse a list of errors: none → `None`, one → itself, more → `Aggregate`.
    /// Nested aggregates are flattened.
    pub fn aggregate(errs: Vec<ReconcileError>) -> Option<ReconcileError> {
        let mut flat = Vec::with_capacity(errs.len());
        for e in errs {
            match e {
                ReconcileError::Aggregate(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(ReconcileError::Aggregate(flat)),
        }
    }

    /// Leaf errors, in the order they were recorded.
    pub fn errors(&self) -> Vec<&ReconcileError> {
        match self {
            ReconcileError::Aggregate(inner) => inner.iter().flat_map(|e| e.errors()).collect(),
            other => vec![other],
        }
    }

    pub fn len(&self) -> usize { self.errors().len() }

    pub fn is_not_found(&self) -> bool { matches!(self, ReconcileError::NotFound(_)) }

    pub fn kind_str(&self) -> &'static str {
        match self {
            ReconcileError::NotFound(_) => "not_found",
            ReconcileError::Fetch { .. } => "fetch",
            ReconcileError::Validation(_) => "validation",
            ReconcileError::Observation { .. } => "observation",
            ReconcileError::ReferencedMissing { .. } => "referenced_missing",
            ReconcileError::Mutation { .. } => "mutation",
            ReconcileError::Finalize { .. } => "finalize",
            ReconcileError::Persist { .. } => "persist",
            ReconcileError::Aggregate(_) => "aggregate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekon_core::Gvk;

    fn missing(name: &str) -> ReconcileError {
        ReconcileError::ReferencedMissing {
            component: "c".into(),
            identity: Identity::new(Gvk::new("", "v1", "Secret"), Some("a"), name),
        }
    }

    #[test]
    fn aggregate_collapses_and_flattens() {
        assert!(ReconcileError::aggregate(vec![]).is_none());
        let one = ReconcileError::aggregate(vec![missing("x")]).unwrap();
        assert!(matches!(one, ReconcileError::ReferencedMissing { .. }));

        let inner = ReconcileError::aggregate(vec![missing("x"), missing("y")]).unwrap();
        let outer = ReconcileError::aggregate(vec![inner, ReconcileError::Validation("bad".into())]).unwrap();
        assert_eq!(outer.len(), 3);
        match &outer {
            ReconcileError::Aggregate(v) => assert_eq!(v.len(), 3),
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[test]
    fn aggregate_display_lists_members() {
        let e = ReconcileError::aggregate(vec![missing("x"), missing("y")]).unwrap();
        assert_eq!(
            e.to_string(),
            "[missing resource not managed by c: a/Secret/x, missing resource not managed by c: a/Secret/y]"
        );
    }

    #[test]
    fn observation_error_names_stage() {
        let e = ReconcileError::Observation {
            component: "web".into(),
            stage: Stage::Observing,
            source: anyhow::anyhow!("boom"),
        };
        assert_eq!(e.to_string(), "web: observing resources: boom");
    }
}
