//! Rekon apply: the reconciliation engine.
//!
//! A [`Component`] produces expected objects; the [`Reconciler`] observes
//! their live counterparts, plans creates/updates/deletes by identity and
//! executes them through an [`rekon_store::ObjectStore`], collecting every
//! failure instead of stopping at the first.

#![forbid(unsafe_code)]

mod component;
mod diff;
mod engine;
mod error;
pub mod manifest;
mod observe;
mod plan;

pub use component::Component;
pub use diff::{comparable_state, diff_summary, strip_noisy, structurally_differs, DiffSummary};
pub use engine::{Observation, Reconciler};
pub use error::{ReconcileError, Stage};
pub use manifest::{parse_manifest, Manifest, ManifestComponent, ManifestStatus};
pub use observe::{labelled, observe, point_lookups};
pub use plan::{plan, Action, Plan, PlanSummary};
