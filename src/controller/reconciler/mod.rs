//! # Reconciler
//!
//! Pluggable reconcile functions and the machinery that runs them.
//!
//! Every reconcile follows the same shape:
//! 1. Compute the desired children deterministically from the spec
//! 2. Read the live children from the store with a strongly consistent read
//! 3. Create what is missing (idempotent under retry)
//! 4. Update drifted engine-owned fields with the version token that was read
//! 5. Write nothing when nothing drifted
//! 6. Record the outcome on status with a status-only update
//!
//! - `types`: `Reconcilable` trait, `Context`, `Action`, `ReconcileError`, registry
//! - `error_policy`: pure success / retry / terminal decision
//! - `driver`: leader-gated worker pool
//! - `children`: steps 2-5 for one owned child
//! - `status`: step 6 with skip-if-unchanged and conflict retry

pub mod children;
pub mod driver;
pub mod error_policy;
pub mod status;
pub mod types;

pub use children::{apply_owned_child, drifted_fields, ChildOutcome};
pub use driver::{Driver, DriverConfig};
pub use error_policy::{decide, Outcome};
pub use status::{report_failure, update_status};
pub use types::{Action, Context, ErrorClass, Reconcilable, ReconcileError, ReconcilerRegistry};
