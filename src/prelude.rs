//! # Prelude
//!
//! Re-exports commonly used types and traits for convenience.
//!
//! ## Usage
//!
//! ```rust
//! use operator_engine::prelude::*;
//! ```
//!
//! This brings into scope:
//! - Resource types (Resource, ObjectKey, ResourceStatus, etc.)
//! - The store and lease traits with their in-memory implementations
//! - Reconciler types (Reconcilable, Context, Action, ReconcileError, etc.)
//! - The engine and its configuration

// Resource types - most commonly used
pub use crate::crd::*;

// Store traits - needed for implementing backends
pub use crate::store::{
    InMemoryLease, InMemoryStore, LeaseLock, LeaseOutcome, Store, StoreError, WatchEvent,
};

// Reconciler types - needed for implementing reconcile functions
pub use crate::controller::client::Client;
pub use crate::controller::reconciler::{
    apply_owned_child, update_status, Action, ChildOutcome, Context, Reconcilable,
    ReconcileError, ReconcilerRegistry,
};

// Engine and configuration
pub use crate::config::ControllerConfig;
pub use crate::controller::leader::{LeaderState, LeaderStatus};
pub use crate::runtime::Engine;
