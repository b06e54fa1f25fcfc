//! # Operator Engine
//!
//! A declarative reconciliation engine for the Operator pattern.
//!
//! Users declare desired state as resources. The engine watches them, keeps a
//! local cache, queues changed keys and runs a reconcile function per key that
//! drives owned child resources toward the declared state. Only one replica
//! writes at a time, arbitrated by a lease.
//!
//! ## Quick Start
//!
//! ```rust
//! use operator_engine::prelude::*;
//! ```
//!
//! This brings commonly used types and traits into scope. For more specific imports,
//! use the individual modules.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod prelude;
pub mod runtime;
pub mod store;
