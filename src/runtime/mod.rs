//! # Runtime
//!
//! Process-level wiring.
//!
//! - `engine`: One replica: queues, ingestors, drivers and leader election
//! - `initialization`: Tracing, metrics, store seeding and HTTP server startup

pub mod engine;
pub mod initialization;

pub use engine::Engine;
pub use initialization::{build_engines, default_registry, initialize, InitializationResult};
