//! # Configuration
//!
//! - `controller.rs` - Engine settings loaded from the environment

mod controller;

pub use controller::{generated_identity, ConfigError, ControllerConfig};
