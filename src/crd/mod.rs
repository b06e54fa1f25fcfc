//! # Resource Model
//!
//! Object types shared by the store, the cache and every reconciler.
//!
//! ## Module Structure
//!
//! - `meta.rs` - Object identity (`ObjectKey`), metadata and owner references
//! - `resource.rs` - The generic `Resource` envelope (kind + metadata + spec + status)
//! - `status.rs` - Engine-owned status: conditions and observed generation
//! - `appservice.rs` - The `AppService` sample kind and its `Deployment` child
//! - `manifest.rs` - Multi-document YAML manifest loading

mod appservice;
mod manifest;
mod meta;
mod resource;
mod status;

pub use appservice::{
    AppServiceSpec, ContainerSpec, DeploymentSpec, LabelSelector, PodTemplateSpec,
    APP_SERVICE_KIND, DEPLOYMENT_KIND,
};
pub use manifest::{load_manifests, parse_manifests};
pub use meta::{KeyParseError, ObjectKey, ObjectMeta, OwnerReference};
pub use resource::Resource;
pub use status::{
    Condition, ResourceStatus, CONDITION_FALSE, CONDITION_READY, CONDITION_TRUE,
    CONDITION_UNKNOWN,
};
