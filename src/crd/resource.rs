//! # Resource
//!
//! The generic object envelope. The engine never interprets `spec` itself;
//! kind-specific reconcilers decode it with [`Resource::spec_as`].

use crate::crd::meta::{ObjectKey, ObjectMeta, OwnerReference};
use crate::crd::status::ResourceStatus;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub kind: String,
    pub metadata: ObjectMeta,
    /// Declared intent. Owned by whoever created the object; the engine only reads it.
    #[serde(default)]
    pub spec: serde_json::Value,
    /// Engine-owned output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResourceStatus>,
}

impl Resource {
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        spec: serde_json::Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: None,
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn uid(&self) -> &str {
        &self.metadata.uid
    }

    pub fn resource_version(&self) -> u64 {
        self.metadata.resource_version
    }

    /// Decode the spec into the kind's typed representation
    pub fn spec_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.spec.clone())
    }

    /// Build a controller owner reference pointing at this object
    pub fn controller_reference(&self) -> OwnerReference {
        OwnerReference {
            kind: self.kind.clone(),
            name: self.metadata.name.clone(),
            uid: self.metadata.uid.clone(),
            controller: true,
        }
    }

    /// Whether `owner` is recorded as this object's controller
    pub fn is_controlled_by(&self, owner: &Resource) -> bool {
        self.metadata
            .controller_owner()
            .is_some_and(|r| r.kind == owner.kind && r.uid == owner.metadata.uid)
    }
}
