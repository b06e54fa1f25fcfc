//! # AppService
//!
//! Sample kind driven by the engine: an `AppService` declares a replica count
//! and an image, and is realized by one `Deployment` child of the same name.
//!
//! # Example
//!
//! ```yaml
//! kind: AppService
//! metadata:
//!   name: web
//!   namespace: default
//! spec:
//!   replicas: 2
//!   image: nginx:1.27
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const APP_SERVICE_KIND: &str = "AppService";
pub const DEPLOYMENT_KIND: &str = "Deployment";

/// Declared intent of an `AppService`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppServiceSpec {
    pub replicas: i32,
    pub image: String,
}

/// Body of the `Deployment` child
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    pub replicas: i32,
    pub selector: LabelSelector,
    pub template: PodTemplateSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateSpec {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
}

impl AppServiceSpec {
    /// Reject specs that can never be realized
    pub fn validate(&self) -> Result<(), String> {
        if self.replicas < 0 {
            return Err(format!("replicas must be >= 0, got {}", self.replicas));
        }
        if self.image.trim().is_empty() {
            return Err("image must not be empty".to_string());
        }
        Ok(())
    }

    /// Desired child body, computed deterministically from the spec and owner name
    pub fn desired_deployment(&self, owner_name: &str) -> DeploymentSpec {
        let labels = BTreeMap::from([("app".to_string(), owner_name.to_string())]);
        DeploymentSpec {
            replicas: self.replicas,
            selector: LabelSelector {
                match_labels: labels.clone(),
            },
            template: PodTemplateSpec {
                labels,
                containers: vec![ContainerSpec {
                    name: "main".to_string(),
                    image: self.image.clone(),
                }],
            },
        }
    }
}
