//! # Manifest Loading
//!
//! Reads multi-document YAML files of resources used to seed a store.

use crate::crd::resource::Resource;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Parse every non-empty YAML document in `content` as a [`Resource`]
pub fn parse_manifests(content: &str) -> Result<Vec<Resource>> {
    let mut resources = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(content).enumerate() {
        let value = serde_yaml::Value::deserialize(document)
            .with_context(|| format!("Failed to parse YAML document #{index}"))?;
        if value.is_null() {
            continue;
        }
        let resource: Resource = serde_yaml::from_value(value)
            .with_context(|| format!("Document #{index} is not a valid resource"))?;
        resources.push(resource);
    }
    Ok(resources)
}

pub fn load_manifests(path: &Path) -> Result<Vec<Resource>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifests from {}", path.display()))?;
    parse_manifests(&content)
}
