//! # Resource Status
//!
//! Status types written back by the engine. Conditions and the observed
//! generation are the only surface external observers should rely on for health.

use serde::{Deserialize, Serialize};

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

/// Status of a reconciled resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Conditions represent the latest available observations
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Generation of the spec the conditions were computed from
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Last time a reconcile changed this status (RFC3339)
    #[serde(default)]
    pub last_reconcile_time: Option<String>,
}

/// Condition represents a condition of a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last time `status` flipped
    #[serde(default)]
    pub last_transition_time: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Condition {
    pub fn new(
        r#type: impl Into<String>,
        status: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            r#type: r#type.into(),
            status: status.into(),
            last_transition_time: None,
            reason: Some(reason.into()),
            message: Some(message.into()),
        }
    }

    pub fn ready(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CONDITION_READY, CONDITION_TRUE, reason, message)
    }

    pub fn not_ready(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CONDITION_READY, CONDITION_FALSE, reason, message)
    }
}

impl ResourceStatus {
    pub fn condition(&self, r#type: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.r#type == r#type)
    }

    /// Insert or replace a condition by type.
    ///
    /// `last_transition_time` is carried over from the existing condition when
    /// `status` is unchanged, so rewriting an identical condition is a no-op.
    /// Returns true if anything changed.
    pub fn set_condition(&mut self, mut condition: Condition) -> bool {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            Some(existing) => {
                if existing.status == condition.status {
                    condition
                        .last_transition_time
                        .clone_from(&existing.last_transition_time);
                } else if condition.last_transition_time.is_none() {
                    condition.last_transition_time = Some(chrono::Utc::now().to_rfc3339());
                }
                if *existing == condition {
                    return false;
                }
                *existing = condition;
                true
            }
            None => {
                if condition.last_transition_time.is_none() {
                    condition.last_transition_time = Some(chrono::Utc::now().to_rfc3339());
                }
                self.conditions.push(condition);
                true
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.condition(CONDITION_READY)
            .is_some_and(|c| c.status == CONDITION_TRUE)
    }
}
