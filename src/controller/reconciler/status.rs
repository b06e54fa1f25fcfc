//! # Status Writer
//!
//! Status-only updates with the two properties reconciles rely on:
//! - unchanged status is never written (keeps steady state free of writes)
//! - a stale version token re-fetches and re-applies instead of overwriting

use crate::constants::CONFLICT_RETRY_LIMIT;
use crate::controller::client::Client;
use crate::crd::{Condition, Resource, ResourceStatus};
use crate::store::StoreError;
use tracing::debug;

/// Apply `mutate` to the status of `resource` and write it back if it changed.
///
/// `last_reconcile_time` is stamped only when the mutation changed something.
/// Returns the stored object (unchanged input when the write was skipped).
pub async fn update_status<F>(
    client: &Client,
    resource: &Resource,
    mutate: F,
) -> Result<Resource, StoreError>
where
    F: Fn(&mut ResourceStatus),
{
    let mut current = resource.clone();
    let mut attempts = 0;

    loop {
        let before = current.status.clone().unwrap_or_default();
        let mut status = before.clone();
        mutate(&mut status);

        // CRITICAL: skip the write when nothing changed, every write is a watch event
        if status == before {
            debug!(
                kind = %current.kind,
                key = %current.key(),
                "Skipping status update - status unchanged"
            );
            return Ok(current);
        }

        status.last_reconcile_time = Some(chrono::Utc::now().to_rfc3339());
        let mut next = current.clone();
        next.status = Some(status);

        match client.update_status(next).await {
            Ok(updated) => return Ok(updated),
            Err(e) if e.is_conflict() && attempts < CONFLICT_RETRY_LIMIT => {
                attempts += 1;
                debug!(
                    kind = %current.kind,
                    key = %current.key(),
                    attempt = attempts,
                    "Status update conflicted, re-fetching"
                );
                current = client.get(&current.kind, &current.key()).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Record a failed reconcile as `Ready=False` without touching `observedGeneration`
pub async fn report_failure(
    client: &Client,
    resource: &Resource,
    reason: &str,
    message: &str,
) -> Result<Resource, StoreError> {
    update_status(client, resource, |status| {
        status.set_condition(Condition::not_ready(reason, message));
    })
    .await
}
