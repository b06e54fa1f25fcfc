//! # Owned Children
//!
//! Create-or-update of a child object owned by the resource being reconciled.
//!
//! ## Flow
//!
//! 1. Read the child from the store (never the cache, a write follows)
//! 2. Absent: create it with a controller owner reference. `AlreadyExists`
//!    means an earlier unacknowledged create went through, so re-read and go on
//! 3. Present: compare only the engine-owned fields (JSON pointers). Other
//!    fields belong to users and are never touched
//! 4. Drift: update carrying the version token that was read. A conflict
//!    re-reads and re-diffs; it never overwrites blindly
//! 5. No drift: no write

use super::types::ReconcileError;
use crate::constants::{CONFLICT_RETRY_LIMIT, FIELD_MANAGER};
use crate::controller::client::Client;
use crate::crd::Resource;
use crate::observability::metrics;
use serde_json::Value;
use tracing::{debug, info};

/// What [`apply_owned_child`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildOutcome {
    Created,
    /// Owned fields (JSON pointers) that were corrected
    Updated { fields: Vec<String> },
    Unchanged,
}

impl ChildOutcome {
    pub fn wrote(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Bring the child described by `desired` in line with it.
///
/// `desired.metadata` supplies the child's name, namespace and labels. Owner
/// references are set here. `owned_fields` are JSON pointers into `spec`.
pub async fn apply_owned_child(
    client: &Client,
    owner: &Resource,
    desired: &Resource,
    owned_fields: &[&str],
) -> Result<ChildOutcome, ReconcileError> {
    let kind = desired.kind.as_str();
    let key = desired.key();
    let owner_ref = owner.controller_reference();
    let mut retries = 0;

    loop {
        let Some(current) = client.get_opt(kind, &key).await? else {
            let mut child = desired.clone();
            child.metadata.owner_references = vec![owner_ref.clone()];
            match client.create(child).await {
                Ok(_) => {
                    metrics::increment_child_writes(kind, "create");
                    info!(
                        kind,
                        key = %key,
                        owner = %owner.key(),
                        manager = FIELD_MANAGER,
                        "Created child"
                    );
                    return Ok(ChildOutcome::Created);
                }
                Err(e) if e.is_already_exists() && retries < CONFLICT_RETRY_LIMIT => {
                    retries += 1;
                    debug!(kind, key = %key, "Child already exists, re-reading");
                    continue;
                }
                Err(e) if e.is_already_exists() => {
                    return Err(ReconcileError::Conflict(format!(
                        "{kind} {key} exists but could not be read back after {retries} attempts"
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        };

        let adopt = match current.metadata.controller_owner() {
            Some(existing) if existing.kind == owner_ref.kind && existing.uid == owner_ref.uid => false,
            Some(existing) => {
                return Err(ReconcileError::terminal(
                    "OwnershipConflict",
                    format!(
                        "{kind} {key} is controlled by {} {} (uid {})",
                        existing.kind, existing.name, existing.uid
                    ),
                ));
            }
            None => true,
        };

        let mut fields = drifted_fields(&current.spec, &desired.spec, owned_fields);
        let labels_drifted = desired
            .metadata
            .labels
            .iter()
            .any(|(k, v)| current.metadata.labels.get(k) != Some(v));
        if labels_drifted {
            fields.push("metadata.labels".to_string());
        }

        if fields.is_empty() && !adopt {
            debug!(kind, key = %key, "Child up to date");
            return Ok(ChildOutcome::Unchanged);
        }

        let mut next = current.clone();
        for pointer in owned_fields {
            if fields.iter().any(|f| f.as_str() == *pointer) {
                apply_pointer(&mut next.spec, &desired.spec, pointer);
            }
        }
        for (k, v) in &desired.metadata.labels {
            next.metadata.labels.insert(k.clone(), v.clone());
        }
        if adopt {
            next.metadata.owner_references.push(owner_ref.clone());
            fields.push("metadata.ownerReferences".to_string());
        }

        match client.update(next).await {
            Ok(_) => {
                metrics::increment_child_writes(kind, "update");
                info!(
                    kind,
                    key = %key,
                    owner = %owner.key(),
                    fields = ?fields,
                    manager = FIELD_MANAGER,
                    "Updated child"
                );
                return Ok(ChildOutcome::Updated { fields });
            }
            Err(e) if (e.is_conflict() || e.is_not_found()) && retries < CONFLICT_RETRY_LIMIT => {
                retries += 1;
                debug!(kind, key = %key, error = %e, attempt = retries, "Child changed underneath, re-reading");
            }
            Err(e) if e.is_conflict() => {
                return Err(ReconcileError::Conflict(format!(
                    "{kind} {key} kept changing during update: {e}"
                )));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Owned fields whose value in `current` differs from `desired`
pub fn drifted_fields(current: &Value, desired: &Value, owned_fields: &[&str]) -> Vec<String> {
    owned_fields
        .iter()
        .filter(|pointer| current.pointer(pointer) != desired.pointer(pointer))
        .map(|pointer| (*pointer).to_string())
        .collect()
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// Make `target` agree with `desired` at `pointer`, creating or removing the
/// slot as needed. When an intermediate container is missing it is copied
/// from `desired` as a whole.
fn apply_pointer(target: &mut Value, desired: &Value, pointer: &str) {
    let wanted = desired.pointer(pointer).cloned();
    let Some((parent, last)) = pointer.rsplit_once('/') else {
        *target = desired.clone();
        return;
    };
    let last = unescape(last);

    if let Some(wanted) = wanted {
        if let Some(slot) = target.pointer_mut(pointer) {
            *slot = wanted;
            return;
        }
        let placed = match target.pointer_mut(parent) {
            Some(Value::Object(map)) => {
                map.insert(last, wanted);
                true
            }
            Some(Value::Array(items)) if last.parse::<usize>().ok() == Some(items.len()) => {
                items.push(wanted);
                true
            }
            _ => false,
        };
        if !placed {
            apply_pointer(target, desired, parent);
        }
    } else {
        match target.pointer_mut(parent) {
            Some(Value::Object(map)) => {
                map.remove(&last);
            }
            Some(Value::Array(items)) => {
                if let Some(index) = last.parse::<usize>().ok().filter(|i| *i < items.len()) {
                    items.remove(index);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::leader::LeaderStatus;
    use crate::crd::ObjectKey;
    use crate::store::{InMemoryStore, Store, StoreError};
    use serde_json::json;
    use std::sync::Arc;

    const OWNED: &[&str] = &["/replicas", "/template/containers/0/image", "/selector"];

    fn desired(replicas: i32) -> Resource {
        let mut child = Resource::new(
            "Deployment",
            "default",
            "web",
            json!({
                "replicas": replicas,
                "selector": {"matchLabels": {"app": "web"}},
                "template": {
                    "labels": {"app": "web"},
                    "containers": [{"name": "main", "image": "nginx:1.27"}]
                }
            }),
        );
        child.metadata.labels.insert("app".to_string(), "web".to_string());
        child
    }

    async fn setup() -> (Arc<InMemoryStore>, Client, Resource) {
        let store = Arc::new(InMemoryStore::default());
        let client = Client::new(
            Arc::clone(&store) as Arc<dyn Store>,
            LeaderStatus::always_leader(),
        );
        let owner = store
            .create(Resource::new("AppService", "default", "web", json!({"replicas": 2})))
            .await
            .unwrap();
        (store, client, owner)
    }

    fn child_key() -> ObjectKey {
        ObjectKey::new("default", "web")
    }

    #[tokio::test]
    async fn test_creates_then_noops() {
        let (store, client, owner) = setup().await;
        let outcome = apply_owned_child(&client, &owner, &desired(2), OWNED).await.unwrap();
        assert_eq!(outcome, ChildOutcome::Created);

        let child = store.get("Deployment", &child_key()).await.unwrap();
        assert!(child.is_controlled_by(&owner));
        assert_eq!(child.spec["replicas"], json!(2));

        let writes = store.write_stats().total();
        let outcome = apply_owned_child(&client, &owner, &desired(2), OWNED).await.unwrap();
        assert_eq!(outcome, ChildOutcome::Unchanged);
        assert_eq!(store.write_stats().total(), writes);
    }

    #[tokio::test]
    async fn test_updates_only_drifted_owned_fields() {
        let (store, client, owner) = setup().await;
        apply_owned_child(&client, &owner, &desired(2), OWNED).await.unwrap();

        // A user adds a sidecar and an annotation-like field the engine does not own
        let mut child = store.get("Deployment", &child_key()).await.unwrap();
        child.spec["paused"] = json!(true);
        child.spec["template"]["containers"]
            .as_array_mut()
            .unwrap()
            .push(json!({"name": "sidecar", "image": "envoy"}));
        store.update(child).await.unwrap();

        let outcome = apply_owned_child(&client, &owner, &desired(4), OWNED).await.unwrap();
        assert_eq!(
            outcome,
            ChildOutcome::Updated {
                fields: vec!["/replicas".to_string()]
            }
        );

        let child = store.get("Deployment", &child_key()).await.unwrap();
        assert_eq!(child.spec["replicas"], json!(4));
        assert_eq!(child.spec["paused"], json!(true));
        assert_eq!(child.spec["template"]["containers"][1]["name"], json!("sidecar"));
    }

    #[tokio::test]
    async fn test_already_exists_on_create_is_success() {
        let (store, client, owner) = setup().await;
        let mut existing = desired(2);
        existing.metadata.owner_references.push(owner.controller_reference());
        store.create(existing).await.unwrap();

        // The read misses it once, as after an unacknowledged create
        store.fail_next(
            1,
            StoreError::NotFound {
                kind: "Deployment".to_string(),
                key: child_key(),
            },
        );
        let outcome = apply_owned_child(&client, &owner, &desired(2), OWNED).await.unwrap();
        assert_eq!(outcome, ChildOutcome::Unchanged);
    }

    /// Lets another writer bump the child right before the engine's first update
    struct RacingWriter {
        inner: Arc<InMemoryStore>,
        raced: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl Store for RacingWriter {
        async fn get(&self, kind: &str, key: &ObjectKey) -> Result<Resource, StoreError> {
            self.inner.get(kind, key).await
        }
        async fn list(&self, kind: &str) -> Result<crate::store::ObjectList, StoreError> {
            self.inner.list(kind).await
        }
        async fn watch(&self, kind: &str, since: u64) -> Result<crate::store::WatchStream, StoreError> {
            self.inner.watch(kind, since).await
        }
        async fn create(&self, obj: Resource) -> Result<Resource, StoreError> {
            self.inner.create(obj).await
        }
        async fn update(&self, obj: Resource) -> Result<Resource, StoreError> {
            if !self.raced.swap(true, std::sync::atomic::Ordering::SeqCst) {
                let mut theirs = self.inner.get(&obj.kind, &obj.key()).await?;
                theirs.spec["paused"] = json!(true);
                self.inner.update(theirs).await?;
            }
            self.inner.update(obj).await
        }
        async fn update_status(&self, obj: Resource) -> Result<Resource, StoreError> {
            self.inner.update_status(obj).await
        }
        async fn delete(&self, kind: &str, key: &ObjectKey) -> Result<(), StoreError> {
            self.inner.delete(kind, key).await
        }
    }

    #[tokio::test]
    async fn test_conflict_rereads_and_keeps_concurrent_change() {
        let (store, client, owner) = setup().await;
        apply_owned_child(&client, &owner, &desired(2), OWNED).await.unwrap();

        let racing = Client::new(
            Arc::new(RacingWriter {
                inner: Arc::clone(&store),
                raced: std::sync::atomic::AtomicBool::new(false),
            }),
            LeaderStatus::always_leader(),
        );
        let outcome = apply_owned_child(&racing, &owner, &desired(3), OWNED).await.unwrap();
        assert_eq!(
            outcome,
            ChildOutcome::Updated {
                fields: vec!["/replicas".to_string()]
            }
        );

        let child = store.get("Deployment", &child_key()).await.unwrap();
        assert_eq!(child.spec["replicas"], json!(3));
        assert_eq!(child.spec["paused"], json!(true));
    }

    /// Store whose reads of one kind never see the object
    struct StaleReads {
        inner: Arc<InMemoryStore>,
        hidden_kind: &'static str,
    }

    #[async_trait::async_trait]
    impl Store for StaleReads {
        async fn get(&self, kind: &str, key: &ObjectKey) -> Result<Resource, StoreError> {
            if kind == self.hidden_kind {
                return Err(StoreError::NotFound {
                    kind: kind.to_string(),
                    key: key.clone(),
                });
            }
            self.inner.get(kind, key).await
        }
        async fn list(&self, kind: &str) -> Result<crate::store::ObjectList, StoreError> {
            self.inner.list(kind).await
        }
        async fn watch(&self, kind: &str, since: u64) -> Result<crate::store::WatchStream, StoreError> {
            self.inner.watch(kind, since).await
        }
        async fn create(&self, obj: Resource) -> Result<Resource, StoreError> {
            self.inner.create(obj).await
        }
        async fn update(&self, obj: Resource) -> Result<Resource, StoreError> {
            self.inner.update(obj).await
        }
        async fn update_status(&self, obj: Resource) -> Result<Resource, StoreError> {
            self.inner.update_status(obj).await
        }
        async fn delete(&self, kind: &str, key: &ObjectKey) -> Result<(), StoreError> {
            self.inner.delete(kind, key).await
        }
    }

    #[tokio::test]
    async fn test_persistent_already_exists_is_retryable() {
        let (store, _, owner) = setup().await;
        let mut existing = desired(2);
        existing.metadata.owner_references.push(owner.controller_reference());
        store.create(existing).await.unwrap();

        let stale = Client::new(
            Arc::new(StaleReads {
                inner: Arc::clone(&store),
                hidden_kind: "Deployment",
            }),
            LeaderStatus::always_leader(),
        );
        let err = apply_owned_child(&stale, &owner, &desired(2), OWNED)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Conflict(_)), "got {err:?}");
        assert_eq!(err.class(), super::super::types::ErrorClass::Conflict);
        assert_eq!(store.write_stats().creates, 2, "owner and the original child only");
    }

    #[tokio::test]
    async fn test_foreign_controller_is_terminal() {
        let (store, client, owner) = setup().await;
        let mut foreign = desired(2);
        foreign.metadata.owner_references.push(crate::crd::OwnerReference {
            kind: "AppService".to_string(),
            name: "other".to_string(),
            uid: "someone-else".to_string(),
            controller: true,
        });
        store.create(foreign).await.unwrap();

        let err = apply_owned_child(&client, &owner, &desired(2), OWNED)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "OwnershipConflict");
    }

    #[tokio::test]
    async fn test_unowned_child_is_adopted() {
        let (store, client, owner) = setup().await;
        store.create(desired(2)).await.unwrap();

        let outcome = apply_owned_child(&client, &owner, &desired(2), OWNED).await.unwrap();
        assert_eq!(
            outcome,
            ChildOutcome::Updated {
                fields: vec!["metadata.ownerReferences".to_string()]
            }
        );
        let child = store.get("Deployment", &child_key()).await.unwrap();
        assert!(child.is_controlled_by(&owner));
    }

    #[test]
    fn test_apply_pointer_creates_missing_path() {
        let desired = json!({"template": {"containers": [{"name": "main", "image": "nginx"}]}});
        let mut target = json!({"template": {"containers": []}});
        apply_pointer(&mut target, &desired, "/template/containers/0/image");
        assert_eq!(target["template"]["containers"][0]["image"], json!("nginx"));

        let mut target = json!({});
        apply_pointer(&mut target, &desired, "/template/containers/0/image");
        assert_eq!(target, desired);
    }

    #[test]
    fn test_apply_pointer_removes_field_absent_from_desired() {
        let mut target = json!({"replicas": 3, "paused": true});
        apply_pointer(&mut target, &json!({"paused": true}), "/replicas");
        assert_eq!(target, json!({"paused": true}));
    }

    #[test]
    fn test_drifted_fields() {
        let current = json!({"replicas": 1, "selector": {"matchLabels": {"app": "web"}}});
        let desired = json!({"replicas": 4, "selector": {"matchLabels": {"app": "web"}}});
        assert_eq!(
            drifted_fields(&current, &desired, &["/replicas", "/selector"]),
            vec!["/replicas".to_string()]
        );
    }
}
