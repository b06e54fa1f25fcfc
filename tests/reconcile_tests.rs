//! # Reconciliation Integration Tests
//!
//! End-to-end behaviour of the `AppService` engine against the in-memory store:
//! - Creating, scaling and drift correction of the owned `Deployment`
//! - Idempotence: re-reconciling a converged object writes nothing
//! - Self-healing after the child is deleted
//! - Adoption of an unowned child and refusal of a foreign one
//! - Children are left to garbage collection once the owner is gone

mod common;

use common::*;
use operator_engine::controller::appservice::AppServiceReconciler;
use operator_engine::crd::{Resource, APP_SERVICE_KIND, DEPLOYMENT_KIND};
use operator_engine::store::{InMemoryLease, InMemoryStore, Store};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_example_scenario_create_scale_and_correct_drift() {
    let store = Arc::new(InMemoryStore::default());
    let engine = start_app_engine(&store, "replica-a");
    engine.wait_synced().await;

    store.seed([app_service("web", 2, "nginx:1.27")]).unwrap();
    eventually("Deployment created with 2 replicas", || async {
        deployment_replicas(&store, "web").await == Some(2)
    })
    .await;
    eventually("AppService reported ready", || async {
        ready_condition(&store, APP_SERVICE_KIND, "web").await
            == Some(("True".to_string(), "Reconciled".to_string()))
    })
    .await;

    // Spec change: the child is updated in place, never recreated
    let child_uid = store
        .get(DEPLOYMENT_KIND, &key("web"))
        .await
        .unwrap()
        .metadata
        .uid;
    mutate(&store, APP_SERVICE_KIND, "web", |app| {
        app.spec["replicas"] = json!(4);
    })
    .await;
    eventually("Deployment scaled to 4", || async {
        deployment_replicas(&store, "web").await == Some(4)
    })
    .await;
    let child = store.get(DEPLOYMENT_KIND, &key("web")).await.unwrap();
    assert_eq!(child.metadata.uid, child_uid);
    assert_eq!(store.write_stats().creates, 1, "only the initial child create");

    // External drift on an engine-owned field is corrected back
    mutate(&store, DEPLOYMENT_KIND, "web", |deployment| {
        deployment.spec["replicas"] = json!(1);
    })
    .await;
    eventually("drift corrected back to 4", || async {
        deployment_replicas(&store, "web").await == Some(4)
    })
    .await;

    let app = store.get(APP_SERVICE_KIND, &key("web")).await.unwrap();
    assert_eq!(app.status.unwrap().observed_generation, Some(2));

    engine.stop().await;
}

#[tokio::test]
async fn test_user_owned_fields_survive_reconcile() {
    let store = Arc::new(InMemoryStore::default());
    let engine = start_app_engine(&store, "replica-a");
    engine.wait_synced().await;

    store.seed([app_service("web", 2, "nginx:1.27")]).unwrap();
    eventually("Deployment created", || async {
        deployment_replicas(&store, "web").await == Some(2)
    })
    .await;

    // A field outside the engine-owned set plus drift on an owned one
    mutate(&store, DEPLOYMENT_KIND, "web", |deployment| {
        deployment.spec["paused"] = json!(true);
        deployment.spec["replicas"] = json!(7);
    })
    .await;
    eventually("owned drift corrected", || async {
        deployment_replicas(&store, "web").await == Some(2)
    })
    .await;

    let child = store.get(DEPLOYMENT_KIND, &key("web")).await.unwrap();
    assert_eq!(child.spec["paused"], json!(true));

    engine.stop().await;
}

#[tokio::test]
async fn test_converged_objects_are_not_rewritten() {
    let store = Arc::new(InMemoryStore::default());
    store
        .seed([
            app_service("web", 2, "nginx:1.27"),
            app_service("api", 1, "api:v3"),
            app_service("worker", 3, "worker:v1"),
        ])
        .unwrap();

    let first = start_app_engine(&store, "replica-a");
    eventually("all three ready", || async {
        let mut ready = 0;
        for name in ["web", "api", "worker"] {
            if ready_condition(&store, APP_SERVICE_KIND, name).await
                == Some(("True".to_string(), "Reconciled".to_string()))
            {
                ready += 1;
            }
        }
        ready == 3
    })
    .await;
    first.wait_quiet().await;
    first.stop().await;

    // A fresh engine reconciles everything again from its initial list
    let before = store.write_stats();
    let counting = Counting::new(AppServiceReconciler::new());
    let second = RunningEngine::start(
        &store,
        &Arc::new(InMemoryLease::new()),
        registry_with(counting.clone()),
        fast_config("replica-b"),
        APP_SERVICE_KIND,
    );
    second.wait_synced().await;
    eventually("every object reconciled again", || async { counting.count() >= 3 }).await;
    second.wait_quiet().await;

    assert_eq!(store.write_stats(), before, "a converged reconcile must not write");
    second.stop().await;
}

#[tokio::test]
async fn test_deleted_child_is_recreated() {
    let store = Arc::new(InMemoryStore::default());
    let engine = start_app_engine(&store, "replica-a");
    engine.wait_synced().await;

    store.seed([app_service("web", 2, "nginx:1.27")]).unwrap();
    eventually("Deployment created", || async {
        deployment_replicas(&store, "web").await == Some(2)
    })
    .await;
    let original = store.get(DEPLOYMENT_KIND, &key("web")).await.unwrap();

    store.delete(DEPLOYMENT_KIND, &key("web")).await.unwrap();
    eventually("Deployment recreated", || async {
        store
            .get(DEPLOYMENT_KIND, &key("web"))
            .await
            .is_ok_and(|d| d.metadata.uid != original.metadata.uid)
    })
    .await;

    let recreated = store.get(DEPLOYMENT_KIND, &key("web")).await.unwrap();
    let app = store.get(APP_SERVICE_KIND, &key("web")).await.unwrap();
    assert!(recreated.is_controlled_by(&app));
    assert_eq!(recreated.spec["replicas"], json!(2));

    engine.stop().await;
}

#[tokio::test]
async fn test_unowned_child_is_adopted() {
    let store = Arc::new(InMemoryStore::default());
    store
        .seed([Resource::new(
            DEPLOYMENT_KIND,
            NAMESPACE,
            "web",
            json!({ "replicas": 9, "sidecar": "keep-me" }),
        )])
        .unwrap();
    let orphan_uid = store
        .get(DEPLOYMENT_KIND, &key("web"))
        .await
        .unwrap()
        .metadata
        .uid;

    let engine = start_app_engine(&store, "replica-a");
    store.seed([app_service("web", 2, "nginx:1.27")]).unwrap();

    eventually("orphan adopted and corrected", || async {
        let (Ok(app), Ok(child)) = (
            store.get(APP_SERVICE_KIND, &key("web")).await,
            store.get(DEPLOYMENT_KIND, &key("web")).await,
        ) else {
            return false;
        };
        child.is_controlled_by(&app) && child.spec["replicas"] == json!(2)
    })
    .await;

    let child = store.get(DEPLOYMENT_KIND, &key("web")).await.unwrap();
    assert_eq!(child.metadata.uid, orphan_uid, "adopted, not replaced");
    assert_eq!(child.spec["sidecar"], json!("keep-me"));

    engine.stop().await;
}

#[tokio::test]
async fn test_child_of_another_controller_is_terminal() {
    let store = Arc::new(InMemoryStore::default());
    let mut foreign = Resource::new(DEPLOYMENT_KIND, NAMESPACE, "web", json!({ "replicas": 5 }));
    foreign.metadata.owner_references.push(
        Resource::new("ReplicaManager", NAMESPACE, "other", json!({})).controller_reference(),
    );
    foreign.metadata.owner_references[0].uid = "some-other-uid".to_string();
    store.seed([foreign]).unwrap();

    let engine = start_app_engine(&store, "replica-a");
    store.seed([app_service("web", 2, "nginx:1.27")]).unwrap();

    eventually("ownership conflict surfaced on status", || async {
        ready_condition(&store, APP_SERVICE_KIND, "web").await
            == Some(("False".to_string(), "OwnershipConflict".to_string()))
    })
    .await;
    assert_eq!(deployment_replicas(&store, "web").await, Some(5), "foreign child untouched");

    engine.stop().await;
}

#[tokio::test]
async fn test_owner_deletion_leaves_children_to_garbage_collection() {
    let store = Arc::new(InMemoryStore::default());
    let engine = start_app_engine(&store, "replica-a");
    engine.wait_synced().await;

    store.seed([app_service("web", 2, "nginx:1.27")]).unwrap();
    eventually("Deployment created", || async {
        deployment_replicas(&store, "web").await == Some(2)
    })
    .await;

    store.delete(APP_SERVICE_KIND, &key("web")).await.unwrap();
    let cache = engine.primary_cache.clone().unwrap();
    eventually("owner dropped from cache", || async { cache.get(&key("web")).is_none() }).await;
    engine.wait_quiet().await;
    assert_eq!(store.collect_garbage(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.get(DEPLOYMENT_KIND, &key("web")).await.is_err());

    engine.stop().await;
}
