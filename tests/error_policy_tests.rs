//! # Error Policy Integration Tests
//!
//! How the driver treats each reconcile outcome:
//! - Transient failures retry with backoff and stop after the retry budget
//! - Exhausted retries and terminal errors are surfaced on status
//! - Panics are contained to the key that caused them
//! - Writes fenced off by lost leadership are deferred without counting an attempt
//! - A reconcile that overruns its timeout counts as a transient failure

mod common;

use async_trait::async_trait;
use common::*;
use operator_engine::controller::appservice::AppServiceReconciler;
use operator_engine::controller::reconciler::{Action, Context, Reconcilable, ReconcileError};
use operator_engine::crd::{Resource, APP_SERVICE_KIND};
use operator_engine::store::{InMemoryLease, InMemoryStore, Store, StoreError};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WIDGET: &str = "Widget";

type Script = dyn Fn(&str, usize) -> Result<Action, ReconcileError> + Send + Sync;

/// Reconciler whose result per call is decided by a closure over
/// `(object name, how many times that object was reconciled before)`
struct Scripted {
    script: Box<Script>,
    delay: Option<Duration>,
    /// `(name, ctx.attempt)` of every call
    calls: Mutex<Vec<(String, u32)>>,
}

impl Scripted {
    fn new(
        script: impl Fn(&str, usize) -> Result<Action, ReconcileError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            delay: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(|_, _| Ok(Action::await_change())),
            delay: Some(delay),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls_for(&self, name: &str) -> Vec<u32> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, attempt)| *attempt)
            .collect()
    }
}

#[async_trait]
impl Reconcilable for Scripted {
    fn kind(&self) -> &str {
        WIDGET
    }

    async fn reconcile(&self, widget: Arc<Resource>, ctx: &Context) -> Result<Action, ReconcileError> {
        let previous = {
            let mut calls = self.calls.lock().unwrap();
            let previous = calls.iter().filter(|(n, _)| n == widget.name()).count();
            calls.push((widget.name().to_string(), ctx.attempt));
            previous
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.script)(widget.name(), previous)
    }
}

fn widget(name: &str) -> Resource {
    Resource::new(WIDGET, NAMESPACE, name, json!({ "size": 1 }))
}

fn start_widget_engine(
    store: &Arc<InMemoryStore>,
    reconciler: &Arc<Scripted>,
    config: operator_engine::config::ControllerConfig,
) -> RunningEngine {
    RunningEngine::start(
        store,
        &Arc::new(InMemoryLease::new()),
        registry_with(reconciler.clone()),
        config,
        WIDGET,
    )
}

#[tokio::test]
async fn test_transient_failures_retry_until_success() {
    let store = Arc::new(InMemoryStore::default());
    let reconciler = Scripted::new(|_, previous| {
        if previous < 2 {
            Err(ReconcileError::transient("backend warming up"))
        } else {
            Ok(Action::await_change())
        }
    });
    let engine = start_widget_engine(&store, &reconciler, fast_config("replica-a"));

    store.seed([widget("w1")]).unwrap();
    eventually("third attempt succeeded", || async {
        reconciler.calls_for("w1").len() == 3
    })
    .await;
    engine.wait_quiet().await;

    assert_eq!(reconciler.calls_for("w1"), vec![1, 2, 3]);
    assert!(ready_condition(&store, WIDGET, "w1").await.is_none(), "success writes no failure");

    engine.stop().await;
}

#[tokio::test]
async fn test_retries_exhausted_is_surfaced_on_status() {
    let store = Arc::new(InMemoryStore::default());
    let reconciler = Scripted::new(|_, _| Err(ReconcileError::transient("dependency down")));
    let config = fast_config("replica-a");
    let max_retries = config.max_retries;
    let engine = start_widget_engine(&store, &reconciler, config);

    store.seed([widget("w1")]).unwrap();
    eventually("retries exhausted on status", || async {
        ready_condition(&store, WIDGET, "w1").await
            == Some(("False".to_string(), "RetriesExhausted".to_string()))
    })
    .await;
    engine.wait_quiet().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // One initial run plus `max_retries` retries, then nothing more
    let expected: Vec<u32> = (1..=max_retries + 1).collect();
    assert_eq!(reconciler.calls_for("w1"), expected);

    let message = store
        .get(WIDGET, &key("w1"))
        .await
        .map(|w| w.status.unwrap().condition("Ready").unwrap().message.clone())
        .unwrap()
        .unwrap();
    assert!(message.contains("dependency down"), "message was {message:?}");

    engine.stop().await;
}

#[tokio::test]
async fn test_spec_change_restarts_retry_budget() {
    let store = Arc::new(InMemoryStore::default());
    let reconciler = Scripted::new(|_, _| Err(ReconcileError::transient("dependency down")));
    let engine = start_widget_engine(&store, &reconciler, fast_config("replica-a"));

    store.seed([widget("w1")]).unwrap();
    eventually("retries exhausted", || async {
        ready_condition(&store, WIDGET, "w1").await
            == Some(("False".to_string(), "RetriesExhausted".to_string()))
    })
    .await;
    engine.wait_quiet().await;
    let exhausted = reconciler.calls_for("w1").len();

    mutate(&store, WIDGET, "w1", |w| w.spec["size"] = json!(2)).await;
    eventually("new round of attempts", || async {
        reconciler.calls_for("w1").len() > exhausted
    })
    .await;
    assert_eq!(reconciler.calls_for("w1")[exhausted], 1, "attempts counted afresh");

    engine.stop().await;
}

#[tokio::test]
async fn test_terminal_error_is_not_retried() {
    let store = Arc::new(InMemoryStore::default());
    let counting = Counting::new(AppServiceReconciler::new());
    let engine = RunningEngine::start(
        &store,
        &Arc::new(InMemoryLease::new()),
        registry_with(counting.clone()),
        fast_config("replica-a"),
        APP_SERVICE_KIND,
    );

    store.seed([app_service("broken", -1, "nginx")]).unwrap();
    eventually("invalid spec on status", || async {
        ready_condition(&store, APP_SERVICE_KIND, "broken").await
            == Some(("False".to_string(), "InvalidSpec".to_string()))
    })
    .await;
    engine.wait_quiet().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(counting.count(), 1);
    assert_eq!(deployment_replicas(&store, "broken").await, None);

    // Fixing the spec recovers
    mutate(&store, APP_SERVICE_KIND, "broken", |app| app.spec["replicas"] = json!(1)).await;
    eventually("fixed spec reconciled", || async {
        ready_condition(&store, APP_SERVICE_KIND, "broken").await
            == Some(("True".to_string(), "Reconciled".to_string()))
    })
    .await;

    engine.stop().await;
}

#[tokio::test]
async fn test_panic_is_contained_to_its_key() {
    let store = Arc::new(InMemoryStore::default());
    let reconciler = Scripted::new(|name, _| {
        if name == "bad" {
            panic!("reconcile bug for {name}");
        }
        Ok(Action::await_change())
    });
    let config = fast_config("replica-a");
    let max_retries = config.max_retries as usize;
    let engine = start_widget_engine(&store, &reconciler, config);

    store.seed([widget("bad"), widget("good")]).unwrap();
    eventually("panicking key gave up", || async {
        ready_condition(&store, WIDGET, "bad").await
            == Some(("False".to_string(), "RetriesExhausted".to_string()))
    })
    .await;
    assert_eq!(reconciler.calls_for("good").len(), 1);
    assert_eq!(reconciler.calls_for("bad").len(), max_retries + 1);

    // Workers are still alive
    store.seed([widget("later")]).unwrap();
    eventually("later key reconciled", || async {
        reconciler.calls_for("later").len() == 1
    })
    .await;
    assert!(!engine.handle.is_finished());

    engine.stop().await;
}

#[tokio::test]
async fn test_not_leader_write_is_deferred_without_counting() {
    let store = Arc::new(InMemoryStore::default());
    let reconciler = Scripted::new(|_, previous| {
        if previous == 0 {
            Err(ReconcileError::Store(StoreError::NotLeader))
        } else {
            Ok(Action::await_change())
        }
    });
    let engine = start_widget_engine(&store, &reconciler, fast_config("replica-a"));

    store.seed([widget("w1")]).unwrap();
    eventually("deferred key ran again", || async {
        reconciler.calls_for("w1").len() == 2
    })
    .await;
    engine.wait_quiet().await;

    assert_eq!(reconciler.calls_for("w1"), vec![1, 1]);
    assert!(ready_condition(&store, WIDGET, "w1").await.is_none(), "deferral writes no status");

    engine.stop().await;
}

#[tokio::test]
async fn test_requeue_action_schedules_recheck() {
    let store = Arc::new(InMemoryStore::default());
    let reconciler = Scripted::new(|_, _| Ok(Action::requeue(Duration::from_millis(50))));
    let engine = start_widget_engine(&store, &reconciler, fast_config("replica-a"));

    store.seed([widget("w1")]).unwrap();
    eventually("periodic rechecks", || async {
        reconciler.calls_for("w1").len() >= 3
    })
    .await;
    // Successful rechecks never accumulate failures
    assert!(reconciler.calls_for("w1").iter().all(|attempt| *attempt == 1));

    engine.stop().await;
}

#[tokio::test]
async fn test_reconcile_timeout_counts_as_failure() {
    let store = Arc::new(InMemoryStore::default());
    let reconciler = Scripted::slow(Duration::from_secs(30));
    let config = operator_engine::config::ControllerConfig {
        reconcile_timeout_secs: 1,
        max_retries: 0,
        ..fast_config("replica-a")
    };
    let engine = start_widget_engine(&store, &reconciler, config);

    store.seed([widget("w1")]).unwrap();
    eventually("timeout surfaced", || async {
        ready_condition(&store, WIDGET, "w1").await
            == Some(("False".to_string(), "RetriesExhausted".to_string()))
    })
    .await;
    assert_eq!(reconciler.calls_for("w1"), vec![1]);

    engine.stop().await;
}
