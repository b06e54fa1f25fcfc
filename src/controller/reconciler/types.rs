//! # Reconciler Types
//!
//! The `Reconcilable` trait each kind implements, the per-run context, the
//! action a successful run returns, and the error taxonomy the driver's
//! error policy dispatches on.

use crate::controller::cache::ResourceCache;
use crate::controller::client::Client;
use crate::crd::{ObjectKey, Resource};
use crate::store::StoreError;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// What to do after a successful reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Nothing to do until the next change event
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    /// Reconcile again after `duration` even without events (polling external systems)
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Coarse error class used for metrics labels and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Conflict,
    Transient,
    Terminal,
    Panicked,
    NotLeader,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::Transient => "transient",
            Self::Terminal => "terminal",
            Self::Panicked => "panic",
            Self::NotLeader => "not_leader",
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Version token went stale and in-reconcile retries ran out
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient failure: {0}")]
    Transient(String),
    /// Desired state cannot be realized; needs a spec change
    #[error("{reason}: {message}")]
    Terminal { reason: String, message: String },
    #[error("reconcile panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReconcileError {
    pub fn terminal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Terminal {
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Conflict(_) => ErrorClass::Conflict,
            Self::Transient(_) => ErrorClass::Transient,
            Self::Terminal { .. } => ErrorClass::Terminal,
            Self::Panicked(_) => ErrorClass::Panicked,
            Self::Store(StoreError::NotLeader) => ErrorClass::NotLeader,
            Self::Store(e) if e.is_conflict() => ErrorClass::Conflict,
            Self::Store(e) if e.is_transient() => ErrorClass::Transient,
            Self::Store(_) => ErrorClass::Terminal,
        }
    }

    /// Condition reason recorded when this error ends up on status
    pub fn reason(&self) -> &str {
        match self {
            Self::Terminal { reason, .. } => reason,
            Self::Conflict(_) => "Conflict",
            Self::Transient(_) => "TransientError",
            Self::Panicked(_) => "Panicked",
            Self::Store(StoreError::Invalid(_)) => "Invalid",
            Self::Store(StoreError::Forbidden(_)) => "Forbidden",
            Self::Store(_) => "StoreError",
        }
    }

    /// Human-readable detail recorded when this error ends up on status
    pub fn message(&self) -> String {
        match self {
            Self::Terminal { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Everything a reconcile run may use
#[derive(Debug, Clone)]
pub struct Context {
    /// Fenced store handle; use it for every read that feeds a write
    pub client: Client,
    /// Possibly stale mirror of the reconciled kind
    pub cache: ResourceCache,
    pub key: ObjectKey,
    /// 1 on the first try, incremented by each failed attempt since the last success
    pub attempt: u32,
}

/// One implementation per reconciled kind
#[async_trait]
pub trait Reconcilable: Send + Sync + 'static {
    /// The kind whose objects are queued and reconciled
    fn kind(&self) -> &str;

    /// Child kinds whose events are mapped back to their controller owner
    fn owned_kinds(&self) -> Vec<String> {
        Vec::new()
    }

    /// Drive the children of `resource` toward its spec
    async fn reconcile(&self, resource: Arc<Resource>, ctx: &Context) -> Result<Action, ReconcileError>;

    /// Called when the key is no longer in the cache. Owner references already
    /// make the garbage collector remove children, so the default does nothing.
    async fn cleanup(&self, _key: &ObjectKey, _ctx: &Context) -> Result<Action, ReconcileError> {
        Ok(Action::await_change())
    }
}

/// Reconcilers selected by kind at startup
#[derive(Default, Clone)]
pub struct ReconcilerRegistry {
    reconcilers: BTreeMap<String, Arc<dyn Reconcilable>>,
}

impl std::fmt::Debug for ReconcilerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcilerRegistry")
            .field("kinds", &self.reconcilers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ReconcilerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, reconciler: Arc<dyn Reconcilable>) -> Result<()> {
        let kind = reconciler.kind().to_string();
        if kind.is_empty() {
            bail!("Reconciler kind must not be empty");
        }
        if self.reconcilers.contains_key(&kind) {
            bail!("A reconciler for kind {kind} is already registered");
        }
        self.reconcilers.insert(kind, reconciler);
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Reconcilable>> {
        self.reconcilers.get(kind).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.reconcilers.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Reconcilable>> {
        self.reconcilers.values()
    }

    pub fn len(&self) -> usize {
        self.reconcilers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reconcilers.is_empty()
    }
}
