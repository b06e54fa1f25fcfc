//! # Controller
//!
//! The reconciliation engine's moving parts.
//!
//! - `backoff`: Exponential backoff for retries and watch restarts
//! - `queue`: Deduplicating work queue with per-key mutual exclusion
//! - `cache`: Watch-fed local mirror of one kind
//! - `ingestor`: List/watch loop feeding the cache and the queue
//! - `leader`: Lease-based leader election and self-demotion
//! - `client`: Store handle that refuses writes once leadership is lost
//! - `reconciler`: Reconcile trait, error policy, worker driver, child/status helpers
//! - `appservice`: Reconciler for the `AppService` sample kind
//! - `server`: HTTP server for metrics and health checks

pub mod appservice;
pub mod backoff;
pub mod cache;
pub mod client;
pub mod ingestor;
pub mod leader;
pub mod queue;
pub mod reconciler;
pub mod server;
