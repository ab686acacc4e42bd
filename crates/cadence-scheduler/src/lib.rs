//! `cadence-scheduler` — trigger-driven scan/fire scheduling engine.
//!
//! # Overview
//!
//! Callers bind [`Handler`]s to [`Trigger`](cadence_core::trigger::Trigger)s
//! in a concurrent registry. The [`engine::Scheduler`] scans the registry
//! for the earliest next occurrence, arms a single lazy one-shot wake-up
//! for it (no per-trigger polling threads), and on wake re-arms the next
//! round before invoking the due batch. Failed handler invocations route to
//! the [`retriever::Retriever`], which re-attempts them with backoff until
//! success or expiration.
//!
//! # Concurrency model
//!
//! | Concern                  | Mechanism                                      |
//! |--------------------------|------------------------------------------------|
//! | registry                 | `DashMap` + one mutex per entry's handler set  |
//! | armed wake-up            | single mutex around (timestamp, epoch)         |
//! | stale wake-up detection  | epoch compare in the sleeper task              |
//! | retry queue              | mutex-guarded FIFO, one polling task           |
//! | notifications            | `tokio::sync::broadcast` fan-out               |

pub mod engine;
pub mod error;
pub mod events;
pub mod handler;
mod registry;
pub mod retriever;
pub mod worker;

pub use engine::Scheduler;
pub use error::{Result, SchedulerError};
pub use events::{RetryEvent, SchedulerEvent};
pub use handler::{Handler, HandlerContext, HandlerError, HandlerFailure};
pub use retriever::Retriever;
pub use worker::WorkerState;
