//! Handler capability and per-invocation context.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use cadence_core::trigger::Trigger;

use crate::engine::Scheduler;

/// Failure raised by a handler's `handle` call.
///
/// The engine never propagates these to the timer machinery; they are
/// logged and routed to the retriever.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// A unit of executable work bound to one or more triggers.
///
/// Identity is the stable [`name`](Handler::name): a handler may be bound
/// to many triggers, but only once per trigger.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Stable identity within the scheduler. Must not be empty.
    fn name(&self) -> &str;

    /// Execute one firing occurrence.
    async fn handle(&self, ctx: &HandlerContext) -> Result<(), HandlerError>;
}

/// Retry state carried into a handler invocation that is itself a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerFailure {
    /// Number of retry attempts made before this one.
    pub count: u32,
    /// When the previous attempt ran, if any.
    pub timestamp: Option<DateTime<Utc>>,
    /// Deadline after which retrying is abandoned; `None` = unlimited.
    pub expiration: Option<DateTime<Utc>>,
}

type ParameterMap = Arc<Mutex<HashMap<String, serde_json::Value>>>;

/// Per-invocation data handed to a handler.
///
/// Created fresh for every firing occurrence and never reused across
/// firings. Cloning is cheap and clones share the parameter map, since they
/// describe the same logical invocation.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    scheduler: Weak<Scheduler>,
    trigger: Trigger,
    index: usize,
    failure: Option<HandlerFailure>,
    /// Allocated on first use; keys are folded to lowercase.
    parameters: OnceLock<ParameterMap>,
}

impl HandlerContext {
    pub(crate) fn new(scheduler: Weak<Scheduler>, trigger: Trigger, index: usize) -> Self {
        Self {
            scheduler,
            trigger,
            index,
            failure: None,
            parameters: OnceLock::new(),
        }
    }

    /// The scheduler that fired this invocation, if it is still alive.
    pub fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.scheduler.upgrade()
    }

    /// The trigger that fired.
    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    /// Zero-based position of this invocation within the firing batch.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Retry state; `Some` only when this invocation is itself a retry.
    pub fn failure(&self) -> Option<HandlerFailure> {
        self.failure
    }

    pub(crate) fn set_failure(&mut self, failure: HandlerFailure) {
        self.failure = Some(failure);
    }

    pub fn has_parameters(&self) -> bool {
        self.parameters
            .get()
            .is_some_and(|map| !map.lock().unwrap().is_empty())
    }

    /// Attach a parameter. Keys are case-insensitive.
    pub fn set_parameter(&self, key: &str, value: serde_json::Value) {
        let map = self.parameters.get_or_init(ParameterMap::default);
        map.lock().unwrap().insert(key.to_lowercase(), value);
    }

    /// Look up a parameter. Keys are case-insensitive.
    pub fn parameter(&self, key: &str) -> Option<serde_json::Value> {
        self.parameters
            .get()
            .and_then(|map| map.lock().unwrap().get(&key.to_lowercase()).cloned())
    }
}
