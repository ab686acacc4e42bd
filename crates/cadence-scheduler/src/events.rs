//! Notification types broadcast to external observers.
//!
//! Events travel over `tokio::sync::broadcast`, so observers run in their
//! own tasks and a slow or faulty listener can never stall a firing batch.

use cadence_core::trigger::Trigger;

use crate::handler::HandlerContext;
use crate::worker::WorkerState;

/// Notifications emitted by the [`Scheduler`](crate::engine::Scheduler).
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// A wake-up was armed. Fires synchronously at arm time, always before
    /// the `Occurred` of the same batch, so observers learn about the plan
    /// before it executes.
    Scheduled {
        /// Handlers bound across the batch at arm time.
        handler_count: usize,
        /// The triggers tied at the armed timestamp.
        triggers: Vec<Trigger>,
    },

    /// A firing batch completed. Emitted even when every handler failed.
    Occurred { invocation_count: usize },

    /// One handler finished successfully. `context.failure()` is `Some`
    /// when this was a recovered retry rather than a fresh success.
    Handled {
        handler: String,
        context: HandlerContext,
    },

    /// The worker lifecycle advanced.
    StateChanged { from: WorkerState, to: WorkerState },
}

/// Notifications emitted by the [`Retriever`](crate::retriever::Retriever).
#[derive(Debug, Clone)]
pub enum RetryEvent {
    /// A retry attempt ran and failed; the token was requeued.
    Failed {
        handler: String,
        context: HandlerContext,
    },

    /// A retry attempt succeeded. The scheduler forwards this as
    /// [`SchedulerEvent::Handled`] so observers see retries uniformly.
    Succeeded {
        handler: String,
        context: HandlerContext,
    },

    /// A token was dropped because its expiration deadline passed.
    Abandoned {
        handler: String,
        context: HandlerContext,
    },
}
