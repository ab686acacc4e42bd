//! Failure retry subsystem.
//!
//! Failed handler invocations are queued here and re-attempted by a single
//! dedicated loop with linear backoff (2s, 4s, ... capped at 60s) until
//! they succeed or their expiration deadline passes. The deadline is
//! derived from the trigger's own next occurrence: a retry must never run
//! past the point where the regular schedule would fire again.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::events::RetryEvent;
use crate::handler::{Handler, HandlerContext, HandlerFailure};

const EVENT_CAPACITY: usize = 256;

/// Sleep used when the queue is empty or only holds not-yet-due tokens.
const IDLE_WAIT: StdDuration = StdDuration::from_secs(1);

const MAX_BACKOFF_SECS: i64 = 60;

struct RetryToken {
    handler: Arc<dyn Handler>,
    context: HandlerContext,
    expiration: Option<DateTime<Utc>>,
    last_attempt: Option<DateTime<Utc>>,
    retry_count: u32,
}

type Queue = Arc<Mutex<VecDeque<RetryToken>>>;

/// Background retry queue for handlers whose invocation failed.
pub struct Retriever {
    queue: Queue,
    /// Present while a loop has been started; `true` signals shutdown.
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    events: broadcast::Sender<RetryEvent>,
}

impl Retriever {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            shutdown: Mutex::new(None),
            events,
        }
    }

    /// Observe retry outcomes ([`RetryEvent`]).
    pub fn subscribe(&self) -> broadcast::Receiver<RetryEvent> {
        self.events.subscribe()
    }

    /// Number of tokens currently queued.
    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Queue a failed invocation for retry. Starts the loop if needed.
    pub fn retry(&self, handler: Arc<dyn Handler>, context: HandlerContext) {
        let expiration = retry_deadline(context.trigger().next_occurrence(false), Utc::now());
        debug!(
            handler = handler.name(),
            trigger = %context.trigger(),
            expiration = ?expiration,
            "handler queued for retry"
        );
        self.queue.lock().unwrap().push_back(RetryToken {
            handler,
            context,
            expiration,
            last_attempt: None,
            retry_count: 0,
        });
        self.run();
    }

    /// Start the retry loop. No-op when a live loop is already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn run(&self) {
        let mut guard = self.shutdown.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            if !*tx.borrow() && tx.receiver_count() > 0 {
                return;
            }
        }
        let (tx, rx) = watch::channel(false);
        *guard = Some(tx);
        tokio::spawn(run_loop(
            Arc::clone(&self.queue),
            self.events.clone(),
            rx,
        ));
    }

    /// Cancel the loop. With `clean`, pending tokens are discarded (full
    /// stop); otherwise they survive for a later [`run`](Self::run) (pause).
    pub fn stop(&self, clean: bool) {
        if let Some(tx) = self.shutdown.lock().unwrap().as_ref() {
            let _ = tx.send(true);
        }
        if clean {
            self.queue.lock().unwrap().clear();
        }
    }
}

impl Default for Retriever {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_loop(queue: Queue, events: broadcast::Sender<RetryEvent>, mut shutdown: watch::Receiver<bool>) {
    debug!("retry loop started");
    // Consecutive deferrals; once every queued token has been deferred in a
    // row, nothing is due yet and the loop can sleep instead of spinning.
    let mut deferred = 0usize;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let token = queue.lock().unwrap().pop_front();
        let Some(mut token) = token else {
            deferred = 0;
            if wait_idle(&mut shutdown).await {
                break;
            }
            continue;
        };

        let now = Utc::now();
        let Some(due) = retry_due(
            token.retry_count,
            token.last_attempt,
            token.expiration,
            now,
        ) else {
            debug!(handler = token.handler.name(), "retry expired; abandoned");
            let _ = events.send(RetryEvent::Abandoned {
                handler: token.handler.name().to_string(),
                context: token.context,
            });
            continue;
        };

        if due > now {
            let backlog = {
                let mut q = queue.lock().unwrap();
                q.push_back(token);
                q.len()
            };
            deferred += 1;
            if deferred >= backlog {
                deferred = 0;
                if wait_idle(&mut shutdown).await {
                    break;
                }
            }
            continue;
        }
        deferred = 0;

        token.context.set_failure(HandlerFailure {
            count: token.retry_count,
            timestamp: token.last_attempt,
            expiration: token.expiration,
        });

        let result = token.handler.handle(&token.context).await;
        token.retry_count += 1;
        token.last_attempt = Some(Utc::now());
        let name = token.handler.name().to_string();

        match result {
            Ok(()) => {
                debug!(handler = %name, attempts = token.retry_count, "retry succeeded");
                let _ = events.send(RetryEvent::Succeeded {
                    handler: name,
                    context: token.context,
                });
            }
            Err(e) => {
                warn!(handler = %name, error = %e, attempts = token.retry_count, "retry attempt failed");
                let _ = events.send(RetryEvent::Failed {
                    handler: name,
                    context: token.context.clone(),
                });
                queue.lock().unwrap().push_back(token);
            }
        }
    }
    debug!("retry loop stopped");
}

/// Interruptible idle sleep; true means shut down.
async fn wait_idle(shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(IDLE_WAIT) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// When the token may next be attempted.
///
/// `None` means the expiration deadline has passed and the token must be
/// dropped. A first attempt (`retry_count == 0`) is due immediately;
/// afterwards the delay grows by 2s per attempt, capped at 60s, and is
/// clamped to land 1s before the expiration when it would overshoot it.
fn retry_due(
    retry_count: u32,
    last_attempt: Option<DateTime<Utc>>,
    expiration: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if expiration.is_some_and(|exp| exp < now) {
        return None;
    }
    let last = match last_attempt {
        Some(last) if retry_count > 0 => last,
        _ => return Some(now),
    };

    let backoff = Duration::seconds((i64::from(retry_count) * 2).min(MAX_BACKOFF_SECS));
    let due = last + backoff;
    if let Some(exp) = expiration {
        if due > exp {
            return Some(exp - Duration::seconds(1));
        }
    }
    Some(due)
}

/// Last instant until which retrying is worthwhile, given the trigger's
/// next regular occurrence. The deadline is pulled inward by a step that
/// scales with how far away that occurrence is; an exhausted trigger
/// (`None`) means unlimited retries.
fn retry_deadline(next: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = next?;
    let lead = next + Duration::seconds(1) - now;
    let deadline = if lead > Duration::days(28) {
        next - Duration::days(1)
    } else if lead > Duration::days(1) {
        next - Duration::hours(1)
    } else if lead > Duration::hours(1) {
        next - Duration::minutes(30)
    } else {
        next - Duration::minutes(1)
    };
    Some(deadline)
}
