//! The scan/fire scheduling engine.
//!
//! No thread is dedicated per trigger: a full [`scan`](Scheduler::scan)
//! finds the earliest next occurrence across all bindings and arms a single
//! deferred one-shot wake-up for it. Every armed wake-up carries an epoch;
//! arming an earlier one bumps the epoch, and a stale sleeper notices and
//! no-ops. Incremental inserts go through [`Scheduler::schedule`]'s refire
//! path, which re-evaluates only the affected trigger instead of rescanning
//! the whole registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cadence_core::trigger::Trigger;

use crate::error::{Result, SchedulerError};
use crate::events::{RetryEvent, SchedulerEvent};
use crate::handler::{Handler, HandlerContext};
use crate::registry::{ScheduleRegistry, ScheduleSlot};
use crate::retriever::Retriever;
use crate::worker::WorkerState;

const EVENT_CAPACITY: usize = 256;

/// The single piece of state guarded by one critical section: whether a
/// wake-up is armed, for when, and under which epoch.
#[derive(Default)]
struct ArmState {
    /// Timestamp of the armed wake-up; `None` = nothing armed.
    next: Option<DateTime<Utc>>,
    /// Bumped on every re-arm and disarm; sleepers holding an older value
    /// are stale and must no-op.
    epoch: u64,
}

/// Trigger-driven task scheduler.
///
/// Construct with [`Scheduler::new`], register bindings with
/// [`schedule`](Self::schedule), then drive the lifecycle with
/// [`start`](Self::start)/[`stop`](Self::stop)/[`pause`](Self::pause)/
/// [`resume`](Self::resume) from within a Tokio runtime. Observers consume
/// [`SchedulerEvent`]s via [`subscribe`](Self::subscribe).
pub struct Scheduler {
    /// Self-reference handed to spawned tasks and handler contexts.
    weak: Weak<Scheduler>,
    registry: ScheduleRegistry,
    retriever: Arc<Retriever>,
    arm: Mutex<ArmState>,
    last_time: Mutex<Option<DateTime<Utc>>>,
    state: Mutex<WorkerState>,
    /// Caller-attached metadata; keys are case-insensitive, values opaque.
    states: Mutex<HashMap<String, serde_json::Value>>,
    events: broadcast::Sender<SchedulerEvent>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            registry: ScheduleRegistry::new(),
            retriever: Arc::new(Retriever::new()),
            arm: Mutex::new(ArmState::default()),
            last_time: Mutex::new(None),
            state: Mutex::new(WorkerState::Stopped),
            states: Mutex::new(HashMap::new()),
            events,
            forwarder: Mutex::new(None),
        })
    }

    // --- registration ------------------------------------------------------

    /// Bind `handler` to `trigger`.
    ///
    /// Returns `Ok(false)` when this exact pair is already bound (no-op).
    /// On a running scheduler a new binding triggers an incremental refire:
    /// only this trigger's next occurrence is evaluated, and it preempts the
    /// armed wake-up when it is earlier.
    pub fn schedule(&self, handler: Arc<dyn Handler>, trigger: Trigger) -> Result<bool> {
        if handler.name().trim().is_empty() {
            return Err(SchedulerError::EmptyHandlerName);
        }
        let (added, slot) = self.registry.bind(handler, &trigger);
        if added {
            debug!(trigger = %trigger, "handler bound");
            if self.is_scheduling() {
                self.refire(&slot);
            }
        }
        Ok(added)
    }

    /// Move a handler's binding to `trigger`, removing it from every other
    /// trigger it was attached to. Acts as [`schedule`](Self::schedule) for
    /// a handler that was never registered.
    pub fn reschedule(&self, handler: Arc<dyn Handler>, trigger: Trigger) -> Result<()> {
        if handler.name().trim().is_empty() {
            return Err(SchedulerError::EmptyHandlerName);
        }
        let slot = self.registry.rebind(handler, &trigger);
        debug!(trigger = %trigger, "handler rebound");
        if self.is_scheduling() {
            self.refire(&slot);
        }
        Ok(())
    }

    /// Remove every binding and disarm any pending wake-up.
    pub fn unschedule_all(&self) {
        self.registry.clear();
        self.disarm();
        info!("all schedules cleared");
    }

    /// Remove a handler from every trigger it is bound to.
    pub fn unschedule_handler(&self, name: &str) -> bool {
        self.registry.unbind_handler(name)
    }

    /// Remove a trigger and all of its bindings.
    ///
    /// A wake-up already armed for this trigger is left in place; it will
    /// fire, find nothing due, and rescan.
    pub fn unschedule_trigger(&self, trigger: &Trigger) -> bool {
        self.registry.unbind_trigger(trigger)
    }

    // --- queries -----------------------------------------------------------

    pub fn triggers(&self) -> Vec<Trigger> {
        self.registry.triggers()
    }

    pub fn handlers(&self) -> Vec<Arc<dyn Handler>> {
        self.registry.handlers()
    }

    pub fn get_handler(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.registry.get_handler(name)
    }

    /// Snapshot of the handlers bound to `trigger`.
    pub fn get_handlers(&self, trigger: &Trigger) -> Vec<Arc<dyn Handler>> {
        self.registry.get_handlers(trigger)
    }

    /// Timestamp of the currently armed wake-up, if any.
    pub fn next_time(&self) -> Option<DateTime<Utc>> {
        self.arm.lock().unwrap().next
    }

    /// Timestamp of the most recent actual fire, if any.
    pub fn last_time(&self) -> Option<DateTime<Utc>> {
        *self.last_time.lock().unwrap()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap()
    }

    pub fn is_scheduling(&self) -> bool {
        self.state().is_running()
    }

    pub fn retriever(&self) -> &Arc<Retriever> {
        &self.retriever
    }

    /// Observe scheduler notifications ([`SchedulerEvent`]).
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    // --- caller-attached metadata ------------------------------------------

    pub fn has_states(&self) -> bool {
        !self.states.lock().unwrap().is_empty()
    }

    /// Snapshot of the metadata side-channel.
    pub fn states(&self) -> HashMap<String, serde_json::Value> {
        self.states.lock().unwrap().clone()
    }

    /// Attach metadata. Keys are case-insensitive; the value is opaque to
    /// the scheduler.
    pub fn set_state_entry(&self, key: &str, value: serde_json::Value) {
        self.states
            .lock()
            .unwrap()
            .insert(key.to_lowercase(), value);
    }

    pub fn state_entry(&self, key: &str) -> Option<serde_json::Value> {
        self.states.lock().unwrap().get(&key.to_lowercase()).cloned()
    }

    // --- lifecycle ---------------------------------------------------------

    /// Stopped -> Running: start the retriever and run the initial scan.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        self.advance(&[WorkerState::Stopped], WorkerState::Starting, "start")?;
        self.retriever.run();
        self.spawn_forwarder();
        // Running before the initial scan: a binding arriving mid-start
        // already sees a running scheduler and takes the refire path, so
        // it cannot slip between the scan and the state flip unarmed.
        self.advance(&[WorkerState::Starting], WorkerState::Running, "start")?;
        self.scan();
        info!("scheduler started");
        Ok(())
    }

    /// Running|Paused -> Stopped: disarm, discard pending retries.
    pub fn stop(&self) -> Result<()> {
        self.advance(
            &[WorkerState::Running, WorkerState::Paused],
            WorkerState::Stopping,
            "stop",
        )?;
        self.disarm();
        self.retriever.stop(true);
        if let Some(forwarder) = self.forwarder.lock().unwrap().take() {
            forwarder.abort();
        }
        self.advance(&[WorkerState::Stopping], WorkerState::Stopped, "stop")?;
        info!("scheduler stopped");
        Ok(())
    }

    /// Running -> Paused: disarm but keep pending retries for resume.
    pub fn pause(&self) -> Result<()> {
        self.advance(&[WorkerState::Running], WorkerState::Pausing, "pause")?;
        self.disarm();
        self.retriever.stop(false);
        self.advance(&[WorkerState::Pausing], WorkerState::Paused, "pause")?;
        info!("scheduler paused");
        Ok(())
    }

    /// Paused -> Running: restart the retriever and rescan.
    pub fn resume(&self) -> Result<()> {
        self.advance(&[WorkerState::Paused], WorkerState::Resuming, "resume")?;
        self.retriever.run();
        self.spawn_forwarder();
        self.advance(&[WorkerState::Resuming], WorkerState::Running, "resume")?;
        self.scan();
        info!("scheduler resumed");
        Ok(())
    }

    // --- scan / fire -------------------------------------------------------

    /// Full rescan: find the earliest next occurrence across all bindings
    /// and arm a wake-up for it. Triggers tying at that minimum coalesce
    /// into one batch. Arms nothing when every trigger is exhausted.
    pub fn scan(&self) {
        if self.registry.is_empty() {
            return;
        }

        let now = Utc::now();
        let mut next: Option<DateTime<Utc>> = None;
        let mut batch: Vec<Arc<ScheduleSlot>> = Vec::new();

        for slot in self.registry.slots() {
            if slot.is_empty() {
                continue;
            }
            let Some(ts) = slot.trigger().next_occurrence_from(now, false) else {
                // Exhausted; dropped from scans but kept in the registry.
                continue;
            };
            match next {
                None => {
                    next = Some(ts);
                    batch.push(slot);
                }
                Some(current) if ts < current => {
                    next = Some(ts);
                    batch.clear();
                    batch.push(slot);
                }
                Some(current) if ts == current => batch.push(slot),
                Some(_) => {}
            }
        }

        if let Some(ts) = next {
            self.fire(ts, batch);
        }
    }

    /// Incremental re-arm for a single binding: O(1) against the registry.
    fn refire(&self, slot: &Arc<ScheduleSlot>) {
        if let Some(ts) = slot.trigger().next_occurrence_from(Utc::now(), false) {
            self.fire(ts, vec![Arc::clone(slot)]);
        }
    }

    /// Arm a wake-up at `timestamp` for `batch`.
    ///
    /// Guard: a wake-up already armed for an earlier-or-equal timestamp
    /// wins, and this call is ignored — a late or weaker refire can never
    /// displace a still-valid earlier arm. Otherwise the epoch is bumped
    /// (invalidating the previous arm's sleeper) and a one-shot task is
    /// spawned. Both `scan` and `refire` funnel through here, so the
    /// incremental path cannot race the full path into a double arm.
    fn fire(&self, timestamp: DateTime<Utc>, batch: Vec<Arc<ScheduleSlot>>) {
        if batch.is_empty() {
            return;
        }

        let epoch = {
            let mut arm = self.arm.lock().unwrap();
            if arm.next.is_some_and(|armed| armed <= timestamp) {
                return;
            }
            arm.epoch += 1;
            arm.next = Some(timestamp);
            arm.epoch
        };

        let handler_count: usize = batch.iter().map(|slot| slot.len()).sum();
        let triggers: Vec<Trigger> = batch.iter().map(|slot| slot.trigger().clone()).collect();
        debug!(at = %timestamp, handlers = handler_count, "wake-up armed");
        // Observers learn about the plan before it executes.
        self.emit(SchedulerEvent::Scheduled {
            handler_count,
            triggers,
        });

        let delay = (timestamp - Utc::now())
            .to_std()
            .unwrap_or(StdDuration::ZERO);
        let Some(scheduler) = self.weak.upgrade() else {
            return;
        };

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            {
                let mut arm = scheduler.arm.lock().unwrap();
                if arm.epoch != epoch {
                    // Superseded by a later arm or a disarm.
                    return;
                }
                arm.next = None;
            }
            *scheduler.last_time.lock().unwrap() = Some(timestamp);

            // Arm the next round before touching any handler, so a slow
            // handler cannot delay the next round's timer.
            scheduler.scan();

            let mut index = 0usize;
            for slot in &batch {
                for handler in slot.snapshot() {
                    let ctx = HandlerContext::new(
                        Arc::downgrade(&scheduler),
                        slot.trigger().clone(),
                        index,
                    );
                    index += 1;
                    match handler.handle(&ctx).await {
                        Ok(()) => scheduler.emit(SchedulerEvent::Handled {
                            handler: handler.name().to_string(),
                            context: ctx,
                        }),
                        Err(e) => {
                            warn!(
                                handler = handler.name(),
                                trigger = %slot.trigger(),
                                error = %e,
                                "handler failed; queued for retry"
                            );
                            scheduler.retriever.retry(handler, ctx);
                        }
                    }
                }
            }
            scheduler.emit(SchedulerEvent::Occurred {
                invocation_count: index,
            });
        });
    }

    /// Invalidate any armed wake-up without blocking on the sleeper.
    fn disarm(&self) {
        let mut arm = self.arm.lock().unwrap();
        arm.epoch += 1;
        arm.next = None;
    }

    /// Legal-transition check + state swap + `StateChanged` notification.
    fn advance(
        &self,
        allowed: &[WorkerState],
        to: WorkerState,
        operation: &'static str,
    ) -> Result<()> {
        let from = {
            let mut state = self.state.lock().unwrap();
            if !allowed.contains(&*state) {
                return Err(SchedulerError::InvalidState {
                    operation,
                    state: *state,
                });
            }
            std::mem::replace(&mut *state, to)
        };
        self.emit(SchedulerEvent::StateChanged { from, to });
        Ok(())
    }

    /// Forward the retriever's successes into this scheduler's `Handled`
    /// stream so observers see retries uniformly.
    fn spawn_forwarder(&self) {
        let mut guard = self.forwarder.lock().unwrap();
        if guard.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let mut retry_events = self.retriever.subscribe();
        let weak = self.weak.clone();
        *guard = Some(tokio::spawn(async move {
            loop {
                match retry_events.recv().await {
                    Ok(RetryEvent::Succeeded { handler, context }) => {
                        let Some(scheduler) = weak.upgrade() else { break };
                        scheduler.emit(SchedulerEvent::Handled { handler, context });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    /// Best-effort: an error only means there is no subscriber.
    fn emit(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }
}
