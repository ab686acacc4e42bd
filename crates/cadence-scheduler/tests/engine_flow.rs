//! End-to-end flow: cron trigger -> scan -> fire -> events.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::trigger;
use cadence_scheduler::{
    Handler, HandlerContext, HandlerError, Scheduler, SchedulerEvent, WorkerState,
};

struct Recorder {
    name: String,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler for Recorder {
    fn name(&self) -> &str {
        &self.name
    }
    async fn handle(&self, ctx: &HandlerContext) -> Result<(), HandlerError> {
        // Fresh fires never carry retry state.
        assert!(ctx.failure().is_none());
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn cron_trigger_fires_and_events_arrive_in_order() {
    init_tracing();

    let scheduler = Scheduler::new();
    let mut events = scheduler.subscribe();
    let calls = Arc::new(AtomicUsize::new(0));
    let every_second = trigger::cron("* * * * * *").unwrap();
    scheduler
        .schedule(
            Arc::new(Recorder {
                name: "recorder".to_string(),
                calls: Arc::clone(&calls),
            }),
            every_second,
        )
        .unwrap();

    scheduler.start().unwrap();
    assert!(scheduler.next_time().is_some());

    // An every-second cron must fire within two seconds.
    tokio::time::sleep(Duration::from_millis(2_200)).await;
    scheduler.stop().unwrap();
    assert!(calls.load(Ordering::SeqCst) >= 1);
    assert!(scheduler.last_time().is_some());

    // Replay the stream: the batch's Scheduled always precedes its Occurred,
    // and the lifecycle walked Stopped -> ... -> Running.
    let mut saw_scheduled = false;
    let mut saw_occurred_after_scheduled = false;
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            SchedulerEvent::Scheduled { handler_count, .. } => {
                assert!(handler_count >= 1);
                saw_scheduled = true;
            }
            SchedulerEvent::Occurred { invocation_count } => {
                assert!(saw_scheduled);
                assert!(invocation_count >= 1);
                saw_occurred_after_scheduled = true;
            }
            SchedulerEvent::Handled { handler, .. } => assert_eq!(handler, "recorder"),
            SchedulerEvent::StateChanged { to, .. } => states.push(to),
        }
    }
    assert!(saw_occurred_after_scheduled);
    assert_eq!(
        &states[..3],
        &[
            WorkerState::Starting,
            WorkerState::Running,
            WorkerState::Stopping
        ]
    );
}

#[tokio::test]
async fn interned_cron_triggers_share_one_schedule_entry() {
    let scheduler = Scheduler::new();
    let a = trigger::cron("0 0 12 * * *").unwrap();
    let b = trigger::cron("0 0 12 * * *").unwrap();
    assert_eq!(a, b);

    let calls = Arc::new(AtomicUsize::new(0));
    scheduler
        .schedule(
            Arc::new(Recorder {
                name: "noon".to_string(),
                calls: Arc::clone(&calls),
            }),
            a,
        )
        .unwrap();
    // Same handler, equal trigger: a duplicate, not a second binding.
    assert!(!scheduler
        .schedule(
            Arc::new(Recorder {
                name: "noon".to_string(),
                calls,
            }),
            b.clone(),
        )
        .unwrap());
    assert_eq!(scheduler.triggers().len(), 1);
    assert_eq!(scheduler.get_handlers(&b).len(), 1);
}
