//! End-to-end behavior of the wired subsystem

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::Notify;

use resilience::alerting::{AlertManager, MemoryChannel};
use resilience::classifier::ErrorType;
use resilience::clock::{AutoAdvanceClock, ManualClock, SharedClock};
use resilience::config::{
    AlertingConfig, LimitsConfig, MonitoringConfig, PersistenceConfig, RetryConfig,
};
use resilience::exceptions::ExceptionStore;
use resilience::models::{ErrorContext, OperationError, PolicyOverride, Severity};
use resilience::retry::{RetryScheduler, SubmitOptions, TaskState};
use resilience::RetryError;

fn scheduler(limits: LimitsConfig, clock: SharedClock) -> RetryScheduler {
    RetryScheduler::builder(RetryConfig::default(), limits, MonitoringConfig::default())
        .clock(clock)
        .build()
}

#[tokio::test]
async fn test_transient_failures_back_off_then_succeed() {
    let clock = Arc::new(AutoAdvanceClock::fixed());
    let scheduler = scheduler(LimitsConfig::default(), clock.clone());
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let handle = scheduler
        .submit(
            move |ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if ctx.attempt < 3 {
                        Err(OperationError::new("something odd"))
                    } else {
                        Ok("done")
                    }
                }
            },
            SubmitOptions::new().policy(
                PolicyOverride::default()
                    .max_attempts(3)
                    .initial_delay_ms(100)
                    .backoff_multiplier(2.0)
                    .jitter(false),
            ),
        )
        .unwrap();

    assert_eq!(handle.await.unwrap(), "done");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        clock.sleeps(),
        vec![Duration::from_millis(100), Duration::from_millis(200)]
    );
    assert_eq!(scheduler.statistics(None).overview.successful, 1);
}

#[tokio::test]
async fn test_validation_failure_is_not_retried() {
    let clock = Arc::new(ManualClock::fixed());
    let scheduler = scheduler(LimitsConfig::default(), clock.clone());

    let handle = scheduler
        .submit(
            |_ctx| async { Err::<(), _>(OperationError::new("validation failed")) },
            SubmitOptions::new(),
        )
        .unwrap();

    match handle.await {
        Err(RetryError::RetryExhausted {
            attempts,
            error_type,
            ..
        }) => {
            assert_eq!(attempts, 1);
            assert_eq!(error_type, ErrorType::Validation);
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert!(clock.sleeps().is_empty());
}

#[tokio::test]
async fn test_concurrency_cap_queues_the_overflow() {
    let limits = LimitsConfig {
        max_concurrent_retries: 10,
        ..LimitsConfig::default()
    };
    let scheduler = scheduler(limits, Arc::new(ManualClock::fixed()));
    let ran = Arc::new(AtomicU32::new(0));
    let gate = Arc::new(Notify::new());

    // Only the first task can finish, and only once the gate opens
    let mut handles: Vec<_> = (0..15)
        .map(|i| {
            let ran = ran.clone();
            let gate = (i == 0).then(|| gate.clone());
            scheduler
                .submit(
                    move |_ctx| {
                        ran.fetch_add(1, Ordering::SeqCst);
                        let gate = gate.clone();
                        async move {
                            match gate {
                                Some(gate) => {
                                    gate.notified().await;
                                    Ok(())
                                }
                                None => std::future::pending::<Result<(), OperationError>>().await,
                            }
                        }
                    },
                    SubmitOptions::new(),
                )
                .unwrap()
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(ran.load(Ordering::SeqCst), 10);
    let active = scheduler.active_tasks();
    assert_eq!(active.len(), 10);
    assert!(active.iter().all(|t| t.state == TaskState::Attempting));

    let queued = scheduler.queue();
    assert_eq!(queued.len(), 5);
    assert!(queued.iter().all(|t| t.state == TaskState::Queued));
    assert_eq!(
        scheduler.task_state(handles[10].task_id()),
        Some(TaskState::Queued)
    );
    assert_eq!(
        scheduler.task_state(handles[14].task_id()),
        Some(TaskState::Queued)
    );

    gate.notify_one();
    handles.remove(0).await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), async {
        while ran.load(Ordering::SeqCst) < 11 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("the freed slot should go to the next queued task");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(ran.load(Ordering::SeqCst), 11);
    assert_eq!(scheduler.active_tasks().len(), 10);
    assert_eq!(scheduler.queue().len(), 4);
    // FIFO: the eleventh submission took the slot
    assert_ne!(
        scheduler.task_state(handles[9].task_id()),
        Some(TaskState::Queued)
    );
    assert_eq!(
        scheduler.task_state(handles[10].task_id()),
        Some(TaskState::Queued)
    );
}

#[tokio::test]
async fn test_exception_is_classified_and_counted() {
    let store = ExceptionStore::builder(PersistenceConfig::default())
        .clock(Arc::new(ManualClock::fixed()))
        .build();
    let before = store.statistics(None).total;

    let record = store
        .handle(
            &OperationError::new("Network timeout"),
            ErrorContext::new().with_component("ingest"),
        )
        .await;

    assert_eq!(record.category, ErrorType::Network);
    assert_eq!(store.statistics(None).total, before + 1);
    assert_eq!(
        store.get(record.id).unwrap().context.component.as_deref(),
        Some("ingest")
    );
}

#[tokio::test]
async fn test_medium_errors_raise_one_threshold_alert() {
    let clock = Arc::new(ManualClock::fixed());
    let channel = Arc::new(MemoryChannel::new());
    let alerts = AlertManager::builder(AlertingConfig::default())
        .clock(clock.clone())
        .channel(channel.clone())
        .build();
    let store = ExceptionStore::builder(PersistenceConfig::default())
        .clock(clock.clone())
        .alerts(alerts.clone())
        .build();

    for i in 1..=11 {
        clock.advance(Duration::from_secs(5));
        let record = store
            .handle(&OperationError::new("something odd"), ErrorContext::new())
            .await;
        assert_eq!(record.severity, Severity::Medium);

        let expected = if i < 10 { 0 } else { 1 };
        assert_eq!(alerts.alerts().len(), expected, "after entry {i}");
    }

    let alert = &alerts.alerts()[0];
    assert_eq!(alert.level, Severity::High);
    assert_eq!(alert.exception_id, None);
    assert_eq!(channel.len(), 1);
}

#[tokio::test]
async fn test_cancelled_queued_task_never_runs() {
    let limits = LimitsConfig {
        max_concurrent_retries: 1,
        ..LimitsConfig::default()
    };
    let scheduler = scheduler(limits, Arc::new(ManualClock::fixed()));

    let _busy = scheduler
        .submit(
            |_ctx| std::future::pending::<Result<(), OperationError>>(),
            SubmitOptions::new(),
        )
        .unwrap();

    let invoked = Arc::new(AtomicBool::new(false));
    let flag = invoked.clone();
    let queued = scheduler
        .submit(
            move |_ctx| {
                flag.store(true, Ordering::SeqCst);
                async { Ok::<_, OperationError>(()) }
            },
            SubmitOptions::new(),
        )
        .unwrap();

    assert_eq!(scheduler.task_state(queued.task_id()), Some(TaskState::Queued));
    assert!(scheduler.cancel(queued.task_id()));

    assert!(queued.await.unwrap_err().is_cancelled());
    assert!(!invoked.load(Ordering::SeqCst));
    assert!(scheduler.queue().is_empty());
}
