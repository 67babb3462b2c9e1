//! End-to-end scenarios for queueing, truncation and delivery

use anyhow::Result;
use async_trait::async_trait;
use flare_core::config::ShutdownConfig;
use flare_core::payload::Message;
use flare_core::{
    Body, Data, DeliveryOutcome, Destination, DropReason, FlareConfig, InternalEvent, Level,
    OverflowPolicy, Payload, RateLimitSource, Report, ShutdownMode, TruncationEngine,
    TruncationStrategy,
};
use flare_pipeline::{
    InMemoryStore, Notifier, PayloadStore, QueueController, QueueControllerBuilder,
    QueueSettings, ReportStatus, RetryPolicy, ShutdownReport,
};
use flare_transport::{PayloadSender, ScriptStep, ScriptedSender};
use mockall::mock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Instant};
use uuid::Uuid;

mock! {
    Store {}

    #[async_trait]
    impl PayloadStore for Store {
        async fn save_undelivered(&self, payload: &Payload) -> flare_pipeline::Result<()>;
        async fn load_pending(&self, destination: &Destination) -> flare_pipeline::Result<Vec<Payload>>;
    }
}

const WAIT: Duration = Duration::from_secs(60);

fn config() -> FlareConfig {
    FlareConfig::new("token-1234", "test")
}

fn destination() -> Destination {
    Destination::new("token-1234", "test")
}

fn message_payload(text: &str) -> Payload {
    Payload::new(
        "token-1234",
        Data::new("test", Level::Error, Body::Message(Message::new(text))),
    )
}

/// A message payload whose JSON encoding is exactly `size` bytes.
fn sized_payload(size: usize) -> Payload {
    let mut payload = message_payload("");
    let base = payload.serialized_size().unwrap();
    *payload.body_mut() = Body::Message(Message::new("x".repeat(size - base)));
    payload
}

fn api_error(status: u16, retry_after: Option<Duration>) -> DeliveryOutcome {
    DeliveryOutcome::ApiError {
        status,
        code: Some(1),
        message: "collector said no".to_string(),
        retry_after,
    }
}

fn controller(sender: &ScriptedSender) -> QueueControllerBuilder {
    let sender: Arc<dyn PayloadSender> = Arc::new(sender.clone());
    QueueController::builder(sender)
        .rate_limit(0, Duration::from_secs(1))
        .retry_policy(RetryPolicy::default().no_jitter())
        .scan_interval(Duration::from_millis(10))
}

/// Everything published until the `n`th delivery attempt, inclusive.
async fn until_attempts(rx: &mut UnboundedReceiver<InternalEvent>, n: usize) -> Vec<InternalEvent> {
    let mut seen = Vec::new();
    let mut attempts = 0;
    while attempts < n {
        let Some(event) = rx.recv().await else {
            break;
        };
        if matches!(event, InternalEvent::DeliveryAttempted { .. }) {
            attempts += 1;
        }
        seen.push(event);
    }
    seen
}

fn drain(rx: &mut UnboundedReceiver<InternalEvent>) -> Vec<InternalEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    seen
}

fn attempts(events: &[InternalEvent]) -> Vec<(u32, DeliveryOutcome)> {
    events
        .iter()
        .filter_map(|event| match event {
            InternalEvent::DeliveryAttempted {
                attempt, outcome, ..
            } => Some((*attempt, outcome.clone())),
            _ => None,
        })
        .collect()
}

fn drop_reasons(events: &[InternalEvent]) -> Vec<(Uuid, DropReason)> {
    events
        .iter()
        .filter_map(|event| match event {
            InternalEvent::PayloadDropped {
                payload_id, reason, ..
            } => Some((*payload_id, *reason)),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_depth_three_queue_with_byte_ceiling() -> Result<()> {
    let base = message_payload("").serialized_size()?;
    let ceiling = base + 400;

    let sender = ScriptedSender::default();
    let controller = controller(&sender).build();
    let (_id, mut events) = controller.events().subscribe_channel();
    let queue = controller
        .queue_for(
            destination(),
            QueueSettings {
                max_depth: 3,
                overflow_policy: OverflowPolicy::DropOldest,
                truncation: TruncationEngine::new(ceiling, TruncationStrategy::default_chain()),
            },
        )
        .await?;

    let payloads: Vec<Payload> = [100, 200, 300, 500]
        .iter()
        .map(|extra| sized_payload(base + extra))
        .collect();
    let ids: Vec<Uuid> = payloads.iter().map(Payload::id).collect();
    for payload in payloads.clone() {
        queue.enqueue(payload);
    }

    assert_eq!(queue.count(), 3);
    assert_eq!(queue.peek_oldest().map(|p| p.id()), Some(ids[1]));

    controller.start()?;
    let seen = timeout(WAIT, until_attempts(&mut events, 3)).await?;

    let sent = sender.attempts();
    assert_eq!(sent.iter().map(Payload::id).collect::<Vec<_>>(), ids[1..].to_vec());
    assert_eq!(sent[0], payloads[1], "payload under the ceiling is sent untouched");
    assert_eq!(sent[1], payloads[2]);

    let mut truncated = sent[2].clone();
    assert!(truncated.serialized_size()? <= ceiling);
    assert_eq!(truncated.destination(), destination());

    assert_eq!(drop_reasons(&seen), vec![(ids[0], DropReason::QueueOverflow)]);
    let truncated_ids: Vec<Uuid> = seen
        .iter()
        .filter_map(|event| match event {
            InternalEvent::PayloadTruncated { payload_id, .. } => Some(*payload_id),
            _ => None,
        })
        .collect();
    assert_eq!(truncated_ids, vec![ids[3]]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_two_per_second() -> Result<()> {
    let sender = ScriptedSender::default();
    let controller = controller(&sender)
        .rate_limit(2, Duration::from_secs(1))
        .build();
    let start = Instant::now();

    let times = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&times);
    controller.events().subscribe(move |event| {
        if let InternalEvent::DeliveryAttempted { .. } = event {
            sink.lock().unwrap().push(Instant::now().duration_since(start));
        }
    });
    let (_id, mut events) = controller.events().subscribe_channel();

    let queue = controller
        .queue_for(destination(), QueueSettings::default())
        .await?;
    for i in 0..5 {
        queue.enqueue(message_payload(&format!("event {}", i)));
    }

    controller.start()?;
    let seen = timeout(WAIT, until_attempts(&mut events, 5)).await?;

    let times = times.lock().unwrap().clone();
    let second = Duration::from_secs(1);
    assert_eq!(times.iter().filter(|t| **t < second).count(), 2);
    assert_eq!(
        times
            .iter()
            .filter(|t| **t >= second && **t < second * 2)
            .count(),
        2
    );
    assert_eq!(sender.attempt_count(), 5);

    assert!(seen.iter().any(|event| matches!(
        event,
        InternalEvent::RateLimited {
            source: RateLimitSource::Local,
            ..
        }
    )));
    assert!(drop_reasons(&seen).is_empty(), "rate limiting alone never drops");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_server_error_is_retried_then_delivered() -> Result<()> {
    let sender = ScriptedSender::default();
    sender.respond(api_error(503, None));
    let controller = controller(&sender).build();
    let (_id, mut events) = controller.events().subscribe_channel();
    let notifier = Notifier::new(config(), &controller).await?;
    controller.start()?;

    let started = Instant::now();
    let status = notifier
        .report_and_wait(Report::message(Level::Error, "db timeout"), WAIT)
        .await;

    assert_eq!(status, ReportStatus::Delivered);
    assert!(started.elapsed() >= Duration::from_millis(500), "backoff applied");

    let seen = drain(&mut events);
    let attempts = attempts(&seen);
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0], (1, api_error(503, None)));
    assert!(attempts[1].1.is_success());
    assert!(drop_reasons(&seen).is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_client_error_is_dropped_without_retry() -> Result<()> {
    let sender = ScriptedSender::default();
    sender.respond(api_error(401, None));
    let controller = controller(&sender).build();
    let (_id, mut events) = controller.events().subscribe_channel();
    let notifier = Notifier::new(config(), &controller).await?;
    controller.start()?;

    let status = notifier
        .report_and_wait(Report::message(Level::Error, "bad token"), WAIT)
        .await;

    assert_eq!(status, ReportStatus::Failed(api_error(401, None)));
    assert_eq!(sender.attempt_count(), 1);

    let seen = drain(&mut events);
    let sent_id = sender.attempts()[0].id();
    assert_eq!(drop_reasons(&seen), vec![(sent_id, DropReason::Rejected)]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_report_times_out_while_delivery_continues() -> Result<()> {
    let sender = ScriptedSender::default();
    sender.push(ScriptStep::Delay(
        Duration::from_secs(5),
        DeliveryOutcome::Success { uuid: None },
    ));
    let controller = controller(&sender).build();
    let (_id, mut events) = controller.events().subscribe_channel();
    let notifier = Arc::new(Notifier::new(config(), &controller).await?);
    controller.start()?;

    let started = std::time::Instant::now();
    let blocking = Arc::clone(&notifier);
    let status = tokio::task::spawn_blocking(move || {
        blocking.report_blocking(
            Report::message(Level::Error, "slow collector"),
            Duration::from_secs(1),
        )
    })
    .await?;
    let waited = started.elapsed();

    assert_eq!(status, ReportStatus::TimedOut);
    assert!(waited >= Duration::from_secs(1));
    assert!(waited < Duration::from_secs(4), "returned after {:?}", waited);

    let seen = timeout(Duration::from_secs(15), until_attempts(&mut events, 1)).await?;
    assert!(attempts(&seen)[0].1.is_success());
    assert!(started.elapsed() >= Duration::from_secs(5));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_async_wait_times_out_while_delivery_continues() -> Result<()> {
    let sender = ScriptedSender::default();
    sender.push(ScriptStep::Delay(
        Duration::from_secs(5),
        DeliveryOutcome::Success { uuid: None },
    ));
    let controller = controller(&sender).build();
    let (_id, mut events) = controller.events().subscribe_channel();
    let notifier = Notifier::new(config(), &controller).await?;
    controller.start()?;

    let started = Instant::now();
    let status = notifier
        .report_and_wait(
            Report::message(Level::Error, "slow collector"),
            Duration::from_secs(1),
        )
        .await;

    assert_eq!(status, ReportStatus::TimedOut);
    assert_eq!(started.elapsed(), Duration::from_secs(1));

    let seen = timeout(WAIT, until_attempts(&mut events, 1)).await?;
    assert!(attempts(&seen)[0].1.is_success());
    assert!(started.elapsed() >= Duration::from_secs(5));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_panicking_sender_does_not_stop_the_loop() -> Result<()> {
    let sender = ScriptedSender::default();
    sender.push(ScriptStep::Panic("sender bug".to_string()));
    let controller = controller(&sender).build();
    let notifier = Notifier::new(config(), &controller).await?;
    controller.start()?;

    let first = notifier
        .report_and_wait(Report::message(Level::Error, "first"), WAIT)
        .await;
    let second = notifier
        .report_and_wait(Report::message(Level::Error, "second"), WAIT)
        .await;

    assert_eq!(
        first,
        ReportStatus::Failed(DeliveryOutcome::InternalError {
            message: "sender bug".to_string()
        })
    );
    assert_eq!(second, ReportStatus::Delivered);
    assert!(controller.is_running());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_server_rate_limit_pauses_destination() -> Result<()> {
    let sender = ScriptedSender::default();
    sender.respond(api_error(429, Some(Duration::from_secs(2))));
    let controller = controller(&sender).build();
    let (_id, mut events) = controller.events().subscribe_channel();
    let notifier = Notifier::new(config(), &controller).await?;
    controller.start()?;

    let started = Instant::now();
    let status = notifier
        .report_and_wait(Report::message(Level::Warning, "burst"), WAIT)
        .await;

    assert_eq!(status, ReportStatus::Delivered);
    assert!(started.elapsed() >= Duration::from_secs(2));

    let seen = drain(&mut events);
    assert!(seen.contains(&InternalEvent::RateLimited {
        destination: destination(),
        source: RateLimitSource::Server,
        retry_in: Duration::from_secs(2),
    }));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_communication_errors_go_to_store() -> Result<()> {
    let sender = ScriptedSender::new(DeliveryOutcome::CommunicationError {
        message: "connection refused".to_string(),
    });
    let store = Arc::new(InMemoryStore::new());
    let controller = controller(&sender)
        .retry_policy(RetryPolicy {
            max_retries: 1,
            ..RetryPolicy::default().no_jitter()
        })
        .store(store.clone())
        .build();
    let (_id, mut events) = controller.events().subscribe_channel();
    let notifier = Notifier::new(config(), &controller).await?;
    controller.start()?;

    let status = notifier
        .report_and_wait(Report::message(Level::Error, "offline"), WAIT)
        .await;

    assert_eq!(status, ReportStatus::Persisted);
    assert_eq!(sender.attempt_count(), 2);
    assert_eq!(store.len(), 1);
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, InternalEvent::PayloadPersisted { .. })));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flush_delivers_pending() -> Result<()> {
    let sender = ScriptedSender::default();
    let controller = controller(&sender).build();
    let notifier = Notifier::new(config(), &controller).await?;
    for i in 0..3 {
        assert!(notifier.log(Level::Error, format!("pending {}", i)).is_queued());
    }

    let report = controller.shutdown().await;

    assert_eq!(
        report,
        ShutdownReport {
            delivered: 3,
            persisted: 0,
            dropped: 0,
            timed_out: false,
        }
    );
    assert_eq!(sender.attempt_count(), 3);
    assert!(notifier.queue().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flush_persists_leftovers_at_deadline() -> Result<()> {
    let mut store = MockStore::new();
    store
        .expect_load_pending()
        .times(1)
        .returning(|_| Ok(Vec::new()));
    store
        .expect_save_undelivered()
        .times(2)
        .returning(|_| Ok(()));

    let sender = ScriptedSender::default();
    let controller = controller(&sender)
        .rate_limit(1, Duration::from_secs(60))
        .store(Arc::new(store))
        .shutdown(ShutdownConfig {
            mode: ShutdownMode::Flush,
            timeout_ms: 500,
        })
        .build();
    let notifier = Notifier::new(config(), &controller).await?;
    for i in 0..3 {
        notifier.log(Level::Error, format!("pending {}", i));
    }

    let report = controller.shutdown().await;

    assert_eq!(
        report,
        ShutdownReport {
            delivered: 1,
            persisted: 2,
            dropped: 0,
            timed_out: true,
        }
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drop_discards_pending() -> Result<()> {
    let sender = ScriptedSender::default();
    let controller = controller(&sender)
        .shutdown(ShutdownConfig {
            mode: ShutdownMode::Drop,
            timeout_ms: 500,
        })
        .build();
    let (_id, mut events) = controller.events().subscribe_channel();
    let notifier = Notifier::new(config(), &controller).await?;
    notifier.log(Level::Error, "one");
    notifier.log(Level::Error, "two");

    let report = controller.shutdown().await;

    assert_eq!(report.dropped, 2);
    assert_eq!(report.delivered, 0);
    assert_eq!(sender.attempt_count(), 0);

    let reasons = drop_reasons(&drain(&mut events));
    assert_eq!(reasons.len(), 2);
    assert!(reasons
        .iter()
        .all(|(_, reason)| *reason == DropReason::Shutdown));
    Ok(())
}

async fn until_sent(sender: &ScriptedSender, n: usize) {
    while sender.attempt_count() < n {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drop_settles_aborted_delivery() -> Result<()> {
    let sender = ScriptedSender::default().with_latency(Duration::from_secs(5));
    let controller = controller(&sender)
        .shutdown(ShutdownConfig {
            mode: ShutdownMode::Drop,
            timeout_ms: 500,
        })
        .build();
    let (_id, mut events) = controller.events().subscribe_channel();
    let notifier = Arc::new(Notifier::new(config(), &controller).await?);
    controller.start()?;

    let waiter = tokio::spawn({
        let notifier = Arc::clone(&notifier);
        async move {
            notifier
                .report_and_wait(Report::message(Level::Error, "slow"), WAIT)
                .await
        }
    });
    until_sent(&sender, 1).await;
    let sent_id = sender.attempts()[0].id();

    let report = controller.shutdown().await;

    assert_eq!(
        report,
        ShutdownReport {
            delivered: 0,
            persisted: 0,
            dropped: 1,
            timed_out: true,
        }
    );
    assert_eq!(waiter.await?, ReportStatus::Dropped(DropReason::Shutdown));
    assert_eq!(
        drop_reasons(&drain(&mut events)),
        vec![(sent_id, DropReason::Shutdown)]
    );
    assert_eq!(notifier.queue().count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flush_persists_aborted_delivery() -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let sender = ScriptedSender::default().with_latency(Duration::from_secs(5));
    let controller = controller(&sender)
        .store(store.clone())
        .shutdown(ShutdownConfig {
            mode: ShutdownMode::Flush,
            timeout_ms: 500,
        })
        .build();
    let notifier = Arc::new(Notifier::new(config(), &controller).await?);
    controller.start()?;

    let waiter = tokio::spawn({
        let notifier = Arc::clone(&notifier);
        async move {
            notifier
                .report_and_wait(Report::message(Level::Error, "slow"), WAIT)
                .await
        }
    });
    until_sent(&sender, 1).await;

    let report = controller.shutdown().await;

    assert_eq!(report.persisted, 1);
    assert_eq!(report.dropped, 0);
    assert!(report.timed_out);
    assert_eq!(waiter.await?, ReportStatus::Persisted);
    assert_eq!(store.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_new_queue_loads_pending_from_store() -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    store
        .save_undelivered(&message_payload("left over 1"))
        .await?;
    store
        .save_undelivered(&message_payload("left over 2"))
        .await?;
    store
        .save_undelivered(&Payload::new(
            "other-token",
            Data::new("test", Level::Error, Body::Message(Message::new("elsewhere"))),
        ))
        .await?;

    let sender = ScriptedSender::default();
    let controller = controller(&sender).store(store.clone()).build();
    let queue = controller
        .queue_for(destination(), QueueSettings::default())
        .await?;

    assert_eq!(queue.count(), 2);
    assert_eq!(store.len(), 1, "other destinations stay in the store");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_destinations_are_served_round_robin() -> Result<()> {
    let sender = ScriptedSender::default();
    let controller = controller(&sender).build();
    let (_id, mut events) = controller.events().subscribe_channel();

    let a = controller
        .queue_for(Destination::new("token-a", "test"), QueueSettings::default())
        .await?;
    let b = controller
        .queue_for(Destination::new("token-b", "test"), QueueSettings::default())
        .await?;
    for i in 0..3 {
        a.enqueue(Payload::new(
            "token-a",
            Data::new("test", Level::Info, Body::Message(Message::new(format!("a{}", i)))),
        ));
    }
    b.enqueue(Payload::new(
        "token-b",
        Data::new("test", Level::Info, Body::Message(Message::new("b0"))),
    ));

    controller.start()?;
    timeout(WAIT, until_attempts(&mut events, 4)).await?;

    let tokens: Vec<String> = sender
        .attempts()
        .iter()
        .map(|payload| payload.access_token().to_string())
        .collect();
    assert_eq!(tokens.len(), 4);
    assert!(tokens[..2].contains(&"token-b".to_string()), "b served early: {:?}", tokens);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribed_observer_sees_nothing() -> Result<()> {
    let sender = ScriptedSender::default();
    let controller = controller(&sender).build();
    let notifier = Notifier::new(config(), &controller).await?;

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let id = controller.events().subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert!(controller.events().unsubscribe(id));

    controller.start()?;
    let status = notifier
        .report_and_wait(Report::message(Level::Error, "quiet"), WAIT)
        .await;

    assert_eq!(status, ReportStatus::Delivered);
    assert_eq!(seen.load(Ordering::SeqCst), 0);
    Ok(())
}
