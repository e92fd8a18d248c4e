//! End-to-end forwarding through a running relay: ingestion, fan-out,
//! delivery, failure classification and overflow.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chat_relay::clock::ManualClock;
use chat_relay::config::QueueConfig;
use chat_relay::error::{PermissionScope, TransportError};
use chat_relay::store::TaskStore;
use chat_relay::supervisor::ExitReason;
use chat_relay::transport::{ChatId, InboundMessage};

use common::{eventually, spawn, start_relay, start_relay_with_clock, test_config};

const SOURCE: ChatId = ChatId(-100_111);
const DEST_A: ChatId = ChatId(-100_201);
const DEST_B: ChatId = ChatId(-100_202);

fn post(id: i64) -> InboundMessage {
    InboundMessage::text(SOURCE, id, format!("post {id}"))
}

#[tokio::test]
async fn message_fans_out_to_every_destination() {
    let relay = start_relay(test_config(), Duration::ZERO).await;
    let rule_a = relay.handle.add_rule(SOURCE, DEST_A).await.unwrap();
    relay.handle.add_rule(SOURCE, DEST_B).await.unwrap();
    let (task, stop) = spawn(relay.supervisor);

    relay.inbound.send(post(1)).unwrap();
    relay.inbound.send(InboundMessage::text(ChatId(-1), 2, "unmonitored")).unwrap();

    let transport = relay.transport.clone();
    assert!(eventually(|| {
        let t = transport.clone();
        async move { t.sent().len() == 2 }
    })
    .await);
    assert_eq!(relay.transport.sent_to(DEST_A), 1);
    assert_eq!(relay.transport.sent_to(DEST_B), 1);

    let store = relay.store.clone();
    assert!(eventually(|| {
        let s = store.clone();
        let id = rule_a.id;
        async move { s.get_rule(id).await.unwrap().unwrap().messages_forwarded == 1 }
    })
    .await);

    let status = relay.handle.status().await;
    assert_eq!(status.pipeline.ingested, 2);
    assert_eq!(status.pipeline.forwarded, 2);
    assert_eq!(status.active_rules, 2);

    stop.send(()).unwrap();
    assert_eq!(task.await.unwrap(), ExitReason::Shutdown);
}

#[tokio::test]
async fn permission_error_disables_rule_until_reenabled() {
    let relay = start_relay(test_config(), Duration::ZERO).await;
    let rule = relay.handle.add_rule(SOURCE, DEST_A).await.unwrap();
    relay.transport.script(vec![Err(TransportError::PermissionDenied {
        scope: PermissionScope::Destination,
        chat: DEST_A,
        reason: "bot was kicked from the channel".into(),
    })]);
    let (task, stop) = spawn(relay.supervisor);

    relay.inbound.send(post(1)).unwrap();

    let handle = relay.handle.clone();
    assert!(eventually(|| {
        let h = handle.clone();
        async move { h.status().await.pipeline.rules_disabled == 1 }
    })
    .await);

    let stored = relay.store.get_rule(rule.id).await.unwrap().unwrap();
    assert!(!stored.active);
    assert!(stored.last_error.unwrap().contains("kicked"));
    assert_eq!(relay.handle.status().await.active_rules, 0);

    // Disabled rule receives nothing further.
    relay.inbound.send(post(2)).unwrap();
    let handle = relay.handle.clone();
    assert!(eventually(|| {
        let h = handle.clone();
        async move { h.status().await.pipeline.ingested == 2 }
    })
    .await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(relay.transport.sent_to(DEST_A), 1);

    let notifier = relay.notifier.clone();
    assert!(eventually(|| {
        let n = notifier.clone();
        async move { n.count_containing("disabled") == 1 }
    })
    .await);

    // Re-enabling clears the destination ban.
    let toggled = relay.handle.toggle_rule(rule.id).await.unwrap();
    assert!(toggled.active);
    relay.inbound.send(post(3)).unwrap();
    let transport = relay.transport.clone();
    assert!(eventually(|| {
        let t = transport.clone();
        async move { t.sent_to(DEST_A) == 2 }
    })
    .await);

    stop.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn flood_wait_is_retried_after_cooldown() {
    let clock = ManualClock::new();
    let relay = start_relay_with_clock(test_config(), Duration::ZERO, Arc::new(clock.clone())).await;
    relay.handle.add_rule(SOURCE, DEST_A).await.unwrap();
    relay.transport.script(vec![Err(TransportError::RateLimited {
        transport: "mock".into(),
        retry_after: Duration::from_secs(20),
    })]);
    let (task, stop) = spawn(relay.supervisor);

    relay.inbound.send(post(1)).unwrap();

    let handle = relay.handle.clone();
    assert!(eventually(|| {
        let h = handle.clone();
        async move { h.status().await.pipeline.forwarded == 1 }
    })
    .await);

    assert_eq!(relay.transport.sent_to(DEST_A), 2);
    assert!(clock.elapsed() >= Duration::from_secs(20));
    assert_eq!(relay.handle.status().await.pipeline.retried, 1);

    stop.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn unclassified_failure_is_dropped_and_recorded() {
    let relay = start_relay(test_config(), Duration::ZERO).await;
    let rule = relay.handle.add_rule(SOURCE, DEST_A).await.unwrap();
    relay
        .transport
        .script(vec![Err(TransportError::Unknown("MESSAGE_EMPTY".into()))]);
    let (task, stop) = spawn(relay.supervisor);

    relay.inbound.send(post(1)).unwrap();

    let store = relay.store.clone();
    assert!(eventually(|| {
        let s = store.clone();
        async move { s.get_rule(rule.id).await.unwrap().unwrap().error_count == 1 }
    })
    .await);

    let stored = relay.store.get_rule(rule.id).await.unwrap().unwrap();
    assert!(stored.active, "unclassified failures never disable a rule");
    assert_eq!(relay.transport.sent_to(DEST_A), 1);
    assert_eq!(relay.handle.status().await.pipeline.failed, 1);

    stop.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn full_queue_drops_and_alerts_once() {
    let mut config = test_config();
    config.queue = QueueConfig { capacity: 2 };
    config.workers.workers = 1;
    let relay = start_relay(config, Duration::from_millis(500)).await;
    relay.handle.add_rule(SOURCE, DEST_A).await.unwrap();
    let (task, stop) = spawn(relay.supervisor);

    for id in 1..=6 {
        relay.inbound.send(post(id)).unwrap();
    }

    let handle = relay.handle.clone();
    assert!(eventually(|| {
        let h = handle.clone();
        async move { h.status().await.pipeline.ingested == 6 }
    })
    .await);

    let status = relay.handle.status().await;
    assert_eq!(status.pipeline.enqueued, 2);
    assert_eq!(status.pipeline.dropped_overflow, 4);
    assert!(status.queue_len + status.in_flight <= status.queue_capacity);

    let notifier = relay.notifier.clone();
    assert!(eventually(|| {
        let n = notifier.clone();
        async move { n.count_containing("queue full") == 1 }
    })
    .await);

    stop.send(()).unwrap();
    assert_eq!(task.await.unwrap(), ExitReason::Shutdown);
    // Both accepted items were delivered during the drain.
    assert_eq!(relay.transport.sent_to(DEST_A), 2);
}

#[tokio::test]
async fn banned_destination_receives_nothing() {
    let relay = start_relay(test_config(), Duration::ZERO).await;
    relay.handle.add_rule(SOURCE, DEST_A).await.unwrap();
    relay.handle.add_rule(SOURCE, DEST_B).await.unwrap();
    relay.handle.ban_destination(DEST_B);
    let (task, stop) = spawn(relay.supervisor);

    relay.inbound.send(post(1)).unwrap();

    let transport = relay.transport.clone();
    assert!(eventually(|| {
        let t = transport.clone();
        async move { t.sent_to(DEST_A) == 1 }
    })
    .await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(relay.transport.sent_to(DEST_B), 0);
    assert_eq!(relay.handle.status().await.rate_limiter.banned, vec![DEST_B]);

    relay.handle.unban_destination(DEST_B);
    relay.inbound.send(post(2)).unwrap();
    let transport = relay.transport.clone();
    assert!(eventually(|| {
        let t = transport.clone();
        async move { t.sent_to(DEST_B) == 1 }
    })
    .await);

    stop.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn pause_all_stops_forwarding_until_resumed() {
    let relay = start_relay(test_config(), Duration::ZERO).await;
    relay.handle.add_rule(SOURCE, DEST_A).await.unwrap();
    relay.handle.add_rule(SOURCE, DEST_B).await.unwrap();
    let (task, stop) = spawn(relay.supervisor);

    assert_eq!(relay.handle.pause_all().await.unwrap(), 2);
    relay.inbound.send(post(1)).unwrap();
    let handle = relay.handle.clone();
    assert!(eventually(|| {
        let h = handle.clone();
        async move { h.status().await.pipeline.ingested == 1 }
    })
    .await);
    assert!(relay.transport.sent().is_empty());

    relay.handle.ban_destination(DEST_B);
    assert_eq!(relay.handle.resume_all().await.unwrap(), 2);
    assert!(relay.handle.status().await.rate_limiter.banned.is_empty());
    relay.inbound.send(post(2)).unwrap();
    let transport = relay.transport.clone();
    assert!(eventually(|| {
        let t = transport.clone();
        async move { t.sent().len() == 2 }
    })
    .await);

    let stats = relay.handle.rule_statistics().await.unwrap();
    assert_eq!(stats.total_rules, 2);
    assert_eq!(stats.active_rules, 2);

    stop.send(()).unwrap();
    task.await.unwrap();
}
