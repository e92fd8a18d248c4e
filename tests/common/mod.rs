//! Shared fixtures for the integration tests: a scripted in-process
//! transport, a recording notifier, a settable resource probe and a relay
//! builder backed by an in-memory store.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use chat_relay::clock::{Clock, SystemClock};
use chat_relay::config::{RelayConfig, TelegramConfig};
use chat_relay::error::TransportError;
use chat_relay::monitor::{MonitorConfig, ResourceProbe, ResourceSample};
use chat_relay::notify::{Notifier, OperatorAlerts};
use chat_relay::pipeline::WorkerConfig;
use chat_relay::rules::TaskCache;
use chat_relay::store::LibSqlTaskStore;
use chat_relay::supervisor::{ExitReason, RelayHandle, RelayParts, Supervisor};
use chat_relay::transport::{ChatId, InboundMessage, MessageStream, Transport};

/// Upper bound for any single wait in a test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

// ── Transport ───────────────────────────────────────────────────────────

/// In-process transport. Inbound messages come from an unbounded channel;
/// sends replay scripted results, then succeed.
pub struct MockTransport {
    inbound: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    script: Mutex<VecDeque<Result<(), TransportError>>>,
    sent: Mutex<Vec<(ChatId, i64)>>,
    send_delay: Duration,
    fail_subscribe: bool,
}

impl MockTransport {
    pub fn new(send_delay: Duration) -> (Arc<Self>, mpsc::UnboundedSender<InboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            inbound: Mutex::new(Some(rx)),
            script: Mutex::default(),
            sent: Mutex::default(),
            send_delay,
            fail_subscribe: false,
        };
        (Arc::new(transport), tx)
    }

    /// A transport whose `subscribe` always fails.
    pub fn unreachable() -> Arc<Self> {
        Arc::new(Self {
            inbound: Mutex::new(None),
            script: Mutex::default(),
            sent: Mutex::default(),
            send_delay: Duration::ZERO,
            fail_subscribe: true,
        })
    }

    pub fn script(&self, results: Vec<Result<(), TransportError>>) {
        self.script.lock().unwrap().extend(results);
    }

    /// `(destination, message_id)` of every send attempt, in order.
    pub fn sent(&self) -> Vec<(ChatId, i64)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, destination: ChatId) -> usize {
        self.sent().iter().filter(|(d, _)| *d == destination).count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn subscribe(&self) -> Result<MessageStream, TransportError> {
        if self.fail_subscribe {
            return Err(TransportError::Down {
                transport: "mock".into(),
                reason: "session revoked".into(),
            });
        }
        let rx = self.inbound.lock().unwrap().take().ok_or_else(|| {
            TransportError::Unknown("already subscribed".into())
        })?;
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn send(
        &self,
        destination: ChatId,
        message: &InboundMessage,
        sent_parts: &mut usize,
    ) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push((destination, message.message_id));
        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))?;
        *sent_parts += 1;
        Ok(())
    }

    async fn send_text(&self, _chat: ChatId, _text: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

// ── Notifier ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn alerts(&self) -> Vec<String> {
        self.alerts.lock().unwrap().clone()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.alerts().iter().filter(|a| a.contains(needle)).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, text: &str) -> Result<(), TransportError> {
        self.alerts.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

// ── Resource probe ──────────────────────────────────────────────────────

/// Probe whose reading the test sets directly.
#[derive(Clone)]
pub struct TestProbe(Arc<Mutex<(f64, f64)>>);

impl TestProbe {
    pub fn new(memory_mb: f64, cpu_percent: f64) -> Self {
        Self(Arc::new(Mutex::new((memory_mb, cpu_percent))))
    }

    pub fn set_memory(&self, memory_mb: f64) {
        self.0.lock().unwrap().0 = memory_mb;
    }
}

impl ResourceProbe for TestProbe {
    fn sample(&self) -> Option<ResourceSample> {
        let (memory_mb, cpu_percent) = *self.0.lock().unwrap();
        Some(ResourceSample::new(memory_mb, cpu_percent))
    }
}

// ── Relay ───────────────────────────────────────────────────────────────

/// Config with short timings so tests finish quickly.
pub fn test_config() -> RelayConfig {
    RelayConfig {
        telegram: TelegramConfig {
            bot_token: SecretString::from("test-token"),
            ..TelegramConfig::default()
        },
        workers: WorkerConfig {
            workers: 2,
            dequeue_timeout: Duration::from_millis(20),
            requeue_delay: Duration::from_millis(10),
            shutdown_timeout: Duration::from_millis(500),
        },
        monitor: MonitorConfig {
            interval: Duration::from_millis(50),
            warning_cooldown: Duration::from_millis(200),
            ..MonitorConfig::default()
        },
        drain_timeout: Duration::from_secs(2),
        ..RelayConfig::default()
    }
}

pub struct TestRelay {
    pub supervisor: Supervisor,
    pub handle: RelayHandle,
    pub transport: Arc<MockTransport>,
    pub inbound: mpsc::UnboundedSender<InboundMessage>,
    pub notifier: Arc<RecordingNotifier>,
    pub probe: TestProbe,
    pub store: Arc<LibSqlTaskStore>,
}

pub async fn start_relay(config: RelayConfig, send_delay: Duration) -> TestRelay {
    start_relay_with_clock(config, send_delay, Arc::new(SystemClock)).await
}

pub async fn start_relay_with_clock(
    config: RelayConfig,
    send_delay: Duration,
    clock: Arc<dyn Clock>,
) -> TestRelay {
    let (transport, inbound) = MockTransport::new(send_delay);
    let store = Arc::new(LibSqlTaskStore::new_memory().await.unwrap());
    let cache = Arc::new(TaskCache::new(store.clone()));
    cache.reload().await.unwrap();
    let notifier = Arc::new(RecordingNotifier::default());
    let probe = TestProbe::new(100.0, 5.0);

    let supervisor = Supervisor::start(
        &config,
        RelayParts {
            store: store.clone(),
            transport: transport.clone(),
            cache,
            alerts: OperatorAlerts::new(notifier.clone()),
            probe: Box::new(probe.clone()),
            clock,
        },
    )
    .await;
    let handle = supervisor.handle();

    TestRelay {
        supervisor,
        handle,
        transport,
        inbound,
        notifier,
        probe,
        store,
    }
}

/// Run the supervisor in the background. Sending on the returned channel
/// (or dropping it) requests shutdown.
pub fn spawn(supervisor: Supervisor) -> (JoinHandle<ExitReason>, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(supervisor.run(async move {
        let _ = rx.await;
    }));
    (task, tx)
}

/// Poll `check` until it holds or `TEST_TIMEOUT` elapses.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
