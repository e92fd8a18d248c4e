//! Ingestion handler: turns inbound messages into delivery items.
//!
//! Enqueueing never blocks: when the queue is full the item is dropped and
//! the operator is alerted once per overflow episode. An episode ends at the
//! next successful enqueue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::error::{IngestError, QueueError};
use crate::notify::OperatorAlerts;
use crate::pipeline::queue::{DeliveryItem, ForwardQueue};
use crate::pipeline::stats::PipelineStats;
use crate::rules::TaskCache;
use crate::transport::{InboundMessage, MessageStream};

pub struct IngestHandler {
    cache: Arc<TaskCache>,
    queue: Arc<ForwardQueue>,
    alerts: OperatorAlerts,
    stats: Arc<PipelineStats>,
    paused: AtomicBool,
    stopped: AtomicBool,
    overflowing: AtomicBool,
}

impl IngestHandler {
    pub fn new(
        cache: Arc<TaskCache>,
        queue: Arc<ForwardQueue>,
        alerts: OperatorAlerts,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            cache,
            queue,
            alerts,
            stats,
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            overflowing: AtomicBool::new(false),
        }
    }

    /// Enqueue one delivery item per active rule for the message's source.
    /// Returns how many were enqueued.
    pub async fn handle(&self, message: InboundMessage) -> Result<usize, IngestError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(IngestError::Stopped);
        }
        if self.paused.load(Ordering::Acquire) {
            self.stats.inc_rejected();
            return Err(IngestError::Paused);
        }

        self.stats.inc_ingested();

        let rules = self.cache.lookup(message.source).await;
        if rules.is_empty() {
            return Ok(0);
        }

        let message = Arc::new(message);
        let mut enqueued = 0;

        for rule in rules {
            let rule_id = rule.id;
            match self.queue.try_push(DeliveryItem::new(message.clone(), rule)) {
                Ok(()) => {
                    enqueued += 1;
                    self.stats.inc_enqueued();
                    if self.overflowing.swap(false, Ordering::AcqRel) {
                        info!("Forwarding queue accepting items again");
                    }
                }
                Err(QueueError::Full { capacity }) => {
                    self.stats.inc_dropped_overflow();
                    warn!(
                        rule_id,
                        source = %message.source,
                        message_id = message.message_id,
                        capacity,
                        "Forwarding queue full, dropping item"
                    );
                    if !self.overflowing.swap(true, Ordering::AcqRel) {
                        self.alerts.queue_overflow(capacity);
                    }
                }
                Err(QueueError::Closed) => return Err(IngestError::Stopped),
            }
        }

        debug!(
            source = %message.source,
            message_id = message.message_id,
            kind = message.content.kind(),
            enqueued,
            "Message ingested"
        );
        Ok(enqueued)
    }

    /// Consume `stream` until it ends or ingestion is stopped.
    pub async fn run(&self, mut stream: MessageStream) {
        while let Some(message) = stream.next().await {
            match self.handle(message).await {
                Ok(_) => {}
                Err(IngestError::Paused) => {
                    debug!("Ingestion paused, message rejected");
                }
                Err(IngestError::Stopped) => {
                    info!("Ingestion stopped");
                    return;
                }
            }
        }
        info!("Inbound message stream ended");
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::AcqRel) {
            info!("Ingestion paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::AcqRel) {
            info!("Ingestion resumed");
        }
    }

    /// Permanently refuse new messages.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::error::TransportError;
    use crate::notify::Notifier;
    use crate::store::LibSqlTaskStore;
    use crate::transport::ChatId;

    const SRC: ChatId = ChatId(-1001);

    struct ChannelNotifier(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl Notifier for ChannelNotifier {
        async fn notify(&self, text: &str) -> Result<(), TransportError> {
            let _ = self.0.send(text.to_string());
            Ok(())
        }
    }

    async fn handler(
        capacity: usize,
        destinations: &[i64],
    ) -> (IngestHandler, Arc<ForwardQueue>, mpsc::UnboundedReceiver<String>) {
        let store = Arc::new(LibSqlTaskStore::new_memory().await.unwrap());
        let cache = Arc::new(TaskCache::new(store));
        for &d in destinations {
            cache.add(SRC, ChatId(d)).await.unwrap();
        }
        let queue = Arc::new(ForwardQueue::new(capacity));
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = IngestHandler::new(
            cache,
            queue.clone(),
            OperatorAlerts::new(Arc::new(ChannelNotifier(tx))),
            Arc::new(PipelineStats::new()),
        );
        (handler, queue, rx)
    }

    fn msg(id: i64) -> InboundMessage {
        InboundMessage::text(SRC, id, "news")
    }

    #[tokio::test]
    async fn fans_out_to_every_rule() {
        let (h, queue, _rx) = handler(10, &[-2001, -2002, -2003]).await;
        assert_eq!(h.handle(msg(1)).await.unwrap(), 3);
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn unknown_source_enqueues_nothing() {
        let (h, queue, _rx) = handler(10, &[-2001]).await;
        let other = InboundMessage::text(ChatId(-9), 1, "x");
        assert_eq!(h.handle(other).await.unwrap(), 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn overflow_drops_and_alerts_once_per_episode() {
        let (h, queue, mut rx) = handler(2, &[-2001]).await;
        h.handle(msg(1)).await.unwrap();
        h.handle(msg(2)).await.unwrap();
        assert_eq!(h.handle(msg(3)).await.unwrap(), 0);
        assert_eq!(h.handle(msg(4)).await.unwrap(), 0);
        assert_eq!(queue.len(), 2);
        assert_eq!(h.stats.snapshot().dropped_overflow, 2);

        let alert = rx.recv().await.unwrap();
        assert!(alert.contains("queue full"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        // Free a slot, end the episode, then overflow again.
        drop(queue.pop_timeout(Duration::from_millis(20)).await.unwrap());
        assert_eq!(h.handle(msg(5)).await.unwrap(), 1);
        assert_eq!(h.handle(msg(6)).await.unwrap(), 0);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn paused_and_stopped_reject() {
        let (h, queue, _rx) = handler(10, &[-2001]).await;

        h.pause();
        assert_eq!(h.handle(msg(1)).await.unwrap_err(), IngestError::Paused);
        h.resume();
        assert_eq!(h.handle(msg(2)).await.unwrap(), 1);

        h.stop();
        assert_eq!(h.handle(msg(3)).await.unwrap_err(), IngestError::Stopped);
        assert_eq!(queue.len(), 1);
        assert_eq!(h.stats.snapshot().rejected, 1);
    }

    #[tokio::test]
    async fn run_consumes_stream() {
        let (h, queue, _rx) = handler(10, &[-2001]).await;
        let stream = futures::stream::iter(vec![msg(1), msg(2), msg(3)]);
        h.run(Box::pin(stream)).await;
        assert_eq!(queue.len(), 3);
        assert_eq!(h.stats.snapshot().ingested, 3);
    }
}
