use crate::MessageBus;
use cadre_types::BusMessage;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Durable fallback for messages that could not be delivered in-process.
/// Implementations persist messages ordered by their original `seq`.
#[async_trait::async_trait]
pub trait PendingStore: Send + Sync {
    async fn enqueue(&self, msg: &BusMessage) -> anyhow::Result<()>;
    /// Load up to `limit` pending messages, oldest `seq` first.
    async fn load_batch(&self, limit: usize) -> anyhow::Result<Vec<PendingMessage>>;
    async fn delete(&self, id: i64) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub id: i64,
    pub message: BusMessage,
}

#[derive(Debug, Clone)]
pub struct ResilientPublisherConfig {
    pub store_timeout: Duration,
    pub recovery_interval: Duration,
    pub recovery_batch: usize,
}

impl Default for ResilientPublisherConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(5),
            recovery_interval: Duration::from_secs(5),
            recovery_batch: 100,
        }
    }
}

/// Wraps the bus with a durable pending-table fallback. While healthy,
/// publishes go straight to the bus; after a failure they are parked in the
/// pending store until the background loop drains it empty, which flips the
/// publisher healthy again.
pub struct ResilientPublisher {
    bus: Arc<MessageBus>,
    pending: Arc<dyn PendingStore>,
    healthy: AtomicBool,
    config: ResilientPublisherConfig,
}

impl ResilientPublisher {
    pub fn new(bus: Arc<MessageBus>, pending: Arc<dyn PendingStore>) -> Self {
        Self::with_config(bus, pending, ResilientPublisherConfig::default())
    }

    pub fn with_config(
        bus: Arc<MessageBus>,
        pending: Arc<dyn PendingStore>,
        config: ResilientPublisherConfig,
    ) -> Self {
        Self {
            bus,
            pending,
            healthy: AtomicBool::new(true),
            config,
        }
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub async fn publish(&self, msg: BusMessage) -> anyhow::Result<()> {
        if self.healthy() {
            let bus = self.bus.clone();
            let attempt = catch_unwind(AssertUnwindSafe(|| bus.publish(msg.clone())));
            if attempt.is_ok() {
                return Ok(());
            }
            tracing::error!(topic = %msg.topic, "in-process publish panicked, parking message");
        }

        let enqueue = self.pending.enqueue(&msg);
        tokio::time::timeout(self.config.store_timeout, enqueue)
            .await
            .map_err(|_| anyhow::anyhow!("pending store write timed out"))??;
        self.healthy.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// `PublishTo` helper: topic is `<prefix>.<id>`, no sender.
    pub async fn publish_to(
        &self,
        topic_prefix: &str,
        id: &str,
        kind: &str,
        payload: Option<Value>,
    ) -> anyhow::Result<()> {
        self.publish(Self::build(topic_prefix, id, "", kind, payload))
            .await
    }

    /// `PublishFrom` helper: same serializer as `publish_to`, with a sender.
    pub async fn publish_from(
        &self,
        topic_prefix: &str,
        id: &str,
        from: &str,
        kind: &str,
        payload: Option<Value>,
    ) -> anyhow::Result<()> {
        self.publish(Self::build(topic_prefix, id, from, kind, payload))
            .await
    }

    fn build(
        topic_prefix: &str,
        id: &str,
        from: &str,
        kind: &str,
        payload: Option<Value>,
    ) -> BusMessage {
        let topic = if id.is_empty() {
            topic_prefix.to_string()
        } else {
            format!("{topic_prefix}.{id}")
        };
        BusMessage::new(topic, kind, payload).with_from(from)
    }

    /// Background recovery loop. Each tick drains up to `recovery_batch`
    /// pending messages in `seq` order, stopping the batch on the first
    /// failure. An empty poll flips the publisher healthy.
    pub fn spawn_recovery_loop(self: &Arc<Self>, shutdown: CancellationToken) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.recovery_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                this.recover_once().await;
            }
        });
    }

    pub async fn recover_once(&self) {
        let batch = match self.pending.load_batch(self.config.recovery_batch).await {
            Ok(batch) => batch,
            Err(err) => {
                tracing::warn!(error = %err, "failed to load pending bus messages");
                return;
            }
        };

        if batch.is_empty() {
            if !self.healthy.swap(true, Ordering::Relaxed) {
                tracing::info!("bus publisher recovered, pending queue drained");
            }
            return;
        }

        for pending in batch {
            let bus = self.bus.clone();
            let msg = pending.message.clone();
            if catch_unwind(AssertUnwindSafe(|| bus.publish(msg))).is_err() {
                tracing::warn!(id = pending.id, "republish failed, stopping batch");
                break;
            }
            if let Err(err) = self.pending.delete(pending.id).await {
                tracing::warn!(id = pending.id, error = %err, "failed to delete republished message");
                break;
            }
        }
    }
}
