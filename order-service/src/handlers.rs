use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::Message;
use shared::OrderMessage;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::{DecodeError, IngestError};
use crate::models::OrderAggregate;
use crate::store::{OrderStore, WriteOutcome};

/// Connection settings for the orders topic.
///
/// `group_id` is the durable subscription name: the broker keeps the last
/// committed offset per group, so a restarted consumer resumes after the
/// last message that was fully handled.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub brokers: String,
    pub group_id: String,
    pub client_id: String,
    pub topic: String,
}

impl ConsumerConfig {
    pub fn create_consumer(&self) -> Result<StreamConsumer, IngestError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &self.group_id)
            .set("client.id", &self.client_id)
            .set("bootstrap.servers", &self.brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;

        consumer.subscribe(&[self.topic.as_str()])?;
        Ok(consumer)
    }
}

/// Exponential delay between consumer sessions.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Delay before restart number `attempt` (1-based). Attempt 0 restarts immediately.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// What to do with a message once it has been handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Commit the offset: the message is stored or can never be stored.
    Commit,
    /// Leave the offset alone so the broker delivers the message again.
    Redeliver { order_uid: String, reason: String },
}

/// Decodes an ingestion payload into an aggregate ready to persist.
pub fn decode(payload: Option<&[u8]>) -> Result<OrderAggregate, DecodeError> {
    let payload = match payload {
        Some(bytes) if !bytes.is_empty() => bytes,
        _ => return Err(DecodeError::EmptyPayload),
    };

    let message = OrderMessage::from_slice(payload)?;
    OrderAggregate::try_from(message)
}

pub struct OrderIngestor {
    store: Arc<dyn OrderStore>,
    backoff: Backoff,
}

impl OrderIngestor {
    pub fn new(store: Arc<dyn OrderStore>) -> Self {
        Self {
            store,
            backoff: Backoff::default(),
        }
    }

    /// Decodes and persists one payload.
    ///
    /// Only transient store failures ask for redelivery. Decode failures and
    /// every other store error are dropped, since the same message would
    /// fail the same way again.
    pub async fn handle_payload(&self, payload: Option<&[u8]>) -> Disposition {
        let aggregate = match decode(payload) {
            Ok(aggregate) => aggregate,
            Err(e) => {
                error!("Dropping undecodable order message: {}", e);
                return Disposition::Commit;
            }
        };

        match self.store.write_aggregate(&aggregate).await {
            Ok(WriteOutcome::Inserted) => {
                info!(
                    "Order {} persisted with {} items",
                    aggregate.order_uid(),
                    aggregate.items.len()
                );
                Disposition::Commit
            }
            Ok(WriteOutcome::Duplicate) => {
                info!("Order {} was already persisted", aggregate.order_uid());
                Disposition::Commit
            }
            Err(e) if e.is_transient() => {
                warn!("Failed to persist order {}: {}", aggregate.order_uid(), e);
                Disposition::Redeliver {
                    order_uid: aggregate.order_uid().to_string(),
                    reason: e.to_string(),
                }
            }
            Err(e) => {
                error!("Dropping order {}: {}", aggregate.order_uid(), e);
                Disposition::Commit
            }
        }
    }

    /// Consumes messages until one has to be redelivered or the stream ends.
    ///
    /// A message's offset is committed only after it has been handled, so
    /// returning early leaves it for the next session.
    pub async fn run(&self, consumer: &StreamConsumer) -> IngestError {
        let mut message_stream = consumer.stream();

        while let Some(message) = message_stream.next().await {
            let m = match message {
                Ok(m) => m,
                Err(e) => {
                    error!("Error receiving message: {}", e);
                    continue;
                }
            };

            match self.handle_payload(m.payload()).await {
                Disposition::Commit => {
                    if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                        error!("Error committing message: {}", e);
                    }
                }
                Disposition::Redeliver { order_uid, reason } => {
                    return IngestError::Redeliver { order_uid, reason };
                }
            }
        }

        IngestError::StreamClosed
    }

    /// Keeps a consumer session alive for the lifetime of the process.
    ///
    /// Every time a session ends the consumer is dropped and recreated after
    /// a backoff delay, so uncommitted messages are delivered again. The
    /// backoff resets once a session has outlived the maximum delay.
    pub async fn supervise(&self, config: &ConsumerConfig) {
        let mut attempt = 0u32;

        loop {
            let started = Instant::now();

            let ended = match config.create_consumer() {
                Ok(consumer) => {
                    info!("Subscribed to {} as {}", config.topic, config.group_id);
                    self.run(&consumer).await
                }
                Err(e) => e,
            };

            if started.elapsed() > self.backoff.max_delay {
                attempt = 0;
            }
            attempt = attempt.saturating_add(1);

            let delay = self.backoff.delay_for_attempt(attempt);
            warn!("Consumer session ended ({}), restarting in {:?}", ended, delay);
            tokio::time::sleep(delay).await;
        }
    }
}
