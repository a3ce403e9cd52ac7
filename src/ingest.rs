//! Streaming ingestion: decode, route and store each broker message

use std::future::Future;

use tracing::{debug, error, info, warn};

use crate::{
    database::{StoredRecord, TypedSink, TypedTable},
    errors::LakeError,
    models::Message,
    mqtt::{Delivery, MqttClient},
    router::{Route, Router},
};

/// Result of processing one message
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Stored {
        table: TypedTable,
        record: StoredRecord,
    },
    Unrouted,
}

/// Counters over the lifetime of an ingester run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub received: u64,
    pub stored: u64,
    pub unrouted: u64,
    pub dropped: u64,
}

impl IngestStats {
    fn record(&mut self, result: &Result<Outcome, LakeError>) {
        self.received += 1;
        match result {
            Ok(Outcome::Stored { .. }) => self.stored += 1,
            Ok(Outcome::Unrouted) => self.unrouted += 1,
            Err(_) => self.dropped += 1,
        }
    }
}

/// Validates broker messages and appends them to the typed tables.
///
/// Messages are handled strictly one at a time in delivery order. A failed
/// message is logged and dropped; it never stops the stream.
pub struct StreamIngester<S> {
    router: Router,
    sink: S,
}

impl<S: TypedSink> StreamIngester<S> {
    pub fn new(router: Router, sink: S) -> Self {
        Self { router, sink }
    }

    /// Decode, route and store a single message
    pub async fn process_message(&self, message: &Message) -> Result<Outcome, LakeError> {
        let payload = Router::decode(&message.payload)?;

        match self.router.route(&message.channel, payload)? {
            Route::Unrouted { channel, payload } => {
                debug!(channel = %channel, payload = %payload, "Message on unrouted channel");
                Ok(Outcome::Unrouted)
            }
            Route::Typed(record) => {
                let table = TypedTable::for_value(&record.value);
                let stored = self.sink.insert_typed(&record).await?;
                debug!(
                    channel = %record.channel,
                    table = %table,
                    id = stored.id,
                    value = %record.value,
                    "Stored message"
                );
                Ok(Outcome::Stored {
                    table,
                    record: stored,
                })
            }
        }
    }

    /// Process a message, logging instead of returning any failure
    pub async fn handle(&self, message: &Message, stats: &mut IngestStats) {
        let result = self.process_message(message).await;
        stats.record(&result);

        if let Err(e) = result {
            log_dropped(&message.channel, &e);
        }
    }

    /// Handle a broker delivery, then acknowledge it.
    ///
    /// Stored and deliberately dropped messages are both acknowledged; a
    /// crash before this point leaves the message with the broker.
    async fn deliver(&self, client: &MqttClient, delivery: Delivery, stats: &mut IngestStats) {
        self.handle(&delivery.message, stats).await;

        if let Err(e) = client.ack(&delivery).await {
            warn!(channel = %delivery.message.channel, error = %e, "Could not acknowledge message");
        }
    }

    /// Consume messages until the broker stream ends or `shutdown` resolves,
    /// then disconnect from the broker.
    ///
    /// Messages already queued when `shutdown` resolves are handled before
    /// disconnecting.
    pub async fn run<F>(&self, mut client: MqttClient, shutdown: F) -> Result<IngestStats, LakeError>
    where
        F: Future<Output = ()>,
    {
        let mut stats = IngestStats::default();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Received shutdown signal");
                    break;
                }
                delivery = client.recv() => match delivery {
                    Some(delivery) => self.deliver(&client, delivery, &mut stats).await,
                    None => {
                        warn!(state = ?client.state(), "MQTT event loop stopped");
                        break;
                    }
                }
            }
        }

        while let Some(delivery) = client.try_recv() {
            self.deliver(&client, delivery, &mut stats).await;
        }

        info!(
            received = stats.received,
            stored = stats.stored,
            unrouted = stats.unrouted,
            dropped = stats.dropped,
            state = ?client.state(),
            "Ingester stopped"
        );
        client.disconnect().await?;

        Ok(stats)
    }
}

fn log_dropped(channel: &str, error: &LakeError) {
    match error {
        LakeError::DecodeError(_) | LakeError::ValidationError(_) => {
            warn!(channel = %channel, error = %error, "Dropping message");
        }
        LakeError::PersistenceError(e) => {
            error!(channel = %channel, error = %e, "Failed to store message, dropping it");
        }
        other => {
            error!(channel = %channel, error = %other, "Failed to process message");
        }
    }
}
