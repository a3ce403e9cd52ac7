//! High-water mark for incremental measurement fetches

use chrono::{DateTime, Duration, Utc};

use crate::{database::MeasurementStore, errors::LakeError};

/// Default window requested for a pair with no stored data
pub const DEFAULT_LOOKBACK_DAYS: i64 = 7;

/// Distance past the latest stored timestamp where the next fetch starts
pub fn watermark_step() -> Duration {
    Duration::seconds(1)
}

/// First timestamp to request given the latest stored one, `None` if it
/// falls outside the representable range
pub fn fetch_from(
    latest: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    lookback: Duration,
) -> Option<DateTime<Utc>> {
    match latest {
        Some(latest) => latest.checked_add_signed(watermark_step()),
        None => now.checked_sub_signed(lookback),
    }
}

/// Reads the watermark of a pair from the measurement store
#[derive(Debug, Clone)]
pub struct WatermarkTracker<S> {
    store: S,
    lookback: Duration,
}

impl<S: MeasurementStore> WatermarkTracker<S> {
    pub fn new(store: S, lookback: Duration) -> Self {
        Self { store, lookback }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Latest persisted timestamp, queried fresh on every call
    pub async fn latest_timestamp(
        &self,
        entity_id: i64,
        metric_id: i64,
    ) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
        self.store.latest_timestamp(entity_id, metric_id).await
    }

    /// Where the next fetch for the pair should start
    pub async fn fetch_from(
        &self,
        entity_id: i64,
        metric_id: i64,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, LakeError> {
        let latest = self.latest_timestamp(entity_id, metric_id).await?;
        fetch_from(latest, now, self.lookback).ok_or_else(|| LakeError::ConfigurationError {
            message: format!(
                "Fetch start for entity {} metric {} is out of range (lookback {} days)",
                entity_id,
                metric_id,
                self.lookback.num_days()
            ),
        })
    }
}
