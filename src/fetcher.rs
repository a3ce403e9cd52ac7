//! Incremental batch fetch of sensor measurements into `fact_measurements`

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};

use crate::{
    config::SensorMapping,
    database::MeasurementStore,
    errors::{ApiError, LakeError},
    models::Measurement,
    openaq::{ApiMeasurement, MeasurementSource},
    watermark::WatermarkTracker,
};

/// Totals of one fetch run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub pairs_attempted: usize,
    pub pairs_failed: usize,
    pub fetched: usize,
    pub inserted: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PairOutcome {
    fetched: usize,
    inserted: u64,
}

#[derive(Debug)]
enum PairError {
    Upstream(ApiError),
    /// Store or watermark failure, ends the run
    Fatal(LakeError),
}

/// Lazy cursor over the pages of one sensor's measurements.
///
/// Ends on an empty page or on a page shorter than the page size. An error
/// is yielded once and ends the cursor.
pub struct Pages<'a, A> {
    source: &'a A,
    sensor_id: i64,
    from: DateTime<Utc>,
    page: u32,
    done: bool,
}

impl<'a, A: MeasurementSource> Pages<'a, A> {
    pub fn new(source: &'a A, sensor_id: i64, from: DateTime<Utc>) -> Self {
        Self {
            source,
            sensor_id,
            from,
            page: 1,
            done: false,
        }
    }

    pub async fn next_page(&mut self) -> Option<Result<Vec<ApiMeasurement>, ApiError>> {
        if self.done {
            return None;
        }

        let result = self
            .source
            .fetch_page(self.sensor_id, self.from, self.page)
            .await;

        match &result {
            Ok(records) if records.is_empty() => {
                self.done = true;
                return None;
            }
            Ok(records) => {
                if records.len() < self.source.page_size() as usize {
                    self.done = true;
                }
                self.page += 1;
            }
            Err(_) => self.done = true,
        }

        Some(result)
    }
}

/// Turn API records into rows for the given pair, dropping null values
pub fn to_measurements(sensor: &SensorMapping, records: &[ApiMeasurement]) -> Vec<Measurement> {
    records
        .iter()
        .filter_map(|r| {
            r.value.map(|value| Measurement {
                entity_id: sensor.entity_id,
                metric_id: sensor.metric_id,
                value,
                timestamp_utc: r.period_start,
            })
        })
        .collect()
}

/// Pulls new measurements for every configured sensor, one pair at a time
pub struct BatchFetcher<S, A> {
    watermark: WatermarkTracker<S>,
    source: A,
    sensors: Vec<SensorMapping>,
}

impl<S: MeasurementStore, A: MeasurementSource> BatchFetcher<S, A> {
    pub fn new(store: S, source: A, sensors: Vec<SensorMapping>, lookback: Duration) -> Self {
        Self {
            watermark: WatermarkTracker::new(store, lookback),
            source,
            sensors,
        }
    }

    /// Run one pass over all sensors
    pub async fn run(&self) -> Result<FetchSummary, LakeError> {
        self.run_at(Utc::now()).await
    }

    /// Run one pass with `now` as the reference for the default lookback.
    ///
    /// Upstream failures skip the pair; a persistence failure aborts the run.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<FetchSummary, LakeError> {
        let mut summary = FetchSummary::default();

        for sensor in &self.sensors {
            summary.pairs_attempted += 1;

            match self.fetch_pair(sensor, now).await {
                Ok(outcome) => {
                    info!(
                        sensor_id = sensor.sensor_id,
                        entity_id = sensor.entity_id,
                        metric_id = sensor.metric_id,
                        fetched = outcome.fetched,
                        inserted = outcome.inserted,
                        "Fetched measurements"
                    );
                    summary.fetched += outcome.fetched;
                    summary.inserted += outcome.inserted;
                }
                Err(PairError::Upstream(e)) => {
                    warn!(
                        sensor_id = sensor.sensor_id,
                        entity_id = sensor.entity_id,
                        metric_id = sensor.metric_id,
                        error = %e,
                        "Skipping sensor after upstream API failure"
                    );
                    summary.pairs_failed += 1;
                }
                Err(PairError::Fatal(e)) => {
                    error!(
                        sensor_id = sensor.sensor_id,
                        entity_id = sensor.entity_id,
                        metric_id = sensor.metric_id,
                        error = %e,
                        "Aborting fetch run"
                    );
                    return Err(e);
                }
            }
        }

        Ok(summary)
    }

    async fn fetch_pair(
        &self,
        sensor: &SensorMapping,
        now: DateTime<Utc>,
    ) -> Result<PairOutcome, PairError> {
        let from = self
            .watermark
            .fetch_from(sensor.entity_id, sensor.metric_id, now)
            .await
            .map_err(PairError::Fatal)?;

        let mut outcome = PairOutcome::default();
        let mut pages = Pages::new(&self.source, sensor.sensor_id, from);

        while let Some(page) = pages.next_page().await {
            let records = page.map_err(PairError::Upstream)?;
            let batch = to_measurements(sensor, &records);

            outcome.fetched += batch.len();
            outcome.inserted += self
                .watermark
                .store()
                .insert_measurements(&batch)
                .await
                .map_err(|e| PairError::Fatal(e.into()))?;
        }

        Ok(outcome)
    }
}
