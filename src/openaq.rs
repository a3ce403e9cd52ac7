//! Client for the OpenAQ v3 sensor measurements endpoint

use std::future::Future;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::{config::FetcherConfig, errors::ApiError};

/// A paginated source of sensor measurements
pub trait MeasurementSource {
    /// Maximum number of records in one page
    fn page_size(&self) -> u32;

    /// Fetch one page (1-based) of measurements at or after `from`
    fn fetch_page(
        &self,
        sensor_id: i64,
        from: DateTime<Utc>,
        page: u32,
    ) -> impl Future<Output = Result<Vec<ApiMeasurement>, ApiError>> + Send;
}

/// One record of the measurements list
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiMeasurement {
    /// Measured value, `None` when the upstream reports null
    pub value: Option<f64>,
    /// Start of the averaging window the value covers
    #[serde(rename = "period", deserialize_with = "serde_helpers::deserialize_period_start")]
    pub period_start: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct MeasurementsResponse {
    #[serde(default)]
    results: Vec<ApiMeasurement>,
}

/// HTTP client for the measurement API
#[derive(Debug, Clone)]
pub struct OpenAqClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    page_size: u32,
}

impl OpenAqClient {
    pub fn new(config: &FetcherConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            page_size: config.page_size,
        }
    }

    fn measurements_url(&self, sensor_id: i64) -> String {
        format!("{}/v3/sensors/{}/measurements", self.base_url, sensor_id)
    }

    fn query_params(&self, from: DateTime<Utc>, page: u32) -> [(&'static str, String); 3] {
        [
            (
                "datetime_from",
                from.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            ("limit", self.page_size.to_string()),
            ("page", page.to_string()),
        ]
    }

    /// Parse a measurements response body
    pub fn parse_page(body: &str) -> Result<Vec<ApiMeasurement>, ApiError> {
        let response: MeasurementsResponse = serde_json::from_str(body)?;
        Ok(response.results)
    }
}

impl MeasurementSource for OpenAqClient {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    async fn fetch_page(
        &self,
        sensor_id: i64,
        from: DateTime<Utc>,
        page: u32,
    ) -> Result<Vec<ApiMeasurement>, ApiError> {
        let url = self.measurements_url(sensor_id);
        debug!(sensor_id, page, from = %from, "Requesting measurements page");

        let mut request = self
            .client
            .get(&url)
            .query(&self.query_params(from, page));
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(ApiError::Status { status, body });
        }

        Self::parse_page(&body)
    }
}

mod serde_helpers {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    struct Period {
        #[serde(rename = "datetimeFrom")]
        datetime_from: Instant,
    }

    #[derive(Deserialize)]
    struct Instant {
        utc: DateTime<Utc>,
    }

    /// Pull `period.datetimeFrom.utc` out of a measurement record
    pub fn deserialize_period_start<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let period = Period::deserialize(deserializer)?;
        Ok(period.datetime_from.utc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn client() -> OpenAqClient {
        OpenAqClient::new(&FetcherConfig {
            base_url: "https://api.openaq.org/".to_string(),
            page_size: 1000,
            ..FetcherConfig::default()
        })
    }

    #[test]
    fn builds_measurements_url() {
        assert_eq!(
            client().measurements_url(3917),
            "https://api.openaq.org/v3/sensors/3917/measurements"
        );
    }

    #[test]
    fn builds_query_params() {
        let from = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 1).unwrap();
        let params = client().query_params(from, 2);

        assert_eq!(
            params,
            [
                ("datetime_from", "2025-03-01T12:00:01Z".to_string()),
                ("limit", "1000".to_string()),
                ("page", "2".to_string()),
            ]
        );
    }

    #[test]
    fn parse_measurements_page() {
        let body = r#"{
            "meta": {"name": "openaq-api", "page": 1, "limit": 1000, "found": 2},
            "results": [
                {
                    "value": 12.4,
                    "parameter": {"id": 2, "name": "pm25", "units": "µg/m³"},
                    "period": {
                        "label": "raw",
                        "interval": "01:00:00",
                        "datetimeFrom": {"utc": "2025-03-01T10:00:00Z", "local": "2025-03-01T04:00:00-06:00"},
                        "datetimeTo": {"utc": "2025-03-01T11:00:00Z", "local": "2025-03-01T05:00:00-06:00"}
                    }
                },
                {
                    "value": null,
                    "period": {
                        "datetimeFrom": {"utc": "2025-03-01T11:00:00Z"}
                    }
                }
            ]
        }"#;

        let page = OpenAqClient::parse_page(body).unwrap();

        assert_eq!(
            page,
            vec![
                ApiMeasurement {
                    value: Some(12.4),
                    period_start: Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap(),
                },
                ApiMeasurement {
                    value: None,
                    period_start: Utc.with_ymd_and_hms(2025, 3, 1, 11, 0, 0).unwrap(),
                },
            ]
        );
    }

    #[test]
    fn parse_empty_page() {
        let page = OpenAqClient::parse_page(r#"{"meta": {"found": 0}, "results": []}"#).unwrap();
        assert!(page.is_empty());
    }

    #[test]
    fn parse_malformed_page() {
        assert!(matches!(
            OpenAqClient::parse_page(r#"{"results": [{"value": 1.0}]}"#),
            Err(ApiError::Malformed(_))
        ));
        assert!(matches!(
            OpenAqClient::parse_page("<html>Bad gateway</html>"),
            Err(ApiError::Malformed(_))
        ));
    }
}
