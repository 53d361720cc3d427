//! External metric store (TSDB) seam.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::Variant;

/// A point-in-time view of per-metric ingest cost.
#[derive(Debug, Clone, Serialize)]
pub struct CostFlowSnapshot {
    pub total_cost_per_minute: f64,
    pub by_metric: BTreeMap<String, f64>,
    pub generated_at: DateTime<Utc>,
}

/// Read access to the external TSDB the collect tasks push into.
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Sample values for one metric/variant of an experiment inside the
    /// collection window.
    async fn fetch_samples(
        &self,
        experiment_id: Uuid,
        metric: &str,
        variant: Variant,
        window: (DateTime<Utc>, DateTime<Utc>),
    ) -> Result<Vec<f64>, EngineError>;

    /// Current per-metric cost snapshot for the cost-flow API.
    async fn cost_flow(&self) -> Result<CostFlowSnapshot, EngineError>;
}

/// Metric source used when no TSDB is configured: every query is empty, so
/// analyses report insufficient data instead of failing.
pub struct NullMetricSource;

#[async_trait]
impl MetricSource for NullMetricSource {
    async fn fetch_samples(
        &self,
        _experiment_id: Uuid,
        _metric: &str,
        _variant: Variant,
        _window: (DateTime<Utc>, DateTime<Utc>),
    ) -> Result<Vec<f64>, EngineError> {
        Ok(Vec::new())
    }

    async fn cost_flow(&self) -> Result<CostFlowSnapshot, EngineError> {
        Ok(CostFlowSnapshot {
            total_cost_per_minute: 0.0,
            by_metric: BTreeMap::new(),
            generated_at: Utc::now(),
        })
    }
}

/// Prometheus-compatible metric source.
///
/// `fetch_samples` runs a range query filtered by the labels the collect
/// tasks attach (`experiment_id`, `variant`); `cost_flow` reads the
/// `phoenix_cost_per_minute` gauge grouped by metric name.
pub struct PrometheusSource {
    client: reqwest::Client,
    base_url: String,
}

impl PrometheusSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn get_json(&self, path: &str, params: &[(&str, String)]) -> Result<PromResponse, EngineError> {
        let url = format!("{}{path}", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(|e| EngineError::MetricSource(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EngineError::MetricSource(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| EngineError::MetricSource(e.to_string()))
    }
}

#[async_trait]
impl MetricSource for PrometheusSource {
    async fn fetch_samples(
        &self,
        experiment_id: Uuid,
        metric: &str,
        variant: Variant,
        window: (DateTime<Utc>, DateTime<Utc>),
    ) -> Result<Vec<f64>, EngineError> {
        let query = format!(
            "{metric}{{experiment_id=\"{experiment_id}\",variant=\"{variant}\"}}"
        );
        let response = self
            .get_json(
                "/api/v1/query_range",
                &[
                    ("query", query),
                    ("start", window.0.timestamp().to_string()),
                    ("end", window.1.timestamp().to_string()),
                    ("step", "10".to_string()),
                ],
            )
            .await?;
        Ok(flatten_range_values(&response))
    }

    async fn cost_flow(&self) -> Result<CostFlowSnapshot, EngineError> {
        let response = self
            .get_json(
                "/api/v1/query",
                &[(
                    "query",
                    "sum by (metric) (phoenix_cost_per_minute)".to_string(),
                )],
            )
            .await?;

        let mut by_metric = BTreeMap::new();
        for series in &response.data.result {
            let name = series
                .metric
                .get("metric")
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            if let Some(value) = series.instant_value() {
                by_metric.insert(name, value);
            }
        }
        Ok(CostFlowSnapshot {
            total_cost_per_minute: by_metric.values().sum(),
            by_metric,
            generated_at: Utc::now(),
        })
    }
}

// Prometheus HTTP API response shapes (the subset Phoenix reads).

#[derive(Debug, Deserialize)]
struct PromResponse {
    data: PromData,
}

#[derive(Debug, Deserialize)]
struct PromData {
    result: Vec<PromSeries>,
}

#[derive(Debug, Deserialize)]
struct PromSeries {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    /// Range query: [[ts, "value"], ...]
    #[serde(default)]
    values: Vec<(f64, String)>,
    /// Instant query: [ts, "value"]
    #[serde(default)]
    value: Option<(f64, String)>,
}

impl PromSeries {
    fn instant_value(&self) -> Option<f64> {
        self.value.as_ref().and_then(|(_, v)| v.parse().ok())
    }
}

/// All parseable sample values across every returned series, in order.
fn flatten_range_values(response: &PromResponse) -> Vec<f64> {
    response
        .data
        .result
        .iter()
        .flat_map(|series| series.values.iter())
        .filter_map(|(_, value)| value.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_range_query_values() {
        let body = serde_json::json!({
            "status": "success",
            "data": {
                "resultType": "matrix",
                "result": [{
                    "metric": {"__name__": "cardinality", "variant": "baseline"},
                    "values": [[1700000000.0, "101.5"], [1700000010.0, "99.0"], [1700000020.0, "bogus"]]
                }]
            }
        });
        let response: PromResponse = serde_json::from_value(body).unwrap();
        assert_eq!(flatten_range_values(&response), vec![101.5, 99.0]);
    }

    #[test]
    fn parses_instant_query_value() {
        let body = serde_json::json!({
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [{
                    "metric": {"metric": "cardinality"},
                    "value": [1700000000.0, "12.25"]
                }]
            }
        });
        let response: PromResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.data.result[0].instant_value(), Some(12.25));
    }

    #[tokio::test]
    async fn null_source_reports_empty_samples() {
        let source = NullMetricSource;
        let samples = source
            .fetch_samples(Uuid::new_v4(), "cardinality", Variant::Baseline, (Utc::now(), Utc::now()))
            .await
            .unwrap();
        assert!(samples.is_empty());
        assert_eq!(source.cost_flow().await.unwrap().total_cost_per_minute, 0.0);
    }
}
