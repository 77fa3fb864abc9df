use crate::MetricSource;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

/// Reads metric series from the monitoring service:
/// `GET {base}/ns/{ns}/mci/{mci}/metric/{metric}` -> `{"values":[{"time":..,"value":..}]}`.
pub struct HttpMetricSource {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct MetricResponse {
    #[serde(default)]
    values: Vec<MetricPoint>,
}

#[derive(Deserialize)]
struct MetricPoint {
    #[serde(default)]
    value: serde_json::Value,
}

impl HttpMetricSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
        })
    }
}

/// Values arrive either as JSON numbers or numeric strings.
pub fn parse_metric_value(v: &serde_json::Value) -> Result<f64> {
    match v {
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("metric value {} is not representable", n)),
        serde_json::Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| anyhow::anyhow!("metric value '{}' is not numeric: {}", s, e)),
        other => Err(anyhow::anyhow!("unexpected metric value {}", other)),
    }
}

#[async_trait]
impl MetricSource for HttpMetricSource {
    async fn fetch_metric(&self, ns: &str, mci_id: &str, metric: &str) -> Result<Vec<f64>> {
        let url = format!(
            "{}/ns/{}/mci/{}/metric/{}",
            self.base_url, ns, mci_id, metric
        );
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "GET {} failed: status={} body={}",
                url,
                status.as_u16(),
                text.trim()
            ));
        }
        let body: MetricResponse = resp.json().await?;
        body.values
            .iter()
            .map(|p| parse_metric_value(&p.value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_and_string_values() {
        assert_eq!(parse_metric_value(&json!(85)).unwrap(), 85.0);
        assert_eq!(parse_metric_value(&json!("12.5")).unwrap(), 12.5);
        assert!(parse_metric_value(&json!("n/a")).is_err());
        assert!(parse_metric_value(&json!(null)).is_err());
    }
}
