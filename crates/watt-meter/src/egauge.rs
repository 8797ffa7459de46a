//! HTTP client for an eGauge-style register meter

use crate::{history, now_ts, xml, CumulativeRow, FetchError, FetchResult, MeterSample, MeterSource};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

pub struct EgaugeClient {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl EgaugeClient {
    pub fn new(
        base_url: &str,
        username: Option<String>,
        password: Option<String>,
        timeout: Duration,
    ) -> FetchResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Unreachable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            password,
        })
    }

    async fn get(&self, url: &str) -> FetchResult<String> {
        let mut request = self.client.get(url);
        if let Some(user) = &self.username {
            request = request.basic_auth(user, self.password.as_deref());
        }

        let response = request.send().await.map_err(map_transport)?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(FetchError::Unauthorized(format!("meter returned {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::Unreachable(format!("meter returned {status}")));
        }
        response.text().await.map_err(map_transport)
    }
}

#[async_trait::async_trait]
impl MeterSource for EgaugeClient {
    fn name(&self) -> &str {
        "egauge"
    }

    async fn fetch_instantaneous(&self) -> FetchResult<MeterSample> {
        let url = format!("{}/cgi-bin/egauge?notemp&tot&inst", self.base_url);
        let body = self.get(&url).await?;
        let sample = xml::parse_instantaneous(&body, now_ts())?;
        debug!(
            registers = sample.registers.len(),
            total_w = sample.total_usage_w,
            "fetched instantaneous sample"
        );
        Ok(sample)
    }

    async fn fetch_historical(&self, hours: u32) -> FetchResult<Vec<CumulativeRow>> {
        // hours of consumption need hours + 1 boundary rows
        let url = format!("{}/cgi-bin/egauge-show?c&h&n={}", self.base_url, hours + 1);
        let body = self.get(&url).await?;
        let rows = history::parse_history(&body)?;
        debug!(rows = rows.len(), "fetched history rows");
        Ok(rows)
    }
}

pub(crate) fn map_transport(e: reqwest::Error) -> FetchError {
    if e.is_timeout() || e.is_connect() {
        FetchError::Unreachable(e.to_string())
    } else if e.is_decode() {
        FetchError::MalformedPayload(e.to_string())
    } else {
        FetchError::Unreachable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_slash_is_trimmed() {
        let client = EgaugeClient::new(
            "https://egauge12345.egaug.es/",
            None,
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(client.base_url, "https://egauge12345.egaug.es");
    }

    #[tokio::test]
    async fn test_unreachable_meter_maps_to_fetch_error() {
        // reserved TEST-NET address, nothing listens there
        let client = EgaugeClient::new(
            "http://192.0.2.1:1",
            None,
            None,
            Duration::from_millis(50),
        )
        .unwrap();
        let err = client.fetch_instantaneous().await.unwrap_err();
        assert!(matches!(err, FetchError::Unreachable(_)));
    }
}
