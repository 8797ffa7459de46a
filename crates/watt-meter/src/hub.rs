//! Client for the automation hub's sensor state API
//!
//! The hub exposes every entity at `/api/states` behind a bearer token.
//! Power entities report kilowatts; values convert to watts here so the
//! rest of the system speaks one unit. A state that does not parse as a
//! number ("unavailable" during hub restarts) counts as zero rather than
//! failing the cycle.

use crate::egauge::map_transport;
use crate::{FetchError, FetchResult};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use watt_core::PowerFlow;

pub struct HubClient {
    client: Client,
    base_url: String,
    token: String,
    solar_entity: String,
    battery_entity: Option<String>,
    soc_entity: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EntityState {
    entity_id: String,
    state: String,
}

impl HubClient {
    pub fn new(
        base_url: &str,
        token: String,
        solar_entity: String,
        battery_entity: Option<String>,
        soc_entity: Option<String>,
        timeout: Duration,
    ) -> FetchResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Unreachable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            solar_entity,
            battery_entity,
            soc_entity,
        })
    }

    /// Current house-level generation sample.
    pub async fn fetch_power_flow(&self) -> FetchResult<PowerFlow> {
        let url = format!("{}/api/states", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(FetchError::Unauthorized(format!("hub returned {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::Unreachable(format!("hub returned {status}")));
        }

        let states: Vec<EntityState> = response
            .json()
            .await
            .map_err(|e| FetchError::MalformedPayload(format!("hub states: {e}")))?;
        let flow = self.flow_from_states(&states);
        debug!(
            solar_w = flow.solar_w,
            battery_w = flow.battery_w,
            "fetched hub power flow"
        );
        Ok(flow)
    }

    fn flow_from_states(&self, states: &[EntityState]) -> PowerFlow {
        let mut flow = PowerFlow::default();
        for state in states {
            let value = state.state.parse::<f64>().unwrap_or(0.0);
            if state.entity_id == self.solar_entity {
                flow.solar_w = value * 1000.0;
            } else if self.battery_entity.as_deref() == Some(state.entity_id.as_str()) {
                flow.battery_w = value * 1000.0;
            } else if self.soc_entity.as_deref() == Some(state.entity_id.as_str()) {
                flow.battery_soc = Some(value);
            }
        }
        flow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HubClient {
        HubClient::new(
            "http://homeassistant.local:8123",
            "token".to_string(),
            "sensor.solar_power".to_string(),
            Some("sensor.battery_power".to_string()),
            Some("sensor.battery_soc".to_string()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn state(entity_id: &str, state: &str) -> EntityState {
        EntityState {
            entity_id: entity_id.to_string(),
            state: state.to_string(),
        }
    }

    #[test]
    fn test_kilowatts_convert_to_watts() {
        let flow = client().flow_from_states(&[
            state("sensor.solar_power", "3.2"),
            state("sensor.battery_power", "-1.5"),
            state("sensor.battery_soc", "84.5"),
            state("sensor.unrelated", "99"),
        ]);
        assert_eq!(flow.solar_w, 3200.0);
        assert_eq!(flow.battery_w, -1500.0);
        assert_eq!(flow.battery_soc, Some(84.5));
    }

    #[test]
    fn test_unavailable_state_counts_as_zero() {
        let flow = client().flow_from_states(&[
            state("sensor.solar_power", "unavailable"),
            state("sensor.battery_soc", "unknown"),
        ]);
        assert_eq!(flow.solar_w, 0.0);
        assert_eq!(flow.battery_soc, Some(0.0));
    }

    #[test]
    fn test_missing_entities_leave_defaults() {
        let flow = client().flow_from_states(&[state("sensor.other", "42")]);
        assert_eq!(flow, PowerFlow::default());
    }

    #[test]
    fn test_entity_state_deserialize_ignores_extras() {
        let json = r#"{"entity_id":"sensor.solar_power","state":"2.1",
            "attributes":{"unit_of_measurement":"kW"},"last_changed":"2026-01-15T17:00:00"}"#;
        let parsed: EntityState = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.entity_id, "sensor.solar_power");
        assert_eq!(parsed.state, "2.1");
    }
}
