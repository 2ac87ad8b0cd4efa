//! Communication with the central hub.
//!
//! The hub receives periodic advertisements from this satellite, an explicit
//! withdrawal on shutdown, and the result files of successful jobs. Every failure here
//! is logged and swallowed: nothing the hub does may affect job processing.

pub mod advertise;

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::{HubConfig, Identity};
use crate::envelope::Envelope;
use crate::error::{Result, SatelliteError};
use crate::scheduler::job::make_id;
use crate::worker::spec::Available;

pub use advertise::Advertiser;

const ADVERTISE_PATH: &str = "/api/satellite/advertise";
const UNADVERTISE_PATH: &str = "/api/satellite/unadvertise";

#[derive(Debug, Clone)]
pub struct HubClient {
    client: Client,
    base_url: String,
    identity: Identity,
    unadvertise_timeout: Duration,
}

impl HubClient {
    pub fn new(config: &HubConfig, identity: Identity) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SatelliteError::Internal(format!("build hub client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            identity,
            unadvertise_timeout: config.unadvertise_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST a JSON body to the hub. Returns the decoded response on a 2xx status and
    /// `None` on any failure.
    pub async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        timeout: Option<Duration>,
    ) -> Option<Value> {
        let request_id = make_id();
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(url = %url, request_id = %request_id, "Sending hub request");

        let mut request = self
            .client
            .post(&url)
            .header("X-Request-Id", &request_id)
            .json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(url = %url, request_id = %request_id, error = %e, "Hub request failed");
                return None;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::warn!(
                url = %url,
                request_id = %request_id,
                status = %status,
                body = %text,
                "Hub rejected request"
            );
            return None;
        }

        tracing::debug!(url = %url, request_id = %request_id, "Hub request succeeded");
        Some(response.json::<Value>().await.unwrap_or(Value::Null))
    }

    /// Announce this satellite and the specs it can run.
    pub async fn advertise(&self, ttl: Duration, available: &Available) -> Option<Value> {
        let body = Envelope::wrap(
            &self.identity,
            json!({ "ttl": ttl.as_secs_f64(), "info": available }),
        );
        self.post(ADVERTISE_PATH, &body, None).await
    }

    /// Withdraw the advertisement. Bounded so shutdown never hangs on an unreachable hub.
    pub async fn unadvertise(&self) -> bool {
        tracing::info!(
            timeout_secs = self.unadvertise_timeout.as_secs(),
            "Notifying hub that this satellite is terminating"
        );
        let body = Envelope::wrap(&self.identity, json!({}));
        let sent = self
            .post(UNADVERTISE_PATH, &body, Some(self.unadvertise_timeout))
            .await
            .is_some();
        if !sent {
            tracing::warn!("Notifying hub failed or timed out");
        }
        sent
    }

    /// Forward a job's results file to the hub's ingestion endpoint.
    pub async fn push_results(&self, test_system: &str, test_name: &str, data: &Value) -> bool {
        let path = format!("/api/results/push/{test_system}/{test_name}");
        self.post(&path, data, None).await.is_some()
    }
}
