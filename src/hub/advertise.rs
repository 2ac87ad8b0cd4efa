use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::hub::HubClient;
use crate::worker::spec::ScriptDirectory;

/// Periodically tells the hub this satellite is alive and which specs it can run.
pub struct Advertiser {
    hub: HubClient,
    scripts: Arc<ScriptDirectory>,
    interval: Duration,
}

impl Advertiser {
    pub fn new(hub: HubClient, scripts: Arc<ScriptDirectory>, interval: Duration) -> Self {
        Self {
            hub,
            scripts,
            interval,
        }
    }

    /// The hub forgets this satellite if it misses two advertisements in a row.
    pub fn ttl(&self) -> Duration {
        self.interval.saturating_mul(2)
    }

    /// Advertise until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(interval_secs = self.interval.as_secs_f64(), "Advertising to hub");
        loop {
            let scripts = self.scripts.clone();
            let available = match tokio::task::spawn_blocking(move || scripts.available()).await {
                Ok(available) => available,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to scan specs for advertisement");
                    Default::default()
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.hub.advertise(self.ttl(), &available) => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        tracing::debug!("Advertiser stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HubConfig, Identity};

    #[tokio::test]
    async fn stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let scripts = Arc::new(ScriptDirectory::open(dir.path()).unwrap());
        let config = HubConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            request_timeout: Duration::from_secs(1),
            ..HubConfig::default()
        };
        let hub = HubClient::new(&config, Identity::default()).unwrap();
        let advertiser = Advertiser::new(hub, scripts, Duration::from_secs(3600));
        assert_eq!(advertiser.ttl(), Duration::from_secs(7200));

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { advertiser.run(token).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("advertiser should stop promptly")
            .unwrap();
    }
}
