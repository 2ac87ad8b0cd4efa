use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::config::SatelliteConfig;
use crate::error::{Result, SatelliteError};
use crate::hub::{Advertiser, HubClient};
use crate::persistence::Persistence;
use crate::scheduler::{Scheduler, StateStore, Submission, SubmissionRequest};
use crate::worker::spec::{ScriptDirectory, SpecSource};
use crate::worker::ProcessExecutor;

/// A single satellite: scheduler, executor, HTTP surface, and hub advertiser wired
/// around one shared state store.
pub struct Satellite {
    config: Arc<SatelliteConfig>,
    scheduler: Arc<Scheduler>,
    scripts: Arc<ScriptDirectory>,
    hub: HubClient,
    persistence: Persistence,
}

impl Satellite {
    /// Open the script directory and the state database, then restore saved work.
    ///
    /// A missing script directory or an unreadable database is fatal. With `clean` set,
    /// saved state is ignored and the job log directory is wiped.
    pub async fn start(config: SatelliteConfig) -> Result<Self> {
        let scripts = Arc::new(ScriptDirectory::open(&config.executor.scripts_dir)?);
        let persistence = Persistence::open(&config.db_path)?;

        let logs_dir = &config.scheduler.logs_dir;
        if config.clean {
            match std::fs::remove_dir_all(logs_dir) {
                Ok(()) => tracing::info!(dir = %logs_dir.display(), "Removed old job logs"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        std::fs::create_dir_all(logs_dir)?;

        let store = StateStore::new().shared();
        let hub = HubClient::new(&config.hub, config.identity.clone())?;
        let specs: Arc<dyn SpecSource> = scripts.clone();
        let executor = Arc::new(ProcessExecutor::new(
            config.executor.clone(),
            specs,
            store.clone(),
            hub.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(config.scheduler.clone(), store, executor));

        if !config.clean {
            if let Some(snapshot) = persistence.load()? {
                let resumed = scheduler.restore(snapshot).await;
                tracing::info!(resumed, "Restored saved state");
            }
        }

        let satellite = Self {
            config: Arc::new(config),
            scheduler,
            scripts,
            hub,
            persistence,
        };
        for path in satellite.config.initial_submissions.clone() {
            tracing::info!(file = %path.display(), "Queueing initial submission");
            if let Err(e) = satellite.submit_file(&path).await {
                tracing::warn!(file = %path.display(), error = %e, "Failed to queue initial submission");
            }
        }
        Ok(satellite)
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn api_state(&self) -> ApiState {
        ApiState::new(
            self.scheduler.clone(),
            self.scripts.clone(),
            self.config.clone(),
        )
    }

    /// Queue a submission stored as a `/run` body on disk.
    pub async fn submit_file(&self, path: &Path) -> Result<Submission> {
        let text = tokio::fs::read_to_string(path).await?;
        let payload = serde_json::from_str(&text)
            .map_err(|e| SatelliteError::InvalidSubmission(e.to_string()))?;
        let request = SubmissionRequest::from_value(payload)?;
        self.scheduler.submit(request).await
    }

    /// Serve requests and process submissions until `shutdown` is cancelled, then
    /// stop all work and save a snapshot.
    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let consumers = self.scheduler.spawn_consumers(shutdown.clone());
        let advertiser = self.spawn_advertiser(shutdown.clone());

        let served = api::serve(listener, self.api_state(), shutdown.clone()).await;
        if let Err(e) = &served {
            tracing::error!(error = %e, "HTTP server failed");
        }
        shutdown.cancel();

        self.stop(consumers, advertiser).await?;
        served.map_err(SatelliteError::from)
    }

    fn spawn_advertiser(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let interval = self.config.hub.advertise_interval?;
        let advertiser = Advertiser::new(self.hub.clone(), self.scripts.clone(), interval);
        Some(tokio::spawn(async move { advertiser.run(shutdown).await }))
    }

    /// Join the background tasks, save the snapshot, and withdraw from the hub.
    ///
    /// The withdrawal is only sent when advertising is enabled: a satellite that never
    /// advertised has nothing for the hub to forget, so shutdown makes no hub call.
    async fn stop(
        &self,
        consumers: Vec<JoinHandle<()>>,
        advertiser: Option<JoinHandle<()>>,
    ) -> Result<()> {
        tracing::info!("Stopping submission consumers");
        for consumer in consumers {
            if let Err(e) = consumer.await {
                tracing::warn!(error = %e, "Submission consumer ended abnormally");
            }
        }
        if let Some(advertiser) = advertiser {
            let _ = advertiser.await;
        }

        let snapshot = self.scheduler.snapshot().await;
        self.persistence.save(&snapshot)?;

        if self.config.hub.advertise_interval.is_some() {
            self.hub.unadvertise().await;
        }
        tracing::info!("Satellite stopped");
        Ok(())
    }
}
