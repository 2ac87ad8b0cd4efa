use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How this satellite names itself to callers and to the hub.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    /// Short human readable name, usually the host name
    pub name: String,
    /// Host the hub should use to reach this satellite
    pub export_host: Option<String>,
    /// Port the hub should use to reach this satellite
    pub export_port: u16,
}

/// Submission queue and consumer settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of submissions waiting to run. Submits beyond this are rejected.
    pub queue_size: usize,
    /// Number of submissions allowed to run at the same time.
    pub concurrent_submissions: usize,
    /// Parallelism used when a submission does not request one.
    pub default_parallel: u32,
    /// Terminal jobs and submissions older than this are purged.
    pub retention: chrono::Duration,
    pub logs_dir: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_size: 20,
            concurrent_submissions: 1,
            default_parallel: 4,
            retention: chrono::Duration::days(10),
            logs_dir: PathBuf::from("job_logs"),
        }
    }
}

/// Settings for launching job processes.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub scripts_dir: PathBuf,
    pub logs_dir: PathBuf,
    /// Applies when a spec does not declare its own timeout
    pub default_timeout: Duration,
    /// SIGTERM to SIGKILL grace period
    pub kill_grace: Duration,
    /// Exported to job processes as `HUB_BASE_URL`
    pub hub_url: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            scripts_dir: PathBuf::from("test_scripts"),
            logs_dir: PathBuf::from("job_logs"),
            default_timeout: Duration::from_secs(3600),
            kill_grace: Duration::from_secs(5),
            hub_url: HubConfig::default().base_url,
        }
    }
}

/// Hub communication settings.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub base_url: String,
    /// Advertisement interval. `None` disables advertising.
    pub advertise_interval: Option<Duration>,
    /// Per-request timeout for ordinary hub calls
    pub request_timeout: Duration,
    /// Bound on the withdrawal call made at shutdown
    pub unadvertise_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            advertise_interval: Some(Duration::from_secs(600)),
            request_timeout: Duration::from_secs(30),
            unadvertise_timeout: Duration::from_secs(15),
        }
    }
}

impl HubConfig {
    /// Convert an interval in minutes into an advertisement interval.
    /// Non-positive values turn advertising off, as do values too large for a `Duration`.
    pub fn interval_from_minutes(minutes: f64) -> Option<Duration> {
        if minutes.is_finite() && minutes > 0.0 {
            Duration::try_from_secs_f64(minutes * 60.0).ok()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct SatelliteConfig {
    pub listen_addr: SocketAddr,
    pub identity: Identity,
    pub scheduler: SchedulerConfig,
    pub executor: ExecutorConfig,
    pub hub: HubConfig,
    pub db_path: PathBuf,
    /// Skip restoring persisted state and wipe the log directory
    pub clean: bool,
    /// Submission files queued at startup
    pub initial_submissions: Vec<PathBuf>,
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7913)),
            identity: Identity {
                export_port: 7913,
                ..Identity::default()
            },
            scheduler: SchedulerConfig::default(),
            executor: ExecutorConfig::default(),
            hub: HubConfig::default(),
            db_path: PathBuf::from("satellite.redb"),
            clean: false,
            initial_submissions: Vec::new(),
        }
    }
}

impl SatelliteConfig {
    /// Point both the scheduler and the executor at the same directories.
    pub fn with_directories(mut self, scripts_dir: PathBuf, logs_dir: PathBuf) -> Self {
        self.executor.scripts_dir = scripts_dir;
        self.executor.logs_dir = logs_dir.clone();
        self.scheduler.logs_dir = logs_dir;
        self
    }

    pub fn with_hub_url(mut self, url: String) -> Self {
        self.executor.hub_url = url.clone();
        self.hub.base_url = url;
        self
    }
}
