use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use hub_satellite::config::{HubConfig, Identity, SatelliteConfig};
use hub_satellite::shutdown::install_shutdown_handler;
use hub_satellite::Satellite;

#[derive(Parser, Debug)]
#[command(name = "satellite")]
#[command(version)]
#[command(about = "Runs test scripts on this machine on behalf of a hub")]
struct Args {
    /// Base URL of the hub
    #[arg(short = 'm', long, default_value = "http://localhost:8080")]
    master: String,

    /// Port to listen on
    #[arg(short = 'P', long, default_value_t = 7913)]
    port: u16,

    /// Address to bind
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Directory holding one subdirectory per test script
    #[arg(short = 'T', long, default_value = "test_scripts")]
    test_directory: PathBuf,

    /// Directory for per-job logs
    #[arg(short = 'j', long, default_value = "job_logs")]
    job_logs: PathBuf,

    /// Maximum number of queued submissions
    #[arg(short = 'q', long, default_value_t = 20)]
    queue_size: usize,

    /// Number of submissions run at the same time
    #[arg(short = 's', long, default_value_t = 1)]
    concurrent_submissions: usize,

    /// Default number of concurrent jobs per submission
    #[arg(short = 'p', long, default_value_t = 4)]
    parallel: u32,

    /// Job timeout in seconds when a spec declares none
    #[arg(short = 't', long, default_value_t = 3600.0)]
    job_default_timeout: f64,

    /// Days to keep finished jobs and submissions
    #[arg(short = 'r', long, default_value_t = 10)]
    retention: i64,

    /// Ignore saved state and delete old job logs
    #[arg(short = 'c', long)]
    clean: bool,

    /// Minutes between hub advertisements; zero or less disables them
    #[arg(short = 'a', long, default_value_t = 10.0, allow_negative_numbers = true)]
    advertise: f64,

    /// Name reported to the hub (defaults to the host name)
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// State database file
    #[arg(short = 'd', long, default_value = "satellite.redb")]
    dbfile: PathBuf,

    /// Host the hub should use to reach this satellite (defaults to the host name)
    #[arg(short = 'e', long)]
    export_host: Option<String>,

    /// Port the hub should use to reach this satellite (defaults to --port)
    #[arg(short = 'E', long)]
    export_port: Option<u16>,

    /// Submission file to queue at startup; may be repeated
    #[arg(short = 'S', long = "submission")]
    submissions: Vec<PathBuf>,
}

fn hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .map(|h| h.to_string_lossy().into_owned())
}

fn build_config(args: Args) -> Result<SatelliteConfig, Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let mut config = SatelliteConfig::default()
        .with_directories(args.test_directory, args.job_logs)
        .with_hub_url(args.master);

    config.listen_addr = listen_addr;
    config.identity = Identity {
        name: args.name.or_else(hostname).unwrap_or_default(),
        export_host: args.export_host.or_else(hostname),
        export_port: args.export_port.unwrap_or(args.port),
    };
    config.scheduler.queue_size = args.queue_size;
    config.scheduler.concurrent_submissions = args.concurrent_submissions;
    config.scheduler.default_parallel = args.parallel;
    config.scheduler.retention = chrono::Duration::try_days(args.retention)
        .ok_or_else(|| format!("--retention {} days is out of range", args.retention))?;
    config.executor.default_timeout =
        std::time::Duration::try_from_secs_f64(args.job_default_timeout)?;
    config.hub.advertise_interval = HubConfig::interval_from_minutes(args.advertise);
    if args.advertise > 0.0 && config.hub.advertise_interval.is_none() {
        return Err(format!("--advertise {} minutes is out of range", args.advertise).into());
    }
    config.db_path = args.dbfile;
    config.clean = args.clean;
    config.initial_submissions = args.submissions;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = build_config(Args::parse())?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        name = %config.identity.name,
        master = %config.hub.base_url,
        queue_size = config.scheduler.queue_size,
        concurrent_submissions = config.scheduler.concurrent_submissions,
        parallel = config.scheduler.default_parallel,
        default_timeout_secs = config.executor.default_timeout.as_secs_f64(),
        test_directory = %config.executor.scripts_dir.display(),
        job_logs = %config.scheduler.logs_dir.display(),
        dbfile = %config.db_path.display(),
        retention_days = config.scheduler.retention.num_days(),
        export_host = ?config.identity.export_host,
        export_port = config.identity.export_port,
        advertise_minutes = ?config.hub.advertise_interval.map(|d| d.as_secs_f64() / 60.0),
        "Starting hub satellite"
    );

    let shutdown = install_shutdown_handler();
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    let satellite = Satellite::start(config).await?;
    satellite.run(listener, shutdown).await?;

    Ok(())
}
