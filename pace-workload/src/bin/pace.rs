//! Pace command-line driver.
//!
//! Loads a profile or TOML configuration, applies command-line overrides and
//! runs the workload until the cycle limit, Ctrl-C, a capture or a fatal
//! error. The process exit code reports how the run ended.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use pace_workload::{
    list_profiles, load_profile, Connector, Controller, DriverConfig, KeyPolicy,
    MemcacheConnector, MemoryConnector, MemoryStore, WorkloadMode, EXIT_SETUP,
    MEMORY_ENDPOINT,
};

/// Workload variant.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// View check, then bulk store.
    Consistency,
    /// Bulk store, then bulk fetch and verify.
    Readback,
    /// One pattern store per cycle.
    SoakWrite,
    /// One pattern fetch and compare per cycle.
    SoakCheck,
    /// Fetch one key and dump it.
    SoakCapture,
}

impl From<Mode> for WorkloadMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Consistency => Self::Consistency,
            Mode::Readback => Self::Readback,
            Mode::SoakWrite => Self::SoakWrite,
            Mode::SoakCheck => Self::SoakCheck,
            Mode::SoakCapture => Self::SoakCapture,
        }
    }
}

/// Phase-gated workload driver for key-value stores.
#[derive(Parser, Debug)]
#[command(name = "pace")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file. Takes precedence over --profile.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Built-in profile to start from.
    #[arg(long, default_value = "consistency")]
    profile: String,

    /// List built-in profiles and exit.
    #[arg(long)]
    list_profiles: bool,

    /// Workload mode.
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Store endpoint (`host:port`, or `mem://` for the in-process store).
    #[arg(long)]
    endpoint: Option<String>,

    /// HTTP endpoint serving view queries.
    #[arg(long)]
    view_endpoint: Option<String>,

    /// Bucket the view path is resolved against.
    #[arg(long)]
    bucket: Option<String>,

    /// Operations per batch.
    #[arg(long)]
    batch_size: Option<u64>,

    /// Rotate keys through this many serials.
    #[arg(long, conflicts_with = "unique_keys")]
    pool_size: Option<u64>,

    /// Never reuse a key within the run.
    #[arg(long)]
    unique_keys: bool,

    /// Stop after this many cycles.
    #[arg(long)]
    cycles: Option<u64>,

    /// Seed for generated documents.
    #[arg(long)]
    seed: Option<u64>,

    /// Row count the consistency view must report.
    #[arg(long)]
    expected_rows: Option<u64>,

    /// Directory receiving captured values.
    #[arg(long)]
    capture_dir: Option<PathBuf>,

    /// Exit on transport failure instead of reconnecting.
    #[arg(long)]
    no_reconnect: bool,

    /// Log failed stores at warn level.
    #[arg(long)]
    log_store_failures: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: Level,
}

impl Args {
    fn load_config(&self) -> Result<DriverConfig, pace_workload::ConfigError> {
        let mut config = match &self.config {
            Some(path) => DriverConfig::from_file(path)?,
            None => load_profile(&self.profile)?,
        };

        if let Some(mode) = self.mode {
            config.mode = mode.into();
        }
        if let Some(endpoint) = &self.endpoint {
            config.endpoint.clone_from(endpoint);
        }
        if let Some(view_endpoint) = &self.view_endpoint {
            config.view_endpoint = Some(view_endpoint.clone());
        }
        if let Some(bucket) = &self.bucket {
            config.bucket.clone_from(bucket);
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(pool_size) = self.pool_size {
            config.keys = KeyPolicy::Cyclic { pool_size };
        }
        if self.unique_keys {
            config.keys = KeyPolicy::Unique;
        }
        if let Some(cycles) = self.cycles {
            config.cycles = Some(cycles);
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(rows) = self.expected_rows {
            config.expected_rows = rows;
        }
        if let Some(dir) = &self.capture_dir {
            config.capture_dir = Some(dir.clone());
        }
        if self.no_reconnect {
            config.reconnect = false;
        }
        if self.log_store_failures {
            config.log_store_failures = true;
        }
        Ok(config)
    }
}

async fn drive<K: Connector>(config: DriverConfig, connector: K) -> ExitCode {
    let mut controller = match Controller::new(config, connector) {
        Ok(controller) => controller,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::from(e.exit_code());
        }
    };

    let interrupt = controller.interrupt_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, draining");
            interrupt.interrupt();
        }
    });

    let result = controller.run().await;
    controller.stats().print_summary();
    println!("pace finish");

    match result {
        Ok(outcome) => ExitCode::from(outcome.exit_code()),
        Err(e) => ExitCode::from(e.exit_code()),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.list_profiles {
        for name in list_profiles() {
            println!("{name}");
        }
        return ExitCode::SUCCESS;
    }

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logger: {e}");
    }

    let config = match args.load_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::from(EXIT_SETUP);
        }
    };

    info!(
        profile = %config.name,
        mode = ?config.mode,
        endpoint = %config.endpoint,
        "loaded configuration"
    );

    if config.endpoint == MEMORY_ENDPOINT {
        let connector = MemoryConnector::new(MemoryStore::new(), config.timeouts);
        drive(config, connector).await
    } else {
        let connector = MemcacheConnector::from_config(&config);
        drive(config, connector).await
    }
}
