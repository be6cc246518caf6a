//! cloud-init-engine - boot-time provisioning
//!
//! Each boot runs `init --local`, `init`, `modules --mode config` and
//! `modules --mode final` as separate invocations.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cloud_init_engine::stages::ModuleMode;
use cloud_init_engine::state::CloudPaths;
use cloud_init_engine::state::paths::{CLOUD_DIR, CONFIG_DIR};
use cloud_init_engine::{CloudInitError, Pipeline};

#[derive(Parser)]
#[command(name = "cloud-init-engine")]
#[command(author, version, about = "Boot-time provisioning engine", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// State directory (default /var/lib/cloud)
    #[arg(long, env = "CLOUD_INIT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Config directory (default /etc/cloud)
    #[arg(long, env = "CLOUD_INIT_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Init,
    Config,
    Final,
}

impl From<Mode> for ModuleMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Init => ModuleMode::Init,
            Mode::Config => ModuleMode::Config,
            Mode::Final => ModuleMode::Final,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Find the datasource and consume user-data
    Init {
        /// Only probe datasources that need no network
        #[arg(long)]
        local: bool,
    },
    /// Run a configured module list
    Modules {
        #[arg(long, value_enum, default_value = "config")]
        mode: Mode,
    },
    /// Run a single module
    Single {
        #[arg(long)]
        name: String,
        /// Override the module's frequency
        #[arg(long)]
        frequency: Option<String>,
        /// Positional arguments passed to the module
        args: Vec<String>,
    },
    /// Query cached instance metadata
    Query {
        /// Key to query (e.g., instance-id, local-hostname)
        key: String,
    },
    /// Show status of the last run
    Status,
    /// Clean instance state
    Clean {
        /// Remove logs as well
        #[arg(long)]
        logs: bool,
    },
}

fn init_logging(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        })
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

fn cloud_paths(cli: &Cli) -> CloudPaths {
    match (&cli.data_dir, &cli.config_dir) {
        (None, None) => CloudPaths::new(),
        (data, config) => CloudPaths::with_dirs(
            data.clone().unwrap_or_else(|| PathBuf::from(CLOUD_DIR)),
            config.clone().unwrap_or_else(|| PathBuf::from(CONFIG_DIR)),
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let pipeline = Pipeline::new(cloud_paths(&cli));

    match cli.command {
        Commands::Init { local } => match pipeline.init(local).await {
            Ok(report) => {
                info!(
                    "Instance {} from datasource {} (new: {})",
                    report.instance_id, report.datasource, report.is_new_instance
                );
                let failed = report.modules.as_ref().map_or(0, |m| m.failures.len());
                if failed > 0 {
                    bail!("{} modules failed", failed);
                }
            }
            Err(CloudInitError::NoDatasource { searched }) if local => {
                info!("No local datasource found (searched: {:?})", searched);
            }
            Err(e @ CloudInitError::NoDatasource { .. }) => {
                error!("{}", e);
                bail!("no datasource found");
            }
            Err(e) => return Err(e).context("init stage failed"),
        },
        Commands::Modules { mode } => {
            let report = pipeline
                .run_modules(mode.into())
                .await
                .context("modules stage failed")?;
            if !report.is_success() {
                bail!("modules failed: {}", report.failed_names().join(", "));
            }
        }
        Commands::Single { name, frequency, args } => {
            let args = args.into_iter().map(serde_yaml::Value::from).collect();
            let report = pipeline
                .run_single(&name, frequency.as_deref(), args)
                .await
                .with_context(|| format!("running module {}", name))?;
            if report.ran.is_empty() {
                bail!("module {} not found", name);
            }
            if !report.is_success() {
                bail!("module {} failed", name);
            }
        }
        Commands::Query { key } => match pipeline.query(&key).await? {
            Some(serde_json::Value::String(s)) => println!("{}", s),
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => bail!("key {} not found", key),
        },
        Commands::Status => {
            let status = pipeline.status().await?;
            println!("status: {}", status.status);
            if let Some(stage) = &status.stage {
                println!("stage: {}", stage);
            }
            if let Some(datasource) = &status.datasource {
                println!("datasource: {}", datasource);
            }
            println!("boot finished: {}", status.boot_finished);
            for err in &status.errors {
                println!("error: {}", err);
            }
        }
        Commands::Clean { logs } => {
            info!("Cleaning instance state (logs: {})", logs);
            pipeline.clean(logs).await?;
        }
    }

    Ok(())
}
