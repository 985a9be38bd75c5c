//! dormantd — the dormant daemon.
//!
//! Single binary that assembles the scale-to-zero controller:
//! - Backend (in-memory table or REST control plane)
//! - Activation coordinator + readiness probe
//! - Activation gateway (HTTP front door)
//! - Metric poller fed by the gateway's request tracker
//! - Scale-down decision loop
//!
//! # Usage
//!
//! ```text
//! dormantd run --config /etc/dormant.toml --backend http --backend-url http://cp:9000
//! dormantd check-config --config /etc/dormant.toml
//! ```

mod daemon;
mod settings;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use crate::settings::ConfigArgs;

const DEFAULT_LOG_FILTER: &str = "info,dormant=debug";

#[derive(Parser)]
#[command(name = "dormantd", about = "dormant scale-to-zero daemon", version)]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway, metric poller and scale-down loop.
    Run(ConfigArgs),

    /// Load and validate the configuration, then print it as TOML.
    CheckConfig(ConfigArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run(args) => {
            let resolved = settings::resolve(&args).await?;
            daemon::run(resolved.config, resolved.backend).await
        }
        Command::CheckConfig(args) => {
            let resolved = settings::resolve(&args).await?;
            print!("{}", resolved.to_toml()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
