//! Drive the in-memory devices from the command line

mod scenarios;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::builder::PossibleValuesParser;
use clap::Parser;
use memdev::{Credentials, DevFs, DeviceConfig, DeviceTable};
use tracing::{error, info};

/// Run scripted scenarios against in-memory stores and channels
#[derive(Parser, Debug)]
#[command(name = "devctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// JSON device configuration; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Scenarios to run, in order; all of them when none are given
    #[arg(value_parser = PossibleValuesParser::new(scenarios::NAMES))]
    scenarios: Vec<String>,
}

impl Cli {
    fn scenarios(&self) -> Vec<String> {
        if self.scenarios.is_empty() {
            scenarios::NAMES.iter().map(ToString::to_string).collect()
        } else {
            self.scenarios.clone()
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<DeviceConfig, Box<dyn std::error::Error>> {
    let Some(path) = path else {
        return Ok(DeviceConfig::default());
    };
    let bytes = std::fs::read(path)?;
    Ok(DeviceConfig::from_json_slice(&bytes)?)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    let table = match DeviceTable::new(config) {
        Ok(table) => Arc::new(table),
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    let fs = Arc::new(DevFs::new(Arc::clone(&table), Credentials::admin()));

    let names = cli.scenarios();
    let mut failed = 0;
    for name in &names {
        info!(scenario = %name, "running");
        match scenarios::run(name, &fs).await {
            Ok(()) => info!(scenario = %name, "ok"),
            Err(e) => {
                error!(scenario = %name, "failed: {e}");
                failed += 1;
            }
        }
    }

    table.shutdown().await;
    info!(passed = names.len() - failed, failed, "Program completed");
    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
