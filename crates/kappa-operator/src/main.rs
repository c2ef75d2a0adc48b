//! kappa - converges App resources into workloads and Istio routing

use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use kube::Client;

use kappa_app::ControllerConfig;
use kappa_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use kappa_common::DEFAULT_FIELD_MANAGER;
use kappa_operator::controller_runner::{build_app_controller, WatchScope};
use kappa_operator::startup::{ensure_crds, render_crds};

/// kappa - App operator
#[derive(Parser, Debug)]
#[command(name = "kappa", version, about, long_about = None)]
struct Cli {
    /// Print the App CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Log output format
    #[arg(long, env = "KAPPA_LOG_FORMAT", value_enum, default_value_t = LogFormatArg::Json, global = true)]
    log_format: LogFormatArg,

    #[command(flatten)]
    controller: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
enum LogFormatArg {
    #[default]
    Json,
    Text,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Text => LogFormat::Text,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the App controller (default mode)
    Controller,
}

/// Controller settings, accepted with or without the `controller` subcommand
#[derive(clap::Args, Debug, Clone, PartialEq)]
struct ControllerArgs {
    /// Watch a single namespace instead of the whole cluster
    #[arg(long, env = "KAPPA_WATCH_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// Field manager recorded on every write
    #[arg(long, env = "KAPPA_FIELD_MANAGER", default_value = DEFAULT_FIELD_MANAGER, global = true)]
    field_manager: String,

    /// Seconds before re-running a pass that created an object
    #[arg(long, env = "KAPPA_CREATED_REQUEUE_SECS", default_value_t = 1, global = true)]
    created_requeue_secs: u64,

    /// Seconds before retrying a pass that failed transiently
    #[arg(long, env = "KAPPA_ERROR_REQUEUE_SECS", default_value_t = 30, global = true)]
    error_requeue_secs: u64,

    /// Do not install the App CRD on startup
    #[arg(long, env = "KAPPA_SKIP_CRD_INSTALL", global = true)]
    skip_crd_install: bool,
}

impl ControllerArgs {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            field_manager: self.field_manager.clone(),
            created_requeue: Duration::from_secs(self.created_requeue_secs),
            error_requeue: Duration::from_secs(self.error_requeue_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print!("{}", render_crds()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: cli.log_format.into(),
        ..Default::default()
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.controller).await,
    }
}

/// Run the App controller until a shutdown signal arrives
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;

    if args.skip_crd_install {
        tracing::info!("skipping CRD installation");
    } else {
        ensure_crds(&client, &args.field_manager).await?;
    }

    let scope = WatchScope::from_namespace(args.namespace.clone());
    tracing::info!("Starting kappa controllers...");
    build_app_controller(client, scope, args.controller_config()).await;

    tracing::info!("Shutting down");
    Ok(())
}
