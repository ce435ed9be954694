//! svcat-operator - keeps the service catalog API server converged

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use kube::{Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use svcat_operator::bootstrap::ensure_operator_config;
use svcat_operator::config::OperatorSettings;
use svcat_operator::controller::{Context, KubeOperatorClient};
use svcat_operator::crd::ServiceCatalogAPIServer;
use svcat_operator::dispatcher::{run_watchers, Dispatcher};
use svcat_operator::metrics::{BuildInfo, MetricsReporter, OtelMetricsReporter};
use svcat_operator::queue::WorkQueue;
use svcat_operator::remover::{run_remover, KubeRemoverClient};
use svcat_operator::retry::RetryConfig;
use svcat_operator::worker::Worker;

/// Operator for the service catalog aggregated API server
#[derive(Parser, Debug)]
#[command(name = "svcat-operator", version, about, long_about = None)]
struct Cli {
    /// Print the ServiceCatalogAPIServer CRD and exit
    #[arg(long)]
    crd: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator (default mode)
    Operator(OperatorArgs),

    /// Remove the operator's leftovers after uninstall
    ///
    /// Aborts without touching anything while the operand is Managed.
    Remove,
}

#[derive(Parser, Debug)]
struct OperatorArgs {
    /// Operand image; the bundled image is used when unset
    #[arg(long, env = "IMAGE")]
    image: Option<String>,

    /// Sync passes allowed per minute
    #[arg(long, env = "SYNC_PERMITS_PER_MINUTE", default_value_t = 3)]
    sync_permits_per_minute: u32,

    /// Sync passes allowed in a burst
    #[arg(long, env = "SYNC_BURST", default_value_t = 4)]
    sync_burst: u32,

    /// Seconds between namespace checks while removing
    #[arg(long, default_value_t = 1)]
    removal_poll_interval_secs: u64,

    /// Seconds to wait for namespace deletion while removing
    #[arg(long, default_value_t = 120)]
    removal_timeout_secs: u64,
}

impl OperatorArgs {
    fn settings(&self) -> anyhow::Result<OperatorSettings> {
        let permits = NonZeroU32::new(self.sync_permits_per_minute)
            .ok_or_else(|| anyhow::anyhow!("--sync-permits-per-minute must be positive"))?;
        let burst = NonZeroU32::new(self.sync_burst)
            .ok_or_else(|| anyhow::anyhow!("--sync-burst must be positive"))?;

        Ok(OperatorSettings {
            image: self.image.clone().filter(|image| !image.is_empty()),
            sync_permits_per_minute: permits,
            sync_burst: burst,
            removal_poll_interval: Duration::from_secs(self.removal_poll_interval_secs),
            removal_timeout: Duration::from_secs(self.removal_timeout_secs),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let fmt_layer = match cli.log_format {
        LogFormat::Text => fmt::layer().boxed(),
        LogFormat::Json => fmt::layer().json().boxed(),
    };
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .init();

    if cli.crd {
        let crd = serde_yaml::to_string(&ServiceCatalogAPIServer::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Remove) => run_remove().await,
        Some(Commands::Operator(args)) => run_operator(args).await,
        None => run_operator(OperatorArgs::parse_from(["operator"])).await,
    }
}

async fn run_remove() -> anyhow::Result<()> {
    tracing::info!("Starting remover job");
    let client = Client::try_default().await?;
    let operator = KubeOperatorClient::new(client.clone());
    let remover = KubeRemoverClient::new(client);

    let outcome = run_remover(&operator, &remover)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read operator config: {}", e))?;
    tracing::info!(?outcome, "Remover job finished");
    Ok(())
}

async fn run_operator(args: OperatorArgs) -> anyhow::Result<()> {
    let settings = args.settings()?;
    tracing::info!(image = settings.image_pull_spec(), "svcat-operator starting...");

    let client = Client::try_default().await?;

    let meter = opentelemetry::global::meter("svcat-operator");
    let metrics: Arc<dyn MetricsReporter> = Arc::new(OtelMetricsReporter::new(&meter));
    metrics.record_build_info(&BuildInfo::current());

    let ctx = Arc::new(
        Context::builder(client.clone())
            .settings(settings.clone())
            .metrics(metrics)
            .build(),
    );

    ensure_operator_config(ctx.operator.as_ref(), &RetryConfig::fixed(Duration::from_secs(10)))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bootstrap operator config: {}", e))?;

    let queue = WorkQueue::new(RetryConfig::work_queue());
    let dispatcher = Dispatcher::new(queue.clone());
    dispatcher.notify();

    let watchers = tokio::spawn(run_watchers(client, dispatcher));
    let worker = Worker::new(
        queue.clone(),
        ctx,
        settings.sync_permits_per_minute,
        settings.sync_burst,
    );
    let worker = tokio::spawn(async move { worker.run().await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, draining worker");
    queue.shutdown();
    watchers.abort();
    worker.await?;

    tracing::info!("svcat-operator stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["svcat-operator", "operator"]);
        let Some(Commands::Operator(args)) = cli.command else {
            panic!("expected operator subcommand");
        };
        let settings = args.settings().unwrap();
        assert_eq!(settings.sync_permits_per_minute.get(), 3);
        assert_eq!(settings.sync_burst.get(), 4);
        assert_eq!(settings.removal_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_zero_burst_is_rejected() {
        let cli = Cli::parse_from(["svcat-operator", "operator", "--sync-burst", "0"]);
        let Some(Commands::Operator(args)) = cli.command else {
            panic!("expected operator subcommand");
        };
        assert!(args.settings().is_err());
    }

    #[test]
    fn test_remove_subcommand_parses() {
        let cli = Cli::parse_from(["svcat-operator", "--log-format", "json", "remove"]);
        assert!(matches!(cli.command, Some(Commands::Remove)));
        assert!(matches!(cli.log_format, LogFormat::Json));
    }
}
