//! Waggle node agent - Main entry point

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use rabbitmq_api::RabbitMqApi;
use waggle_node::config::{Config, LoggingConfig, NodeEnv};
use waggle_node::error::BatchReport;
use waggle_node::execution::{DockerCompose, shut_down_node};
use waggle_node::images::DockerCli;
use waggle_node::provisioner::PluginProvisioner;
use waggle_node::readiness::ReadinessGate;
use waggle_node::reconciler::TopologyReconciler;
use waggle_node::report::NodeReport;
use waggle_node::shovels::{ShovelManager, ShovelTable};
use waggle_node_lib::{
    CredentialStore, EnrollmentClient, EnrollmentTransport, LocalCertServer, SshConfig,
    run_enrollment_loop,
};

/// Waggle node agent - Keeps node identity and broker topology in shape
#[derive(Parser)]
#[command(name = "waggle-node")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value_os_t = Config::default_path())]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll with beehive and keep retrying until credentials exist
    Register,

    /// Manage shovels between the node and beehive brokers
    Shovels {
        #[command(subcommand)]
        command: ShovelCommands,
    },

    /// Provision and run exactly the given plugin images
    SetPlugins {
        /// Plugin images to run; an empty list stops all plugins
        images: Vec<String>,
    },

    /// Stop node services and remove stored credentials
    Down,

    /// Print a diagnostic report
    Report,
}

#[derive(Subcommand)]
enum ShovelCommands {
    /// Create or update all shovels
    Enable,
    /// Remove all shovels
    Disable,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    init_logging(&config.logging, cli.verbose)?;

    let node = NodeEnv::from_env()?;
    info!("Node {} (sub {})", node.node_id, node.sub_id);

    match cli.command {
        Commands::Register => register(&config, &node).await,
        Commands::Shovels { command } => shovels(&config, &node, command).await,
        Commands::SetPlugins { images } => set_plugins(&config, node, &images).await,
        Commands::Down => down(&config).await,
        Commands::Report => report(&config, &node).await,
    }
}

fn base_filter(verbose: bool) -> EnvFilter {
    let level = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{level},russh=warn,hyper=warn,reqwest=warn,h2=warn"
        ))
    })
}

/// Log to stderr, plus a daily rotated file when `logging.dir` is set.
fn init_logging(settings: &LoggingConfig, verbose: bool) -> Result<()> {
    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let Some(log_dir) = &settings.dir else {
        tracing_subscriber::registry()
            .with(base_filter(verbose))
            .with(stderr_layer)
            .init();
        return Ok(());
    };

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("waggle-node")
        .filename_suffix("log")
        .build(log_dir)
        .context("Failed to create log file appender")?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // Writer must outlive every log call.
    std::mem::forget(guard);

    tracing_subscriber::registry()
        .with(base_filter(verbose))
        .with(stderr_layer)
        .with(
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();

    info!("Logging to: {}", log_dir.display());
    Ok(())
}

fn broker_api(config: &Config) -> Result<Arc<RabbitMqApi>> {
    let api = RabbitMqApi::new(
        &config.broker.username,
        &config.broker.password,
        config.broker.management_url.as_str(),
    )
    .context("Invalid broker management URL")?;
    Ok(Arc::new(api))
}

fn credential_store(config: &Config) -> CredentialStore {
    CredentialStore::new(&config.credentials.dir)
}

async fn register(config: &Config, node: &NodeEnv) -> Result<()> {
    let local = LocalCertServer::new(&node.beehive_host, config.beehive.cert_server_port)?;
    let ssh = SshConfig {
        host: node.beehive_host.clone(),
        port: config.beehive.ssh_port,
        username: config.beehive.ssh_user.clone(),
        key_path: config.credentials.registration_key.clone(),
        timeout: std::time::Duration::from_secs(config.beehive.ssh_timeout_secs),
    };
    let transport = EnrollmentTransport::select(local, ssh);
    info!("Using {} for enrollment", transport.name());

    let client = EnrollmentClient::new(
        credential_store(config),
        transport,
        node.node_id.clone(),
        config.enrollment.pem_policy,
    );

    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();
    let retry_interval = config.enrollment.retry_interval();
    let enrollment = tokio::spawn(async move {
        run_enrollment_loop(&client, retry_interval, loop_cancel).await;
    });

    shutdown_signal().await;
    cancel.cancel();
    enrollment.await.context("Enrollment task panicked")?;
    Ok(())
}

async fn shovels(config: &Config, node: &NodeEnv, command: ShovelCommands) -> Result<()> {
    let api = broker_api(config)?;
    let gate = ReadinessGate::new(api.clone(), config.broker.ready_poll_interval());
    let table = ShovelTable::new(node, &config.beehive, &config.broker, &config.shovels);
    let manager = ShovelManager::new(api, gate, table);

    let report = match command {
        ShovelCommands::Enable => manager.enable().await,
        ShovelCommands::Disable => manager.disable().await,
    };
    check_batch("shovel", &report)
}

async fn set_plugins(config: &Config, node: NodeEnv, images: &[String]) -> Result<()> {
    let api = broker_api(config)?;
    let gate = ReadinessGate::new(api.clone(), config.broker.ready_poll_interval());
    let provisioner = PluginProvisioner::new(api, node, config.plugins.clone());
    let reconciler = TopologyReconciler::new(
        gate,
        Arc::new(DockerCli::default()),
        provisioner,
        Arc::new(DockerCompose::new(config.execution.clone())),
    );

    let report = reconciler.reconcile(images).await;
    let batch = check_batch("plugin", &report.images);
    report
        .converge
        .context("Failed to converge plugin services")?;

    // Single line of service names for callers that script around us.
    println!("{}", report.desired.service_names().collect::<Vec<_>>().join(" "));

    batch
}

async fn down(config: &Config) -> Result<()> {
    let execution = DockerCompose::new(config.execution.clone());
    shut_down_node(&execution, &credential_store(config))
        .await
        .context("Failed to shut down node")?;
    Ok(())
}

async fn report(config: &Config, node: &NodeEnv) -> Result<()> {
    let api = broker_api(config)?;
    let report = NodeReport::gather(
        node,
        &config.credentials.registration_key,
        &credential_store(config),
        &api,
    )
    .await;
    print!("{report}");
    Ok(())
}

fn check_batch(kind: &str, report: &BatchReport) -> Result<()> {
    for (name, e) in report.failed() {
        error!("{} {} failed: {}", kind, name, e);
    }
    if !report.is_success() {
        bail!(
            "{} of {} {}(s) failed",
            report.failure_count(),
            report.items.len(),
            kind
        );
    }
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl-C).
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl-C");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
