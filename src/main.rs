//! etcd druid operator
//!
//! Main entry point. Parses flags, sets up the Kubernetes client, optionally
//! waits for leader election, and runs the etcd and custodian controllers.

use clap::Parser;
use kube::Client;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use etcd_druid_operator::{
    adapters::images::ImageVector,
    controllers::{custodian_controller, etcd_controller, Context},
    leader, metrics, utils,
};

/// Path to the image vector enumerating the etcd and backup-restore images
const DEFAULT_IMAGE_VECTOR: &str = "images.yaml";

#[derive(Parser, Debug)]
#[command(name = "etcd-druid-operator", version, about)]
struct Flags {
    /// Number of worker threads of the etcd controller
    #[arg(long, default_value_t = 3)]
    workers: usize,

    /// Number of worker threads of the custodian controller
    #[arg(long, default_value_t = 3)]
    custodian_workers: usize,

    /// The address the metric endpoint binds to
    #[arg(long, default_value = ":8080")]
    metrics_addr: String,

    /// Enable leader election to ensure there is only one active operator
    #[arg(long, default_value_t = false)]
    enable_leader_election: bool,

    /// Name of the resource holding the leader lock
    #[arg(long, default_value = "druid-leader-election")]
    leader_election_id: String,

    /// Resource type backing the leader lock
    #[arg(long, default_value = "configmapsleases")]
    leader_election_resource_lock: String,

    /// If true, reconcile on any change; if false, only when the operation
    /// annotation is present
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    ignore_operation_annotation: bool,

    /// Path to the image vector file
    #[arg(long, default_value = DEFAULT_IMAGE_VECTOR)]
    image_vector: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let flags = Flags::parse();

    info!("Starting etcd druid operator");

    let metrics_addr = utils::parse_bind_addr(&flags.metrics_addr)?;
    let image_vector = ImageVector::load(&flags.image_vector)?;

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    if flags.enable_leader_election {
        if flags.leader_election_resource_lock != "leases" {
            warn!(
                "Lock backend {:?} is handled via leases",
                flags.leader_election_resource_lock
            );
        }
        leader::acquire(client.clone(), flags.leader_election_id.clone()).await?;
    }

    let context = Context::new(
        client.clone(),
        image_vector,
        flags.ignore_operation_annotation,
    );

    let metrics_handle = tokio::spawn(metrics::serve(metrics_addr));
    info!("Metrics server starting on {}", metrics_addr);

    let etcd_handle = tokio::spawn(etcd_controller::run(context.clone(), flags.workers));
    let custodian_handle = tokio::spawn(custodian_controller::run(
        context.clone(),
        flags.custodian_workers,
    ));

    tokio::select! {
        _ = etcd_handle => {
            error!("Etcd controller exited unexpectedly");
        }
        _ = custodian_handle => {
            error!("Custodian controller exited unexpectedly");
        }
        _ = metrics_handle => {
            error!("Metrics server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
        }
    }

    info!("etcd druid operator stopped");
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,etcd_druid_operator=debug,kube=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
