use axum::routing::get;
use axum::Router;
use clap::Parser;
use kube::Client;
use std::time::Duration;
use sts_resize::controller::{self, Options};
use sts_resize::inplace;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sts-resize", about = "Resizes StatefulSet PVCs by backup, recreate and restore")]
struct Args {
    /// Container image containing rsync, used to move data.
    #[arg(long = "sync-image", default_value = "instrumentisto/rsync-ssh")]
    sync_image: String,

    /// ClusterRole to use for the sync jobs. For example, this can be used to
    /// allow the sync job to run as root on a cluster with restrictive pod
    /// security by providing the name of a ClusterRole which permits it.
    #[arg(long = "sync-cluster-role", default_value = "")]
    sync_cluster_role: String,

    /// The address the metric endpoint binds to.
    #[arg(long = "metrics-bind-address", default_value = "0.0.0.0:8080")]
    metrics_bind_address: String,

    /// The address the probe endpoint binds to.
    #[arg(long = "health-probe-bind-address", default_value = "0.0.0.0:8081")]
    health_probe_bind_address: String,

    /// Enable leader election for the controller manager. Enabling this will
    /// ensure there is only one active controller manager.
    #[arg(long = "leader-elect")]
    leader_elect: bool,

    /// Enable in-place update of PVCs. If the underlying storage supports
    /// direct resizing of the PVCs this should be used.
    #[arg(long = "inplace")]
    inplace: bool,

    /// StatefulSets need this label with value "true" to be handled when
    /// in-place resizing is enabled.
    #[arg(
        long = "inplaceLabelName",
        default_value = "sts-resize.pikach.us/resize-inplace"
    )]
    inplace_label_name: String,

    /// Set the log level.
    #[arg(long = "log-level", default_value_t = 0)]
    log_level: u8,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.log_level);
    if let Err(e) = run(args).await {
        error!(error = %e, "setup failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    serve_probes(&args.health_probe_bind_address).await?;
    if args.leader_elect {
        // Singleton operation is enforced by the deployment; the flag is
        // accepted for compatibility with existing manifests.
        info!("leader election is delegated to the deployment");
    }
    info!(address = %args.metrics_bind_address, "metrics endpoint not served by this build");

    let client = Client::try_default().await?;
    if args.inplace {
        info!(label = %args.inplace_label_name, "starting in in-place mode");
        inplace::run(client, args.inplace_label_name).await;
    } else {
        let options = Options {
            sync_image: args.sync_image,
            sync_cluster_role: (!args.sync_cluster_role.is_empty()).then_some(args.sync_cluster_role),
            label_gate: None,
            requeue_after: Duration::from_secs(10),
        };
        info!("starting manager");
        controller::run(client, options).await;
    }
    Ok(())
}

async fn serve_probes(address: &str) -> Result<(), std::io::Error> {
    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }));
    let listener = tokio::net::TcpListener::bind(address).await?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "probe server failed");
        }
    });
    Ok(())
}

fn init_tracing(log_level: u8) {
    let level = match log_level {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
