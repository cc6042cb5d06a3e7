use std::sync::Arc;

use clap::Parser;
use tenant_sdn::config::{Cli, Commands, ControllerArgs};
use tenant_sdn::dataplane::{Dataplane, NoopDataplane};
use tenant_sdn::master::{self, MasterConfig};
use tenant_sdn::node::{NodeConfig, NodeView};
use tenant_sdn::registry::{Node, Registry};
use tenant_sdn::{Result, http};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Controller(args) => run_controller(args).await?,
    }
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    setup_subscriber();

    let registry = Arc::new(Registry::new());
    let dataplane: Arc<dyn Dataplane> = Arc::new(NoopDataplane);
    let cancel = CancellationToken::new();

    let mut master_handle = None;
    if args.master {
        info!("starting master reconcilers");
        let mut config = MasterConfig::new(
            args.cluster_cidr.clone(),
            args.host_subnet_bits,
            args.service_cidr.clone(),
        );
        config.vnid_min = args.vnid_min;
        config.vnid_max = args.vnid_max;
        master_handle = Some(tokio::spawn(master::start(
            config,
            registry.clone(),
            dataplane.clone(),
            cancel.child_token(),
        )));
    }

    let mut node_handle = None;
    let ready;
    if args.node {
        info!("starting node view for {}", args.node_name);
        // register ourselves the way a kubelet would
        let node = Node::new(args.node_name.clone(), args.node_ip.clone());
        if let Err(e) = registry.nodes().create(node)
            && !e.is_already_exists()
        {
            return Err(e.into());
        }
        let view = NodeView::new(
            NodeConfig::new(args.node_name.clone(), args.mtu),
            registry.clone(),
            dataplane.clone(),
        );
        ready = view.ready_token();
        node_handle = Some(tokio::spawn(view.run(cancel.child_token())));
    } else {
        // master-only deployments are ready as soon as they are up
        ready = CancellationToken::new();
        ready.cancel();
    }

    let mut status_handle = tokio::spawn(http::serve(
        args.status_address,
        ready,
        cancel.child_token(),
    ));
    let mut shutdown_handle = tokio::spawn(shutdown_signal());

    tokio::select! {
        h = &mut status_handle => exit("status", h),
        _ = &mut shutdown_handle => {
            cancel.cancel();
            if let Err(e) = status_handle.await {
                error!("status listener task failed to complete: {e}");
            }
        }
    }
    for (name, handle) in [("master", master_handle), ("node", node_handle)] {
        if let Some(handle) = handle {
            exit(name, handle.await);
        }
    }
    info!("exiting...");
    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tenant_sdn=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {
            info!("captured ctrl_c signal");
        },
        _ = terminate => {},
    }
}

fn exit(task: &str, out: Result<Result<()>, JoinError>) {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited")
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}")
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}")
        }
    }
}
