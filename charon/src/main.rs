use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use charon::filter::DeviceFilter;
use charon::inventory::Inventory;
use charon::lifecycle::LifecycleHandler;
use charon::prepare::PrepareHandler;
use charon::publisher::{PublishedDevices, Publisher};
use charon::rdma::{self, RdmaNetnsMode};
use charon::status::StatusWriter;
use charon::store::PodConfigStore;

#[derive(Parser)]
#[command(author, version, about = "DRA network-device agent")]
struct Args {
    /// Name of the node this agent runs on
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// DRA driver name to publish devices under
    #[arg(long, default_value = charon::DRIVER_NAME)]
    driver_name: String,

    /// CEL expression filtering which devices are exposed
    #[arg(long)]
    device_filter: Option<String>,

    /// Root of the pinned bpf object filesystem
    #[arg(long, default_value = charon::ebpf::DEFAULT_BPF_FS)]
    bpf_root: PathBuf,

    /// Allow claims to request DHCP configuration
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    enable_dhcp: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let filter = match &args.device_filter {
        Some(expression) => DeviceFilter::compile(expression)?,
        None => DeviceFilter::none(),
    };

    let client = kube::Client::try_default()
        .await
        .context("failed to build kubernetes client")?;

    // the RDMA namespace policy is boot-scoped; read it once
    let rdma_mode = tokio::task::spawn_blocking(rdma::query_netns_mode)
        .await
        .context("rdma mode task panicked")?
        .unwrap_or_else(|err| {
            warn!("RDMA mode query failed, assuming shared: {}", err);
            RdmaNetnsMode::Shared
        });

    // cloud metadata is discovered once and injected; swap the hook for a
    // provider-specific build
    let cloud_hook: charon::CloudNetworkFn = charon::no_cloud_networks;
    let cloud_networks = cloud_hook().unwrap_or_else(|err| {
        warn!("cloud metadata discovery failed: {}", err);
        Default::default()
    });

    let (host_connection, host, _) =
        rtnetlink::new_connection().context("failed to open host netlink connection")?;
    tokio::spawn(host_connection);

    let token = CancellationToken::new();
    let store = Arc::new(PodConfigStore::new());
    let published = PublishedDevices::new();

    let (inventory_tx, inventory_rx) = mpsc::channel(4);
    let inventory = Inventory::new(cloud_networks);
    let publisher = Publisher::new(
        client.clone(),
        args.node_name.clone(),
        args.driver_name.clone(),
        filter,
        rdma_mode,
        published.clone(),
    );

    let inventory_task = tokio::spawn(inventory.run(inventory_tx, token.child_token()));
    let publisher_task = tokio::spawn(publisher.run(inventory_rx, token.child_token()));

    // the request/response handlers: claim preparation from the scheduler
    // side, sandbox lifecycle from the runtime side. The wire plumbing
    // registering them with kubelet and the runtime is provided by the
    // deployment, not by this crate.
    let prepare = PrepareHandler {
        driver_name: args.driver_name.clone(),
        store: store.clone(),
        published: published.clone(),
        host: host.clone(),
        bpf_root: args.bpf_root.clone(),
        ib_root: PathBuf::from(ifprobe::rdma::IB_CLASS),
        dev_root: PathBuf::from(ifprobe::rdma::DEV_INFINIBAND),
        dhcp_enabled: args.enable_dhcp,
    };
    let lifecycle = LifecycleHandler::new(
        args.driver_name.clone(),
        args.node_name.clone(),
        store,
        Some(StatusWriter::new(client)),
        host,
        rdma_mode,
    );
    let _driver = Arc::new(charon::Driver { prepare, lifecycle });

    info!(
        "charon ready on node {} (driver {}, rdma mode {:?})",
        args.node_name, args.driver_name, rdma_mode
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    info!("received SIGINT, shutting down");
    token.cancel();

    let _ = inventory_task.await;
    let _ = publisher_task.await;
    Ok(())
}
