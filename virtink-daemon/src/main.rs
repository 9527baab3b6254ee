//! virt-daemon: per-node agent for Virtink VMs.
//!
//! Watches VirtualMachines scheduled to this node, drives the local VMM
//! through its pod socket, performs hotplug mount and cgroup operations and
//! runs the migration data plane.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::Controller;
use kube::runtime::events::Reporter;
use kube::runtime::watcher;
use kube::Client;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cgroup;
mod hotplug;
mod migration;
mod pid;
mod tls;
mod vm;

use virtink_api::vm::VirtualMachine;

/// Virtink node daemon
#[derive(Parser, Debug)]
#[command(name = "virt-daemon", version, about)]
struct Args {
    /// Name of the node this daemon runs on
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// Address other daemons reach this node at
    #[arg(long, env = "NODE_IP")]
    node_ip: String,

    /// Root of the kubelet pod directories
    #[arg(long, default_value = "/var/lib/kubelet/pods")]
    kubelet_pods_dir: PathBuf,

    /// Directory holding the daemon certificates (ca.crt, tls.crt, tls.key)
    #[arg(long, default_value = "/var/lib/virtink/daemon/cert")]
    cert_dir: PathBuf,

    /// Directory for hotplug volume mount records
    #[arg(long, default_value = hotplug::MOUNT_RECORD_DIR)]
    record_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "virt_daemon=info,kube=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let node_name = args.node_name.unwrap_or_else(|| {
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_owned())
    });

    let client = Client::try_default()
        .await
        .context("create Kubernetes client")?;

    info!(node = %node_name, node_ip = %args.node_ip, "starting virt-daemon");

    let ctx = Arc::new(vm::Context {
        client: client.clone(),
        reporter: Reporter {
            controller: "virt-daemon".into(),
            instance: Some(node_name.clone()),
        },
        node_name,
        node_ip: args.node_ip,
        kubelet_pods_dir: args.kubelet_pods_dir,
        cert_dir: args.cert_dir,
        record_dir: args.record_dir,
        migrations: migration::MigrationControlBlocks::default(),
    });

    let vms: Api<VirtualMachine> = Api::all(client);
    Controller::new(vms, watcher::Config::default())
        .run(vm::reconcile, vm::error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((vm, _)) => tracing::debug!(vm = %vm.name, "reconciled VM"),
                Err(e) => warn!(error = %e, "daemon controller error"),
            }
        })
        .await;

    Ok(())
}
