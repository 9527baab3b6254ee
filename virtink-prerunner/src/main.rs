//! virt-prerunner: in-pod bootstrap for the VMM.
//!
//! Decodes the VM spec from `VM_DATA`, assembles the Cloud Hypervisor
//! config, sets up in-pod networking, writes the config for the node daemon
//! and execs the VMM. The daemon drives `vm.create`/`vm.boot` (or
//! `vm.receive-migration` for a migration target) over the API socket.

use std::collections::BTreeSet;
use std::ffi::CString;
use std::path::Path;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod cpuset;
mod netconf;

use virtink_api::cloudhypervisor::{NetConfig, VmConfig};
use virtink_api::vm::VirtualMachine;

use config::{BuildEnv, NetworkPlan};

const VM_CONFIG_PATH: &str = "/var/run/virtink/vm-config.json";
const API_SOCKET_PATH: &str = "/var/run/virtink/ch.sock";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "virt_prerunner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let vm_data = std::env::var("VM_DATA").context("VM_DATA is not set")?;
    let vm: VirtualMachine =
        serde_json::from_slice(&BASE64.decode(vm_data).context("decode VM_DATA")?)
            .context("unmarshal VM")?;
    let receive_migration = std::env::var("RECEIVE_MIGRATION")
        .map(|v| v == "true")
        .unwrap_or(false);

    let env = build_env(&vm)?;
    let vm_config = build_vm_config(&vm, &env).await?;

    tokio::fs::create_dir_all(Path::new(VM_CONFIG_PATH).parent().unwrap())
        .await
        .context("create config dir")?;
    tokio::fs::write(VM_CONFIG_PATH, serde_json::to_vec_pretty(&vm_config)?)
        .await
        .context("write VM config")?;
    info!(path = VM_CONFIG_PATH, receive_migration, "wrote VMM config");

    let fs_shares = vm_config.fs.clone().unwrap_or_default();
    for fs in &fs_shares {
        let shared_dir = format!("/mnt/{}", fs.tag);
        netconf::start_virtiofsd(&fs.socket, Path::new(&shared_dir)).await?;
        info!(tag = %fs.tag, socket = %fs.socket, "started virtiofsd");
    }

    // Hand the process over to the VMM; the daemon takes it from here.
    let argv: Vec<CString> = ["cloud-hypervisor", "--api-socket", API_SOCKET_PATH]
        .iter()
        .map(|arg| CString::new(*arg).expect("static arg"))
        .collect();
    nix::unistd::execvp(&argv[0], &argv).context("exec cloud-hypervisor")?;
    unreachable!("execvp returned");
}

fn build_env(vm: &VirtualMachine) -> Result<BuildEnv> {
    let block_volumes: BTreeSet<String> = std::env::var("BLOCK_VOLUMES")
        .unwrap_or_default()
        .split(',')
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .collect();
    let network_status = match std::env::var("NETWORK_STATUS") {
        Ok(status) if !status.is_empty() => {
            serde_json::from_str(&status).context("parse NETWORK_STATUS")?
        }
        _ => Vec::new(),
    };
    let cpuset = if vm.spec.instance.cpu.dedicated_cpu_placement {
        Some(cpuset::current().context("read pod cpuset")?)
    } else {
        None
    };
    Ok(BuildEnv {
        block_volumes,
        vhost_user_socket: std::env::var("VHOST_USER_SOCKET").ok(),
        network_status,
        cpuset,
        arch: std::env::consts::ARCH,
    })
}

async fn build_vm_config(vm: &VirtualMachine, env: &BuildEnv) -> Result<VmConfig> {
    let plans = config::plan_networks(vm, env)?;

    let mut nets = Vec::new();
    let mut netlink: Option<netconf::NetSetup> = None;
    for plan in &plans {
        match plan {
            NetworkPlan::Bridge {
                iface,
                link_name,
                network_index,
            } => {
                if netlink.is_none() {
                    netlink = Some(netconf::NetSetup::new().await?);
                }
                let mut net = netlink
                    .as_ref()
                    .unwrap()
                    .setup_bridge(link_name, *network_index)
                    .await?;
                net.id = Some(iface.clone());
                nets.push(net);
            }
            NetworkPlan::Masquerade {
                iface,
                link_name,
                network_index,
                ipv4_cidr,
                ipv6_cidr,
                mac,
            } => {
                if netlink.is_none() {
                    netlink = Some(netconf::NetSetup::new().await?);
                }
                let mut net = netlink
                    .as_ref()
                    .unwrap()
                    .setup_masquerade(link_name, *network_index, ipv4_cidr, ipv6_cidr, mac)
                    .await?;
                net.id = Some(iface.clone());
                nets.push(net);
            }
            NetworkPlan::VhostUser { iface, socket, mac } => {
                nets.push(NetConfig {
                    id: Some(iface.clone()),
                    mac: Some(mac.clone()),
                    vhost_user: true,
                    vhost_socket: Some(socket.clone()),
                    num_queues: Some(2),
                    tap: None,
                });
            }
            NetworkPlan::Sriov { .. } => {} // passed through as a VFIO device
        }
    }

    let devices = config::plan_devices(&plans);
    let (serial, console) = config::serial_console();
    let fs = config::plan_filesystems(vm);

    Ok(VmConfig {
        cpus: Some(config::plan_cpu(vm, env)),
        memory: Some(config::plan_memory(vm)?),
        payload: Some(config::plan_payload(vm, env)?),
        disks: Some(config::plan_disks(vm, env)?),
        net: if nets.is_empty() { None } else { Some(nets) },
        fs: if fs.is_empty() { None } else { Some(fs) },
        devices: if devices.is_empty() {
            None
        } else {
            Some(devices)
        },
        vdpa: None,
        serial: Some(serial),
        console: Some(console),
    })
}
