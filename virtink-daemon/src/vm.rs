//! Node-side VM reconciler.
//!
//! Executes only for VMs scheduled to this node (or migrating to it):
//! boots the VMM through its pod-local socket, applies one-shot power
//! actions, drives hotplug disk attach/detach, and runs the migration
//! state machine together with the peer daemon.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use tokio::time::{sleep, timeout};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use virtink_api::cloudhypervisor::{self, Client as ChClient, DiskConfig, VmConfig};
use virtink_api::migration::VirtualMachineMigrationPhase;
use virtink_api::vm::{
    VirtualMachine, VirtualMachinePhase, VirtualMachinePowerAction, Volume, VolumePhase,
};
use virtink_api::volume as volumeutil;
use virtink_api::RunPolicy;

use crate::cgroup::{self, DeviceRule};
use crate::hotplug::{self, MountRecordEntry};
use crate::migration::{self, DriverState, MigrationControlBlocks};
use crate::pid::pid_of_socket;
use crate::tls;

const VM_NAME_LABEL: &str = "virtink.io/vm.name";
const HOTPLUG_POD_LABEL: &str = "virtink.io/hotplug-volume-pod";

/// Covers VFIO page tables on top of guest memory when raising
/// RLIMIT_MEMLOCK for passthrough devices.
const MEMLOCK_HEADROOM: i64 = 1 << 30;

const TARGET_SOCKET_POLL: Duration = Duration::from_secs(1);
const TARGET_SOCKET_DEADLINE: Duration = Duration::from_secs(3);
const TARGET_VMM_POLL: Duration = Duration::from_secs(1);
const TARGET_VMM_DEADLINE: Duration = Duration::from_secs(10);
const RESYNC_PERIOD: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes API: {0}")]
    Kube(#[from] kube::Error),
    #[error("VMM API: {0}")]
    Ch(#[from] cloudhypervisor::Error),
    #[error("serialize: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct Context {
    pub client: Client,
    pub reporter: Reporter,
    pub node_name: String,
    pub node_ip: String,
    pub kubelet_pods_dir: PathBuf,
    pub cert_dir: PathBuf,
    pub record_dir: PathBuf,
    pub migrations: MigrationControlBlocks,
}

impl Context {
    fn recorder(&self, vm: &VirtualMachine) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone(), vm.object_ref(&()))
    }

    fn pod_empty_dir(&self, pod_uid: &str, volume: &str) -> PathBuf {
        self.kubelet_pods_dir
            .join(pod_uid)
            .join("volumes/kubernetes.io~empty-dir")
            .join(volume)
    }

    fn ch_socket(&self, pod_uid: &str) -> PathBuf {
        self.pod_empty_dir(pod_uid, "virtink").join("ch.sock")
    }

    fn vm_config_path(&self, pod_uid: &str) -> PathBuf {
        self.pod_empty_dir(pod_uid, "virtink").join("vm-config.json")
    }

    fn rx_socket(&self, pod_uid: &str) -> PathBuf {
        self.pod_empty_dir(pod_uid, "virtink").join("rx.sock")
    }

    fn tx_socket(&self, pod_uid: &str) -> PathBuf {
        self.pod_empty_dir(pod_uid, "virtink").join("tx.sock")
    }

    fn hotplug_dir(&self, pod_uid: &str) -> PathBuf {
        self.pod_empty_dir(pod_uid, "hotplug-volumes")
    }

    fn volume_pod_socket(&self, pod_uid: &str) -> PathBuf {
        self.pod_empty_dir(pod_uid, "hotplug").join("hp.sock")
    }
}

fn is_source(vm: &VirtualMachine, ctx: &Context) -> bool {
    vm.status
        .as_ref()
        .map(|s| !s.node_name.is_empty() && s.node_name == ctx.node_name)
        .unwrap_or(false)
}

fn is_migration_target(vm: &VirtualMachine, ctx: &Context) -> bool {
    vm.status
        .as_ref()
        .and_then(|s| s.migration.as_ref())
        .map(|m| m.target_node_name == ctx.node_name)
        .unwrap_or(false)
}

pub async fn reconcile(vm: Arc<VirtualMachine>, ctx: Arc<Context>) -> Result<Action, Error> {
    if !is_source(&vm, &ctx) && !is_migration_target(&vm, &ctx) {
        return Ok(Action::await_change());
    }

    let namespace = vm.namespace().unwrap_or_default();
    let name = vm.name_any();
    let api: Api<VirtualMachine> = Api::namespaced(ctx.client.clone(), &namespace);

    let mut vm = (*vm).clone();
    let observed_status = vm.status.clone();

    if let Err(e) = reconcile_vm(&mut vm, &ctx).await {
        let _ = ctx
            .recorder(&vm)
            .publish(Event {
                type_: EventType::Warning,
                reason: "FailedReconcile".into(),
                note: Some(format!("Failed to reconcile VM: {}", e)),
                action: "Reconcile".into(),
                secondary: None,
            })
            .await;
        return Err(e);
    }

    if vm.status != observed_status {
        match api
            .replace_status(&name, &PostParams::default(), serde_json::to_vec(&vm)?)
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                return Ok(Action::requeue(Duration::from_secs(1)));
            }
            Err(e) => return Err(e.into()),
        }
    }

    // The VMM is polled, not watched.
    Ok(Action::requeue(RESYNC_PERIOD))
}

pub fn error_policy(vm: Arc<VirtualMachine>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(vm = %vm.name_any(), error = %error, "daemon reconcile failed");
    Action::requeue(Duration::from_secs(5))
}

async fn reconcile_vm(vm: &mut VirtualMachine, ctx: &Context) -> Result<(), Error> {
    let phase = vm.status.as_ref().and_then(|s| s.phase);
    let deleting = vm.metadata.deletion_timestamp.is_some();
    if deleting || phase.map(|p| p.is_terminal()).unwrap_or(false) {
        return cleanup_vm(vm, ctx).await;
    }

    match phase {
        Some(VirtualMachinePhase::Scheduled) if is_source(vm, ctx) => {
            reconcile_scheduled(vm, ctx).await
        }
        Some(VirtualMachinePhase::Running) => {
            let migrating = vm
                .status
                .as_ref()
                .and_then(|s| s.migration.as_ref())
                .is_some();
            if migrating {
                reconcile_migration(vm, ctx).await
            } else if is_source(vm, ctx) {
                reconcile_running(vm, ctx).await
            } else {
                Ok(())
            }
        }
        _ => Ok(()),
    }
}

/// Scheduled: mount hotplug volumes, then create and boot the VMM from the
/// config the pre-runner wrote.
async fn reconcile_scheduled(vm: &mut VirtualMachine, ctx: &Context) -> Result<(), Error> {
    let pod_uid = vm
        .status
        .as_ref()
        .map(|s| s.vm_pod_uid.clone())
        .unwrap_or_default();
    if pod_uid.is_empty() {
        return Ok(());
    }

    mount_attached_volumes(vm, ctx).await?;

    let socket = ctx.ch_socket(&pod_uid);
    if !socket.exists() {
        return Ok(());
    }
    let ch = ChClient::new(&socket);
    match ch.vm_info().await {
        Err(e) if e.is_not_created() => {
            let config: VmConfig = serde_json::from_slice(
                &std::fs::read(ctx.vm_config_path(&pod_uid))
                    .map_err(|e| anyhow::anyhow!("read VM config: {}", e))?,
            )?;

            let vmm_pid = pid_of_socket(&socket)?;
            ensure_device_cgroup(vm, ctx, vmm_pid)?;

            ch.vm_create(&config).await?;
            ch.vm_boot().await?;
            info!(vm = %vm.name_any(), "created and booted VMM");
            let _ = ctx
                .recorder(vm)
                .publish(Event {
                    type_: EventType::Normal,
                    reason: "StartedVM".into(),
                    note: Some("Created and booted the VMM".into()),
                    action: "Boot".into(),
                    secondary: None,
                })
                .await;

            let has_passthrough = config.devices.as_ref().map(|d| !d.is_empty()).unwrap_or(false)
                || config.vdpa.as_ref().map(|v| !v.is_empty()).unwrap_or(false);
            if has_passthrough {
                let memory_size = config.memory.as_ref().map(|m| m.size).unwrap_or(0);
                raise_memlock(vmm_pid, memory_size + MEMLOCK_HEADROOM)?;
            }
        }
        Err(e) => return Err(e.into()),
        Ok(info) if info.state == "Running" || info.state == "Paused" => {
            vm.status.get_or_insert_with(Default::default).phase =
                Some(VirtualMachinePhase::Running);
        }
        Ok(_) => {}
    }
    Ok(())
}

/// Running, no migration: apply the run policy and one-shot power actions,
/// reconcile hotplug disks, track guest shutdown.
async fn reconcile_running(vm: &mut VirtualMachine, ctx: &Context) -> Result<(), Error> {
    let pod_uid = vm
        .status
        .as_ref()
        .map(|s| s.vm_pod_uid.clone())
        .unwrap_or_default();
    if pod_uid.is_empty() {
        return Ok(());
    }
    let ch = ChClient::new(ctx.ch_socket(&pod_uid));

    if vm.spec.run_policy == Some(RunPolicy::Halted) {
        match ch.vm_info().await {
            Ok(info) if info.state == "Shutdown" => {
                vm.status.get_or_insert_with(Default::default).phase =
                    Some(VirtualMachinePhase::Succeeded);
            }
            Ok(_) => {
                if let Err(e) = ch.vm_shutdown().await {
                    let _ = ctx
                        .recorder(vm)
                        .publish(Event {
                            type_: EventType::Warning,
                            reason: "FailedPowerOff".into(),
                            note: Some(format!("Failed to power off VM: {}", e)),
                            action: "PowerOff".into(),
                            secondary: None,
                        })
                        .await;
                    return Err(e.into());
                }
            }
            Err(e) if e.is_not_created() => {}
            Err(e) => return Err(e.into()),
        }
        return Ok(());
    }

    let action = vm.status.as_ref().and_then(|s| s.power_action);
    if let Some(action) = action {
        apply_power_action(&ch, vm, ctx, action).await;
        // Single-shot: cleared no matter how the VMM call went.
        if let Some(status) = vm.status.as_mut() {
            status.power_action = None;
        }
    }

    mount_attached_volumes(vm, ctx).await?;
    attach_mounted_volumes(vm, ctx, &ch).await?;
    detach_volumes(vm, ctx, &ch).await?;

    match ch.vm_info().await {
        Ok(info) if info.state == "Shutdown" => {
            vm.status.get_or_insert_with(Default::default).phase =
                Some(VirtualMachinePhase::Succeeded);
        }
        Ok(_) => {}
        Err(e) if e.is_not_created() => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// The VMM call a power action maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmOp {
    Shutdown,
    PowerButton,
    Reboot,
    Pause,
    Resume,
}

pub fn power_action_op(action: VirtualMachinePowerAction) -> Option<(VmmOp, &'static str, &'static str)> {
    match action {
        VirtualMachinePowerAction::PowerOff => {
            Some((VmmOp::Shutdown, "PoweredOff", "FailedPowerOff"))
        }
        VirtualMachinePowerAction::Shutdown => {
            Some((VmmOp::PowerButton, "Shutdown", "FailedShutdown"))
        }
        VirtualMachinePowerAction::Reset => Some((VmmOp::Reboot, "Reset", "FailedReset")),
        VirtualMachinePowerAction::Reboot => Some((VmmOp::Reboot, "Rebooted", "FailedReboot")),
        VirtualMachinePowerAction::Pause => Some((VmmOp::Pause, "Paused", "FailedPause")),
        VirtualMachinePowerAction::Resume => Some((VmmOp::Resume, "Resumed", "FailedResume")),
        // PowerOn restarts a terminal VM; the cluster reconciler owns it.
        VirtualMachinePowerAction::PowerOn => None,
    }
}

async fn apply_power_action(
    ch: &ChClient,
    vm: &VirtualMachine,
    ctx: &Context,
    action: VirtualMachinePowerAction,
) {
    let Some((op, ok_reason, fail_reason)) = power_action_op(action) else {
        return;
    };
    let result = match op {
        VmmOp::Shutdown => ch.vm_shutdown().await,
        VmmOp::PowerButton => ch.vm_power_button().await,
        VmmOp::Reboot => ch.vm_reboot().await,
        VmmOp::Pause => ch.vm_pause().await,
        VmmOp::Resume => ch.vm_resume().await,
    };
    let event = match result {
        Ok(()) => {
            info!(vm = %vm.name_any(), action = ?action, "applied power action");
            Event {
                type_: EventType::Normal,
                reason: ok_reason.into(),
                note: Some(format!("Applied power action {:?}", action)),
                action: "Power".into(),
                secondary: None,
            }
        }
        Err(e) => {
            warn!(vm = %vm.name_any(), action = ?action, error = %e, "power action failed");
            Event {
                type_: EventType::Warning,
                reason: fail_reason.into(),
                note: Some(format!("Failed to apply power action {:?}: {}", action, e)),
                action: "Power".into(),
                secondary: None,
            }
        }
    };
    let _ = ctx.recorder(vm).publish(event).await;
}

/// Ensure the VMM's device cgroup covers the baseline devices plus the
/// block devices of its non-hotplug PVC volumes and every mounted hotplug
/// block volume.
fn ensure_device_cgroup(vm: &VirtualMachine, ctx: &Context, vmm_pid: i32) -> Result<(), Error> {
    let mut rules = cgroup::baseline_rules();
    for volume in &vm.spec.volumes {
        if volume.pvc_name().is_none() || volume.is_hotpluggable() {
            continue;
        }
        let path = format!("/proc/{}/root/mnt/{}", vmm_pid, volume.name);
        if let Some((major, minor)) = block_device_numbers(&path) {
            rules.push(DeviceRule::allow_block(major, minor));
        }
    }
    let vm_uid = vm.uid().unwrap_or_default();
    for entry in hotplug::read_record(&ctx.record_dir, &vm_uid).unwrap_or_default() {
        if !entry.target.ends_with(".img") {
            if let Some((major, minor)) = block_device_numbers(&entry.target) {
                rules.push(DeviceRule::allow_block(major, minor));
            }
        }
    }
    cgroup::manager_for_pid(vmm_pid)?.set(&rules)?;
    Ok(())
}

fn block_device_numbers(path: &str) -> Option<(i64, i64)> {
    let stat = nix::sys::stat::stat(path).ok()?;
    if stat.st_mode & libc::S_IFMT != libc::S_IFBLK {
        return None;
    }
    let rdev = stat.st_rdev;
    Some((
        unsafe { libc::major(rdev) } as i64,
        unsafe { libc::minor(rdev) } as i64,
    ))
}

fn raise_memlock(pid: i32, bytes: i64) -> Result<(), Error> {
    let limit = libc::rlimit64 {
        rlim_cur: bytes as u64,
        rlim_max: bytes as u64,
    };
    let ret = unsafe {
        libc::prlimit64(pid, libc::RLIMIT_MEMLOCK, &limit, std::ptr::null_mut())
    };
    if ret != 0 {
        return Err(anyhow::anyhow!(
            "raise RLIMIT_MEMLOCK of pid {}: {}",
            pid,
            std::io::Error::last_os_error()
        )
        .into());
    }
    info!(pid, bytes, "raised RLIMIT_MEMLOCK for passthrough devices");
    Ok(())
}

/// The running volume pod holding this VM's ready hotplug set, if any.
async fn find_volume_pod(vm: &VirtualMachine, ctx: &Context) -> Result<Option<Pod>, Error> {
    let namespace = vm.namespace().unwrap_or_default();
    let vm_pod_uid = vm
        .status
        .as_ref()
        .map(|s| s.vm_pod_uid.clone())
        .unwrap_or_default();
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let lp = ListParams::default().labels(&format!(
        "{}={},{}",
        VM_NAME_LABEL,
        vm.name_any(),
        HOTPLUG_POD_LABEL
    ));
    let pod = pods.list(&lp).await?.items.into_iter().find(|p| {
        let controlled = p
            .metadata
            .owner_references
            .as_ref()
            .map(|refs| {
                refs.iter()
                    .any(|r| r.controller == Some(true) && r.uid == vm_pod_uid)
            })
            .unwrap_or(false);
        let running = p
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .map(|phase| phase == "Running")
            .unwrap_or(false);
        controlled && running
    });
    Ok(pod)
}

/// Walk AttachedToNode volumes into the VM pod (MountedToPod). The record
/// file is rewritten before each mount so cleanup can always undo it.
async fn mount_attached_volumes(vm: &mut VirtualMachine, ctx: &Context) -> Result<(), Error> {
    let attached: Vec<String> = vm
        .status
        .as_ref()
        .map(|s| {
            s.volume_status
                .iter()
                .filter(|v| v.phase == Some(VolumePhase::AttachedToNode))
                .map(|v| v.name.clone())
                .collect()
        })
        .unwrap_or_default();
    if attached.is_empty() {
        return Ok(());
    }

    let Some(volume_pod) = find_volume_pod(vm, ctx).await? else {
        return Ok(());
    };
    let vm_uid = vm.uid().unwrap_or_default();
    let vm_pod_uid = vm
        .status
        .as_ref()
        .map(|s| s.vm_pod_uid.clone())
        .unwrap_or_default();
    let namespace = vm.namespace().unwrap_or_default();
    let volume_pod_uid = volume_pod.uid().unwrap_or_default();

    let mut record = hotplug::read_record(&ctx.record_dir, &vm_uid)?;
    for name in attached {
        let Some(volume) = vm.spec.volumes.iter().find(|v| v.name == name).cloned() else {
            continue;
        };
        mount_hotplug_volume(
            vm,
            ctx,
            &volume,
            &namespace,
            &vm_uid,
            &vm_pod_uid,
            &volume_pod_uid,
            &mut record,
        )
        .await?;
        set_volume_phase(vm, &name, VolumePhase::MountedToPod);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn mount_hotplug_volume(
    vm: &VirtualMachine,
    ctx: &Context,
    volume: &Volume,
    namespace: &str,
    vm_uid: &str,
    vm_pod_uid: &str,
    volume_pod_uid: &str,
    record: &mut Vec<MountRecordEntry>,
) -> Result<(), Error> {
    let hotplug_dir = ctx.hotplug_dir(vm_pod_uid);
    let pod_socket = ctx.volume_pod_socket(volume_pod_uid);
    let pod_pid = pid_of_socket(&pod_socket)?;
    let is_block = volumeutil::is_block(&ctx.client, namespace, volume).await?;

    if is_block {
        let device_path = format!("/proc/{}/root/mnt/{}", pod_pid, volume.name);
        let (major, minor) = block_device_numbers(&device_path)
            .ok_or_else(|| anyhow::anyhow!("volume {:?} has no block device", volume.name))?;
        let target = hotplug_dir.join(&volume.name);

        push_record(record, &volume.name, &target.to_string_lossy());
        hotplug::write_record(&ctx.record_dir, vm_uid, record)?;
        hotplug::mount_block_volume(&target, major as u64, minor as u64)?;

        let vmm_pid = pid_of_socket(&ctx.ch_socket(vm_pod_uid))?;
        ensure_device_cgroup(vm, ctx, vmm_pid)?;
    } else {
        let entries = hotplug::read_mountinfo(pod_pid)?;
        let entry = hotplug::find_volume_mount(&entries, &volume.name)
            .ok_or_else(|| anyhow::anyhow!("volume {:?} not mounted in volume pod", volume.name))?;
        let host_entries = hotplug::read_mountinfo(1)?;
        let host_mount = hotplug::resolve_host_mount(&host_entries, entry, volume_pod_uid)
            .ok_or_else(|| {
                anyhow::anyhow!("host mount of volume {:?} not found", volume.name)
            })?;
        let source = PathBuf::from(host_mount).join("disk.img");
        let target = hotplug_dir.join(format!("{}.img", volume.name));

        push_record(record, &volume.name, &target.to_string_lossy());
        hotplug::write_record(&ctx.record_dir, vm_uid, record)?;
        hotplug::mount_fs_volume(&source, &target)?;
    }
    Ok(())
}

fn push_record(record: &mut Vec<MountRecordEntry>, volume: &str, target: &str) {
    if !record.iter().any(|e| e.volume == volume) {
        record.push(MountRecordEntry {
            volume: volume.to_owned(),
            target: target.to_owned(),
        });
    }
}

/// Add every MountedToPod volume to the VMM's live disk list (Ready).
async fn attach_mounted_volumes(
    vm: &mut VirtualMachine,
    ctx: &Context,
    ch: &ChClient,
) -> Result<(), Error> {
    let mounted: Vec<String> = vm
        .status
        .as_ref()
        .map(|s| {
            s.volume_status
                .iter()
                .filter(|v| v.phase == Some(VolumePhase::MountedToPod))
                .map(|v| v.name.clone())
                .collect()
        })
        .unwrap_or_default();
    if mounted.is_empty() {
        return Ok(());
    }

    let vm_uid = vm.uid().unwrap_or_default();
    let record = hotplug::read_record(&ctx.record_dir, &vm_uid)?;
    for name in mounted {
        let Some(entry) = record.iter().find(|e| e.volume == name) else {
            continue;
        };
        // Path as the VMM sees it inside the pod.
        let file_name = std::path::Path::new(&entry.target)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());
        let read_only = vm
            .spec
            .instance
            .disks
            .iter()
            .find(|d| d.name == name)
            .and_then(|d| d.read_only)
            .unwrap_or(false);
        ch.vm_add_disk(&DiskConfig {
            path: format!("/hotplug-volumes/{}", file_name),
            readonly: read_only,
            id: Some(name.clone()),
        })
        .await?;
        info!(vm = %vm.name_any(), volume = %name, "hotplugged disk");
        set_volume_phase(vm, &name, VolumePhase::Ready);
    }
    Ok(())
}

/// Detach volumes the cluster reconciler marked Detaching: remove the disk
/// from the VMM, undo the mount, clear record and status entries.
async fn detach_volumes(vm: &mut VirtualMachine, ctx: &Context, ch: &ChClient) -> Result<(), Error> {
    let detaching: Vec<String> = vm
        .status
        .as_ref()
        .map(|s| {
            s.volume_status
                .iter()
                .filter(|v| v.phase == Some(VolumePhase::Detaching))
                .map(|v| v.name.clone())
                .collect()
        })
        .unwrap_or_default();
    if detaching.is_empty() {
        return Ok(());
    }

    let live_disks: Vec<String> = match ch.vm_info().await {
        Ok(info) => info
            .config
            .disks
            .unwrap_or_default()
            .into_iter()
            .filter_map(|d| d.id)
            .collect(),
        Err(e) if e.is_not_created() => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    let vm_uid = vm.uid().unwrap_or_default();
    let vm_pod_uid = vm
        .status
        .as_ref()
        .map(|s| s.vm_pod_uid.clone())
        .unwrap_or_default();
    let mut record = hotplug::read_record(&ctx.record_dir, &vm_uid)?;
    for name in detaching {
        if live_disks.iter().any(|id| id == &name) {
            ch.vm_remove_device(&name).await?;
            info!(vm = %vm.name_any(), volume = %name, "removed hotplugged disk");
        }
        if let Some(pos) = record.iter().position(|e| e.volume == name) {
            let entry = record.remove(pos);
            hotplug::write_record(&ctx.record_dir, &vm_uid, &record)?;
            let target = PathBuf::from(&entry.target);
            if entry.target.ends_with(".img") {
                hotplug::unmount_fs_volume(&target)?;
            } else {
                hotplug::unmount_block_volume(&target)?;
                if let Ok(vmm_pid) = pid_of_socket(&ctx.ch_socket(&vm_pod_uid)) {
                    ensure_device_cgroup(vm, ctx, vmm_pid)?;
                }
            }
        }
        if let Some(status) = vm.status.as_mut() {
            status.volume_status.retain(|v| v.name != name);
        }
    }
    Ok(())
}

fn set_volume_phase(vm: &mut VirtualMachine, name: &str, phase: VolumePhase) {
    if let Some(status) = vm.status.as_mut() {
        if let Some(entry) = status.volume_status.iter_mut().find(|v| v.name == name) {
            entry.phase = Some(phase);
        }
    }
}

/// The migration state machine; source and target daemons each own their
/// transitions and meet through the VM's migration slot.
async fn reconcile_migration(vm: &mut VirtualMachine, ctx: &Context) -> Result<(), Error> {
    let Some(mut migration) = vm.status.as_ref().and_then(|s| s.migration.clone()) else {
        return Ok(());
    };
    let vm_uid = vm.uid().unwrap_or_default();
    let target_side = migration.target_node_name == ctx.node_name;
    let source_side = is_source(vm, ctx);

    match migration.phase {
        Some(VirtualMachineMigrationPhase::Scheduled) if target_side => {
            let socket = ctx.ch_socket(&migration.target_vm_pod_uid);
            if !wait_for_path(&socket, TARGET_SOCKET_POLL, TARGET_SOCKET_DEADLINE).await {
                return Ok(());
            }

            let block = ctx.migrations.get_or_insert(&vm_uid);
            let already_started = {
                let mut guard = block.lock().expect("control block poisoned");
                guard.recv_state() != DriverState::NotStarted
            };
            if !already_started {
                let cancel = CancellationToken::new();
                migration::start_receive_driver(&block, socket, cancel.clone());
                let acceptor = TlsAcceptor::from(Arc::new(tls::server_config(&ctx.cert_dir)?));
                let port = migration::start_tcp_to_socket_relay(
                    acceptor,
                    ctx.rx_socket(&migration.target_vm_pod_uid),
                    cancel,
                )
                .await?;
                migration.target_node_ip = ctx.node_ip.clone();
                migration.target_node_port = Some(port as i32);
                migration.phase = Some(VirtualMachineMigrationPhase::TargetReady);
                info!(vm = %vm.name_any(), port, "migration target ready");
            }
        }
        Some(VirtualMachineMigrationPhase::TargetReady) if source_side => {
            let vm_pod_uid = vm
                .status
                .as_ref()
                .map(|s| s.vm_pod_uid.clone())
                .unwrap_or_default();
            let block = ctx.migrations.get_or_insert(&vm_uid);
            let already_started = {
                let mut guard = block.lock().expect("control block poisoned");
                guard.send_state() != DriverState::NotStarted
            };
            if !already_started {
                let cancel = CancellationToken::new();
                let connector = TlsConnector::from(Arc::new(tls::client_config(&ctx.cert_dir)?));
                let target_addr = format!(
                    "{}:{}",
                    migration.target_node_ip,
                    migration.target_node_port.unwrap_or_default()
                );
                migration::start_socket_to_tcp_relay(
                    ctx.tx_socket(&vm_pod_uid),
                    connector,
                    target_addr,
                    cancel.clone(),
                )
                .await?;
                migration::start_send_driver(&block, ctx.ch_socket(&vm_pod_uid), cancel);
                migration.phase = Some(VirtualMachineMigrationPhase::Running);
                info!(vm = %vm.name_any(), "migration send started");
            }
        }
        Some(VirtualMachineMigrationPhase::Running) if source_side => {
            let send_state = ctx
                .migrations
                .get(&vm_uid)
                .map(|block| block.lock().expect("control block poisoned").send_state())
                .unwrap_or(DriverState::NotStarted);
            if let DriverState::Failed(e) = send_state {
                migration.phase = Some(VirtualMachineMigrationPhase::Failed);
                let _ = ctx
                    .recorder(vm)
                    .publish(Event {
                        type_: EventType::Warning,
                        reason: "FailedMigrate".into(),
                        note: Some(format!("Migration send failed: {}", e)),
                        action: "Migrate".into(),
                        secondary: None,
                    })
                    .await;
            } else {
                let namespace = vm.namespace().unwrap_or_default();
                let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
                let pod_name = vm
                    .status
                    .as_ref()
                    .map(|s| s.vm_pod_name.clone())
                    .unwrap_or_default();
                let pod_phase = pods
                    .get_opt(&pod_name)
                    .await?
                    .and_then(|p| p.status.and_then(|s| s.phase))
                    .unwrap_or_default();
                match pod_phase.as_str() {
                    "Succeeded" => {
                        // The source VMM exited after handing the guest over;
                        // tear the tunnel down and release this node's mounts.
                        if let Some(block) = ctx.migrations.get(&vm_uid) {
                            block.lock().expect("control block poisoned").cancel_all();
                        }
                        cleanup_mounts(vm, ctx);
                        migration.phase = Some(VirtualMachineMigrationPhase::Sent);
                        info!(vm = %vm.name_any(), "migration stream sent");
                    }
                    "Failed" => {
                        migration.phase = Some(VirtualMachineMigrationPhase::Failed);
                        let _ = ctx
                            .recorder(vm)
                            .publish(Event {
                                type_: EventType::Warning,
                                reason: "FailedMigrate".into(),
                                note: Some("Source VM pod failed during migration".into()),
                                action: "Migrate".into(),
                                secondary: None,
                            })
                            .await;
                    }
                    _ => {}
                }
            }
        }
        Some(VirtualMachineMigrationPhase::Sent) if target_side => {
            let ch = ChClient::new(ctx.ch_socket(&migration.target_vm_pod_uid));
            let running = wait_for_vmm_running(&ch).await;
            if running {
                migration.phase = Some(VirtualMachineMigrationPhase::Succeeded);
                let status = vm.status.get_or_insert_with(Default::default);
                status.node_name = migration.target_node_name.clone();
                status.vm_pod_name = migration.target_vm_pod_name.clone();
                status.vm_pod_uid = migration.target_vm_pod_uid.clone();
                ctx.migrations.drop_block(&vm_uid);
                info!(vm = %vm.name_any(), node = %migration.target_node_name, "migration succeeded");
                let _ = ctx
                    .recorder(vm)
                    .publish(Event {
                        type_: EventType::Normal,
                        reason: "Migrated".into(),
                        note: Some(format!("Migrated VM to node {}", migration.target_node_name)),
                        action: "Migrate".into(),
                        secondary: None,
                    })
                    .await;
            } else {
                migration.phase = Some(VirtualMachineMigrationPhase::Failed);
                let _ = ctx
                    .recorder(vm)
                    .publish(Event {
                        type_: EventType::Warning,
                        reason: "FailedMigrate".into(),
                        note: Some("Target VMM did not reach Running in time".into()),
                        action: "Migrate".into(),
                        secondary: None,
                    })
                    .await;
            }
        }
        Some(VirtualMachineMigrationPhase::Succeeded) | Some(VirtualMachineMigrationPhase::Failed) => {
            // The source VMM is left untouched on failure; the user retries
            // with a fresh migration.
            ctx.migrations.drop_block(&vm_uid);
        }
        _ => {}
    }

    if let Some(status) = vm.status.as_mut() {
        status.migration = Some(migration);
    }
    Ok(())
}

async fn wait_for_path(path: &std::path::Path, poll: Duration, deadline: Duration) -> bool {
    let wait = async {
        while !path.exists() {
            sleep(poll).await;
        }
    };
    timeout(deadline, wait).await.is_ok()
}

async fn wait_for_vmm_running(ch: &ChClient) -> bool {
    let wait = async {
        loop {
            if let Ok(info) = ch.vm_info().await {
                if info.state == "Running" {
                    return;
                }
            }
            sleep(TARGET_VMM_POLL).await;
        }
    };
    timeout(TARGET_VMM_DEADLINE, wait).await.is_ok()
}

/// Undo every recorded mount and remove the record file. Failures are logged
/// and skipped so a stuck mount cannot wedge teardown.
fn cleanup_mounts(vm: &VirtualMachine, ctx: &Context) {
    let vm_uid = vm.uid().unwrap_or_default();
    let record = hotplug::read_record(&ctx.record_dir, &vm_uid).unwrap_or_default();
    for entry in &record {
        let target = PathBuf::from(&entry.target);
        let result = if entry.target.ends_with(".img") {
            hotplug::unmount_fs_volume(&target)
        } else {
            hotplug::unmount_block_volume(&target)
        };
        if let Err(e) = result {
            warn!(vm = %vm.name_any(), volume = %entry.volume, error = %e, "hotplug cleanup failed");
        }
    }
    if let Err(e) = hotplug::remove_record(&ctx.record_dir, &vm_uid) {
        warn!(vm = %vm.name_any(), error = %e, "remove mount record failed");
    }
}

/// Terminal or deleting: undo every recorded mount, drop the record file and
/// the migration control block, and delete the VMM if it is still up.
async fn cleanup_vm(vm: &mut VirtualMachine, ctx: &Context) -> Result<(), Error> {
    let vm_uid = vm.uid().unwrap_or_default();
    cleanup_mounts(vm, ctx);
    ctx.migrations.drop_block(&vm_uid);
    if let Some(status) = vm.status.as_mut() {
        status.volume_status.clear();
    }

    let pod_uid = vm
        .status
        .as_ref()
        .map(|s| s.vm_pod_uid.clone())
        .unwrap_or_default();
    if !pod_uid.is_empty() {
        let socket = ctx.ch_socket(&pod_uid);
        if socket.exists() {
            let ch = ChClient::new(&socket);
            match ch.vm_info().await {
                Ok(_) => {
                    if let Err(e) = ch.vm_delete().await {
                        if !e.is_not_created() {
                            return Err(e.into());
                        }
                    } else {
                        info!(vm = %vm.name_any(), "deleted VMM");
                    }
                }
                Err(e) if e.is_not_created() => {}
                // The pod may already be tearing down; nothing to do.
                Err(_) => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_actions_map_to_vmm_calls() {
        use VirtualMachinePowerAction::*;
        assert_eq!(power_action_op(PowerOff).unwrap().0, VmmOp::Shutdown);
        assert_eq!(power_action_op(Shutdown).unwrap().0, VmmOp::PowerButton);
        assert_eq!(power_action_op(Reset).unwrap().0, VmmOp::Reboot);
        assert_eq!(power_action_op(Reboot).unwrap().0, VmmOp::Reboot);
        assert_eq!(power_action_op(Pause).unwrap().0, VmmOp::Pause);
        assert_eq!(power_action_op(Resume).unwrap().0, VmmOp::Resume);
        assert!(power_action_op(PowerOn).is_none());
    }

    #[test]
    fn power_action_reasons_match_events() {
        let (_, ok, fail) = power_action_op(VirtualMachinePowerAction::PowerOff).unwrap();
        assert_eq!(ok, "PoweredOff");
        assert_eq!(fail, "FailedPowerOff");
    }

    #[test]
    fn record_entries_dedupe_by_volume() {
        let mut record = Vec::new();
        push_record(&mut record, "data", "/pods/uid/hotplug-volumes/data.img");
        push_record(&mut record, "data", "/pods/uid/hotplug-volumes/data.img");
        push_record(&mut record, "scratch", "/pods/uid/hotplug-volumes/scratch");
        assert_eq!(record.len(), 2);
    }

    #[tokio::test]
    async fn wait_for_path_honors_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("never");
        let start = std::time::Instant::now();
        assert!(!wait_for_path(&missing, Duration::from_millis(10), Duration::from_millis(50)).await);
        assert!(start.elapsed() < Duration::from_secs(1));

        let present = dir.path().join("there");
        std::fs::write(&present, b"").unwrap();
        assert!(wait_for_path(&present, Duration::from_millis(10), Duration::from_millis(50)).await);
    }
}
