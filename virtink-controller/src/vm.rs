//! Cluster-level VM reconciler.
//!
//! Drives the VM phase machine: materialises the VMM pod, the migration
//! target pod and the hotplug volume pods, computes conditions, and
//! garbage-collects pods that are neither the current VMM pod nor the
//! migration target.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k8s_openapi::api::core::v1::{
    Affinity, Capabilities, Container, EmptyDirVolumeSource, EnvVar, NodeAffinity, NodeSelector,
    NodeSelectorRequirement, NodeSelectorTerm, Pod, PodAffinityTerm, PodAntiAffinity, PodSpec,
    ResourceRequirements, SecretVolumeSource, SecurityContext, Volume as PodVolume, VolumeDevice,
    VolumeMount,
};
use k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource as PodPvcSource;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::reflector::Store;
use kube::{Client, Resource, ResourceExt};
use rand::Rng;
use tracing::{info, warn};

use virtink_api::condition::{find_condition, new_condition, set_condition};
use virtink_api::migration::VirtualMachineMigrationPhase;
use virtink_api::vm::{
    VirtualMachine, VirtualMachinePhase, VirtualMachinePowerAction, VirtualMachineStatus, Volume,
    VolumePhase, VolumeStatus, CONDITION_MIGRATABLE, CONDITION_READY, VM_PROTECTION_FINALIZER,
};
use virtink_api::{volume as volumeutil, RunPolicy};

/// Label stamped on every pod materialised for a VM.
pub const VM_NAME_LABEL: &str = "virtink.io/vm.name";
/// Label marking hotplug volume pods.
pub const HOTPLUG_POD_LABEL: &str = "virtink.io/hotplug-volume-pod";

const NETWORKS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";
const NAD_RESOURCE_ANNOTATION: &str = "k8s.v1.cni.cncf.io/resourceName";
const KVM_DEVICE_RESOURCE: &str = "devices.virtink.io/kvm";
const TUN_DEVICE_RESOURCE: &str = "devices.virtink.io/tun";
const VHOST_USER_SOCKET_DIR: &str = "/var/run/vhost-user";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes API: {0}")]
    Kube(#[from] kube::Error),
    #[error("serialize: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct Context {
    pub client: Client,
    pub reporter: Reporter,
    pub prerunner_image: String,
    pub vm_store: Store<VirtualMachine>,
}

impl Context {
    fn recorder(&self, vm: &VirtualMachine) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone(), vm.object_ref(&()))
    }
}

pub async fn reconcile(vm: Arc<VirtualMachine>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = vm.namespace().unwrap_or_default();
    let name = vm.name_any();
    let api: Api<VirtualMachine> = Api::namespaced(ctx.client.clone(), &namespace);

    let mut vm = (*vm).clone();
    if vm.status.is_none() {
        vm.status = Some(VirtualMachineStatus::default());
    }
    let observed_status = vm.status.clone();

    if let Err(e) = reconcile_vm(&mut vm, &ctx).await {
        let recorder = ctx.recorder(&vm);
        let _ = recorder
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

    // Volume pods are controlled by the VMM pod, so their progress does not
    // flow through the owns() watch; poll while the VM is in flight.
    let active = matches!(
        vm.status.as_ref().and_then(|s| s.phase),
        Some(VirtualMachinePhase::Scheduling)
            | Some(VirtualMachinePhase::Scheduled)
            | Some(VirtualMachinePhase::Running)
    );
    if active {
        Ok(Action::requeue(Duration::from_secs(15)))
    } else {
        Ok(Action::await_change())
    }
}

pub fn error_policy(vm: Arc<VirtualMachine>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(vm = %vm.name_any(), error = %error, "VM reconcile failed");
    Action::requeue(Duration::from_secs(5))
}

async fn reconcile_vm(vm: &mut VirtualMachine, ctx: &Context) -> Result<(), Error> {
    if vm.metadata.deletion_timestamp.is_some() {
        return reconcile_deleting_vm(vm, ctx).await;
    }
    ensure_finalizer(vm, ctx).await?;

    let phase = vm.status.as_ref().and_then(|s| s.phase);
    match phase {
        None | Some(VirtualMachinePhase::Succeeded) | Some(VirtualMachinePhase::Failed) => {
            let policy = vm.spec.run_policy.unwrap_or_default();
            let power_action = vm.status.as_ref().and_then(|s| s.power_action);
            if should_run(policy, phase, power_action) {
                let owned = list_controlled_pods(vm, ctx).await?;
                if owned.is_empty() {
                    vm.status = Some(VirtualMachineStatus {
                        phase: Some(VirtualMachinePhase::Pending),
                        ..Default::default()
                    });
                } else {
                    delete_pods(&owned, ctx, &vm.namespace().unwrap_or_default()).await?;
                }
            }
        }
        Some(VirtualMachinePhase::Pending) => {
            let vm_pod_name = generate_name(&format!("vm-{}-", vm.name_any()));
            let status = vm.status.get_or_insert_with(Default::default);
            status.vm_pod_name = vm_pod_name;
            status.phase = Some(VirtualMachinePhase::Scheduling);
        }
        Some(VirtualMachinePhase::Scheduling)
        | Some(VirtualMachinePhase::Scheduled)
        | Some(VirtualMachinePhase::Running) => {
            reconcile_active_vm(vm, ctx).await?;
        }
        Some(VirtualMachinePhase::Unknown) => {}
    }

    gc_pods(vm, ctx).await?;
    Ok(())
}

async fn reconcile_deleting_vm(vm: &mut VirtualMachine, ctx: &Context) -> Result<(), Error> {
    let phase = vm.status.as_ref().and_then(|s| s.phase);
    match phase {
        None
        | Some(VirtualMachinePhase::Pending)
        | Some(VirtualMachinePhase::Scheduling)
        | Some(VirtualMachinePhase::Failed)
        | Some(VirtualMachinePhase::Succeeded) => {
            let owned = list_controlled_pods(vm, ctx).await?;
            if owned.is_empty() {
                remove_finalizer(vm, ctx).await?;
            } else {
                delete_pods(&owned, ctx, &vm.namespace().unwrap_or_default()).await?;
            }
        }
        _ => {
            // The daemon tears the VMM down; track the pod into a terminal
            // phase so the branch above can finish the job.
            let namespace = vm.namespace().unwrap_or_default();
            let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
            let pod_name = vm
                .status
                .as_ref()
                .map(|s| s.vm_pod_name.clone())
                .unwrap_or_default();
            let vm_uid = vm.uid().unwrap_or_default();
            let pod = pods
                .get_opt(&pod_name)
                .await?
                .filter(|p| is_controlled_by(p, &vm_uid));
            let status = vm.status.get_or_insert_with(Default::default);
            match pod {
                None => status.phase = Some(VirtualMachinePhase::Failed),
                Some(pod) => {
                    if let Some(next) = pod_phase_to_vm_phase(pod_phase(&pod)) {
                        status.phase = Some(next);
                    }
                }
            }
        }
    }
    Ok(())
}

async fn reconcile_active_vm(vm: &mut VirtualMachine, ctx: &Context) -> Result<(), Error> {
    let namespace = vm.namespace().unwrap_or_default();
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let vm_uid = vm.uid().unwrap_or_default();
    let pod_name = vm
        .status
        .as_ref()
        .map(|s| s.vm_pod_name.clone())
        .unwrap_or_default();

    let vm_pod = pods
        .get_opt(&pod_name)
        .await?
        .filter(|p| is_controlled_by(p, &vm_uid));

    let phase = vm.status.as_ref().and_then(|s| s.phase);
    match vm_pod {
        None => {
            if phase == Some(VirtualMachinePhase::Scheduling) {
                let mut pod = build_vm_pod_for(vm, ctx, false).await?;
                pod.metadata.name = Some(pod_name.clone());
                let created = pods.create(&PostParams::default(), &pod).await?;
                info!(vm = %vm.name_any(), pod = %created.name_any(), "created VM pod");
                let _ = ctx
                    .recorder(vm)
                    .publish(Event {
                        type_: EventType::Normal,
                        reason: "CreatedVMPod".into(),
                        note: Some(format!("Created VM pod {:?}", created.name_any())),
                        action: "Reconcile".into(),
                        secondary: None,
                    })
                    .await;
            } else {
                vm.status.get_or_insert_with(Default::default).phase =
                    Some(VirtualMachinePhase::Failed);
            }
        }
        Some(pod) => match pod_phase(&pod) {
            "Running" | "Pending" => {
                let running = pod_phase(&pod) == "Running";
                let bound = pod
                    .spec
                    .as_ref()
                    .and_then(|s| s.node_name.clone())
                    .filter(|n| !n.is_empty());

                if let Some(node_name) = bound {
                    {
                        let status = vm.status.get_or_insert_with(Default::default);
                        status.vm_pod_uid = pod.uid().unwrap_or_default();
                        status.node_name = node_name;
                    }
                    let attached = reconcile_hotplug_volumes(vm, &pod, ctx).await?;
                    if phase == Some(VirtualMachinePhase::Scheduling) && attached && running {
                        vm.status.get_or_insert_with(Default::default).phase =
                            Some(VirtualMachinePhase::Scheduled);
                    }
                }

                if phase == Some(VirtualMachinePhase::Running) {
                    ensure_migratable_condition(vm);
                    reconcile_migration_source(vm, ctx).await?;
                }
                update_ready_condition(vm, &pod);
            }
            pod_phase => {
                let migration_in_flight = vm
                    .status
                    .as_ref()
                    .and_then(|s| s.migration.as_ref())
                    .map(|m| !m.phase.map(|p| p.is_terminal()).unwrap_or(false))
                    .unwrap_or(false);
                if let Some(next) = pod_phase_to_vm_phase(pod_phase) {
                    let skip = next == VirtualMachinePhase::Succeeded
                        && phase == Some(VirtualMachinePhase::Running)
                        && migration_in_flight;
                    if !skip {
                        vm.status.get_or_insert_with(Default::default).phase = Some(next);
                    }
                }
            }
        },
    }
    Ok(())
}

/// Build the (possibly target) VMM pod, resolving block volume modes and
/// Multus resource names first.
async fn build_vm_pod_for(
    vm: &VirtualMachine,
    ctx: &Context,
    receive_migration: bool,
) -> Result<Pod, Error> {
    let namespace = vm.namespace().unwrap_or_default();
    let block_volumes = block_volume_names(vm, ctx, &namespace).await?;
    let nad_resources = multus_resource_counts(vm, ctx, &namespace).await?;
    let pod = build_vm_pod(
        vm,
        &ctx.prerunner_image,
        &block_volumes,
        &nad_resources,
        receive_migration,
    )?;
    Ok(pod)
}

async fn block_volume_names(
    vm: &VirtualMachine,
    ctx: &Context,
    namespace: &str,
) -> Result<BTreeSet<String>, Error> {
    let mut names = BTreeSet::new();
    for volume in &vm.spec.volumes {
        if volume.pvc_name().is_none() || volume.is_hotpluggable() {
            continue;
        }
        if volumeutil::is_block(&ctx.client, namespace, volume).await? {
            names.insert(volume.name.clone());
        }
    }
    Ok(names)
}

/// Resource requests advertised by the NADs of the VM's Multus networks.
async fn multus_resource_counts(
    vm: &VirtualMachine,
    ctx: &Context,
    namespace: &str,
) -> Result<BTreeMap<String, i64>, Error> {
    let mut counts = BTreeMap::new();
    let gvk = GroupVersionKind::gvk("k8s.cni.cncf.io", "v1", "NetworkAttachmentDefinition");
    let ar = ApiResource::from_gvk_with_plural(&gvk, "network-attachment-definitions");
    let nads: Api<DynamicObject> = Api::namespaced_with(ctx.client.clone(), namespace, &ar);
    for network in &vm.spec.networks {
        let Some(multus) = &network.source.multus else {
            continue;
        };
        let nad = nads.get(&multus.network_name).await?;
        if let Some(resource) = nad
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(NAD_RESOURCE_ANNOTATION))
        {
            *counts.entry(resource.clone()).or_insert(0) += 1;
        }
    }
    Ok(counts)
}

async fn reconcile_migration_source(vm: &mut VirtualMachine, ctx: &Context) -> Result<(), Error> {
    let namespace = vm.namespace().unwrap_or_default();
    let Some(migration) = vm.status.as_ref().and_then(|s| s.migration.clone()) else {
        return Ok(());
    };

    let mut migration = migration;
    match migration.phase {
        None | Some(VirtualMachineMigrationPhase::Pending) => {
            migration.target_vm_pod_name =
                generate_name(&format!("vm-{}-target-", vm.name_any()));
            migration.phase = Some(VirtualMachineMigrationPhase::Scheduling);
        }
        Some(VirtualMachineMigrationPhase::Scheduling) => {
            let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
            let vm_uid = vm.uid().unwrap_or_default();
            let target = pods
                .get_opt(&migration.target_vm_pod_name)
                .await?
                .filter(|p| is_controlled_by(p, &vm_uid));
            match target {
                None => {
                    let mut pod = build_vm_pod_for(vm, ctx, true).await?;
                    pod.metadata.name = Some(migration.target_vm_pod_name.clone());
                    let owner = owner_reference(vm);
                    pod.metadata.owner_references = Some(vec![owner]);
                    let created = pods.create(&PostParams::default(), &pod).await?;
                    info!(vm = %vm.name_any(), pod = %created.name_any(), "created target VM pod");
                    let _ = ctx
                        .recorder(vm)
                        .publish(Event {
                            type_: EventType::Normal,
                            reason: "CreatedTargetVMPod".into(),
                            note: Some(format!("Created target VM pod {:?}", created.name_any())),
                            action: "Reconcile".into(),
                            secondary: None,
                        })
                        .await;
                }
                Some(pod) => match pod_phase(&pod) {
                    "Succeeded" | "Failed" | "Unknown" => {
                        migration.phase = Some(VirtualMachineMigrationPhase::Failed);
                    }
                    _ => {
                        if let Some(node) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) {
                            migration.target_node_name = node;
                            migration.target_vm_pod_uid = pod.uid().unwrap_or_default();
                            let attached = target_hotplug_attached(vm, &pod, ctx).await?;
                            if attached && pod_phase(&pod) == "Running" {
                                migration.phase = Some(VirtualMachineMigrationPhase::Scheduled);
                            }
                        }
                    }
                },
            }
        }
        // Later phases are driven by the daemons; terminal phases are
        // cleared from the slot by the migration reconciler.
        _ => {}
    }

    if let Some(status) = vm.status.as_mut() {
        status.migration = Some(migration);
    }
    Ok(())
}

/// Set of hotplug volumes whose backing storage is ready to attach.
async fn ready_hotplug_volumes(vm: &VirtualMachine, ctx: &Context) -> Result<Vec<Volume>, Error> {
    let namespace = vm.namespace().unwrap_or_default();
    let mut ready = Vec::new();
    for volume in &vm.spec.volumes {
        if !volume.is_hotpluggable() {
            continue;
        }
        if volumeutil::is_ready(&ctx.client, &namespace, volume).await? {
            ready.push(volume.clone());
        }
    }
    Ok(ready)
}

/// Maintain exactly one volume pod for `anchor_pod` matching the ready set.
/// Returns the current volume pod, if any.
async fn ensure_volume_pod(
    vm: &VirtualMachine,
    anchor_pod: &Pod,
    ready: &[Volume],
    ctx: &Context,
) -> Result<Option<Pod>, Error> {
    let namespace = vm.namespace().unwrap_or_default();
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let anchor_uid = anchor_pod.uid().unwrap_or_default();

    let lp = ListParams::default().labels(&format!(
        "{}={},{}",
        VM_NAME_LABEL,
        vm.name_any(),
        HOTPLUG_POD_LABEL
    ));
    let volume_pods: Vec<Pod> = pods
        .list(&lp)
        .await?
        .items
        .into_iter()
        .filter(|p| is_controlled_by(p, &anchor_uid))
        .collect();

    let want: BTreeSet<&str> = ready.iter().map(|v| v.name.as_str()).collect();
    let mut current: Option<Pod> = None;
    let mut obsolete: Vec<Pod> = Vec::new();
    for pod in volume_pods {
        let have: BTreeSet<&str> = pod
            .spec
            .as_ref()
            .map(|s| {
                s.volumes
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .filter(|v| v.persistent_volume_claim.is_some())
                    .map(|v| v.name.as_str())
                    .collect()
            })
            .unwrap_or_default();
        if !want.is_empty()
            && have == want
            && current.is_none()
            && pod.metadata.deletion_timestamp.is_none()
        {
            current = Some(pod);
        } else {
            obsolete.push(pod);
        }
    }

    if current.is_none() && !ready.is_empty() {
        let mut block = BTreeSet::new();
        for volume in ready {
            if volumeutil::is_block(&ctx.client, &namespace, volume).await? {
                block.insert(volume.name.clone());
            }
        }
        let pod = build_hotplug_volume_pod(vm, anchor_pod, ready, &block, &ctx.prerunner_image);
        let created = pods.create(&PostParams::default(), &pod).await?;
        info!(vm = %vm.name_any(), pod = %created.name_any(), "created hotplug volume pod");
        current = Some(created);
    }

    delete_pods(&obsolete, ctx, &namespace).await?;
    Ok(current)
}

/// Reconcile the hotplug volume pod for the current VMM pod and refresh the
/// per-volume status vector. Returns whether every hotplug volume has reached
/// at least `AttachedToNode`.
async fn reconcile_hotplug_volumes(
    vm: &mut VirtualMachine,
    vm_pod: &Pod,
    ctx: &Context,
) -> Result<bool, Error> {
    let ready = ready_hotplug_volumes(vm, ctx).await?;
    let current = ensure_volume_pod(vm, vm_pod, &ready, ctx).await?;
    let volume_pod_running = current
        .as_ref()
        .map(|p| pod_phase(p) == "Running")
        .unwrap_or(false);

    let ready_names: BTreeSet<&str> = ready.iter().map(|v| v.name.as_str()).collect();
    let hotplug_names: Vec<String> = vm
        .spec
        .volumes
        .iter()
        .filter(|v| v.is_hotpluggable())
        .map(|v| v.name.clone())
        .collect();

    let status = vm.status.get_or_insert_with(Default::default);
    let mut all_attached = true;
    for name in &hotplug_names {
        let attached = ready_names.contains(name.as_str()) && volume_pod_running;
        let existing = status
            .volume_status
            .iter()
            .find(|v| &v.name == name)
            .and_then(|v| v.phase);
        let next = match existing {
            // The daemon owns the MountedToPod/Ready/Detaching transitions.
            Some(phase) if volume_phase_rank(phase) > volume_phase_rank(VolumePhase::AttachedToNode) => phase,
            _ if attached => VolumePhase::AttachedToNode,
            Some(phase) => phase,
            None => VolumePhase::Pending,
        };
        if volume_phase_rank(next) < volume_phase_rank(VolumePhase::AttachedToNode)
            || next == VolumePhase::Detaching
        {
            all_attached = false;
        }
        match status.volume_status.iter_mut().find(|v| &v.name == name) {
            Some(entry) => entry.phase = Some(next),
            None => status.volume_status.push(VolumeStatus {
                name: name.clone(),
                phase: Some(next),
            }),
        }
    }

    // Volumes dropped from the spec detach; the daemon clears the entry once
    // the disk is removed and the mount is gone.
    for entry in status.volume_status.iter_mut() {
        if !hotplug_names.contains(&entry.name) {
            entry.phase = Some(VolumePhase::Detaching);
        }
    }

    Ok(all_attached)
}

/// Whether the target pod has its hotplug volumes held open on its node.
async fn target_hotplug_attached(
    vm: &VirtualMachine,
    target_pod: &Pod,
    ctx: &Context,
) -> Result<bool, Error> {
    let ready = ready_hotplug_volumes(vm, ctx).await?;
    if ready.is_empty() {
        return Ok(true);
    }
    let current = ensure_volume_pod(vm, target_pod, &ready, ctx).await?;
    Ok(current.map(|p| pod_phase(&p) == "Running").unwrap_or(false))
}

async fn gc_pods(vm: &VirtualMachine, ctx: &Context) -> Result<(), Error> {
    let namespace = vm.namespace().unwrap_or_default();
    let mut keep: BTreeSet<String> = BTreeSet::new();
    if let Some(status) = vm.status.as_ref() {
        if !status.vm_pod_name.is_empty() {
            keep.insert(status.vm_pod_name.clone());
        }
        if let Some(migration) = &status.migration {
            if !migration.target_vm_pod_name.is_empty() {
                keep.insert(migration.target_vm_pod_name.clone());
            }
        }
    }

    let garbage: Vec<Pod> = list_controlled_pods(vm, ctx)
        .await?
        .into_iter()
        .filter(|p| !keep.contains(&p.name_any()))
        .collect();
    delete_pods(&garbage, ctx, &namespace).await
}

async fn list_controlled_pods(vm: &VirtualMachine, ctx: &Context) -> Result<Vec<Pod>, Error> {
    let namespace = vm.namespace().unwrap_or_default();
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let vm_uid = vm.uid().unwrap_or_default();
    let lp = ListParams::default().labels(&format!("{}={}", VM_NAME_LABEL, vm.name_any()));
    Ok(pods
        .list(&lp)
        .await?
        .items
        .into_iter()
        .filter(|p| is_controlled_by(p, &vm_uid))
        .collect())
}

async fn delete_pods(pods: &[Pod], ctx: &Context, namespace: &str) -> Result<(), Error> {
    let api: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
    for pod in pods {
        if pod.metadata.deletion_timestamp.is_some() {
            continue;
        }
        match api.delete(&pod.name_any(), &DeleteParams::default()).await {
            Ok(_) => info!(pod = %pod.name_any(), "deleted pod"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn ensure_finalizer(vm: &VirtualMachine, ctx: &Context) -> Result<(), Error> {
    if vm.finalizers().iter().any(|f| f == VM_PROTECTION_FINALIZER) {
        return Ok(());
    }
    let namespace = vm.namespace().unwrap_or_default();
    let api: Api<VirtualMachine> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut finalizers = vm.finalizers().to_vec();
    finalizers.push(VM_PROTECTION_FINALIZER.to_owned());
    api.patch(
        &vm.name_any(),
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({"metadata": {"finalizers": finalizers}})),
    )
    .await?;
    Ok(())
}

async fn remove_finalizer(vm: &VirtualMachine, ctx: &Context) -> Result<(), Error> {
    if !vm.finalizers().iter().any(|f| f == VM_PROTECTION_FINALIZER) {
        return Ok(());
    }
    let namespace = vm.namespace().unwrap_or_default();
    let api: Api<VirtualMachine> = Api::namespaced(ctx.client.clone(), &namespace);
    let finalizers: Vec<String> = vm
        .finalizers()
        .iter()
        .filter(|f| *f != VM_PROTECTION_FINALIZER)
        .cloned()
        .collect();
    api.patch(
        &vm.name_any(),
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({"metadata": {"finalizers": finalizers}})),
    )
    .await?;
    Ok(())
}

fn update_ready_condition(vm: &mut VirtualMachine, pod: &Pod) {
    let pod_ready = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.type_ == "Ready"))
        .map(|c| c.status == "True")
        .unwrap_or(false);
    let status = vm.status.get_or_insert_with(Default::default);
    let condition = if pod_ready {
        new_condition(CONDITION_READY, true, "PodReady", "")
    } else {
        new_condition(CONDITION_READY, false, "PodNotReady", "VM pod is not ready")
    };
    set_condition(&mut status.conditions, condition);
}

/// Compute the `Migratable` condition once, at the transition into Running.
fn ensure_migratable_condition(vm: &mut VirtualMachine) {
    let already_set = vm
        .status
        .as_ref()
        .map(|s| find_condition(&s.conditions, CONDITION_MIGRATABLE).is_some())
        .unwrap_or(false);
    if already_set {
        return;
    }
    let (migratable, reason) = compute_migratable(vm);
    let status = vm.status.get_or_insert_with(Default::default);
    let condition = if migratable {
        new_condition(CONDITION_MIGRATABLE, true, "Migratable", "")
    } else {
        new_condition(CONDITION_MIGRATABLE, false, "NotMigratable", &reason)
    };
    set_condition(&mut status.conditions, condition);
}

/// Features that pin a VM to its node. Any one of them makes the VM
/// non-migratable.
pub fn compute_migratable(vm: &VirtualMachine) -> (bool, String) {
    if vm.spec.instance.cpu.dedicated_cpu_placement {
        return (false, "VM with dedicated CPU placement is not migratable".into());
    }
    for iface in &vm.spec.instance.interfaces {
        if iface.binding.sriov.is_some() {
            return (false, format!("SR-IOV interface {:?} is not migratable", iface.name));
        }
        if iface.binding.vhost_user.is_some() {
            return (
                false,
                format!("vhost-user interface {:?} is not migratable", iface.name),
            );
        }
        if iface.binding.bridge.is_some() {
            let on_pod_network = vm
                .spec
                .networks
                .iter()
                .any(|n| n.name == iface.name && n.source.pod.is_some());
            if on_pod_network {
                return (
                    false,
                    format!(
                        "bridged interface {:?} on the pod network is not migratable",
                        iface.name
                    ),
                );
            }
        }
    }
    for volume in &vm.spec.volumes {
        if volume.source.container_disk.is_some() || volume.source.container_rootfs.is_some() {
            return (
                false,
                format!("volume {:?} is not on shared storage", volume.name),
            );
        }
    }
    if !vm.spec.instance.file_systems.is_empty() {
        return (false, "VM with filesystems is not migratable".into());
    }
    (true, String::new())
}

/// Run predicate for terminal and fresh VMs.
pub fn should_run(
    policy: RunPolicy,
    phase: Option<VirtualMachinePhase>,
    power_action: Option<VirtualMachinePowerAction>,
) -> bool {
    match policy {
        RunPolicy::Always => true,
        RunPolicy::RerunOnFailure => {
            phase == Some(VirtualMachinePhase::Failed)
                || phase.is_none()
                || power_action == Some(VirtualMachinePowerAction::PowerOn)
        }
        RunPolicy::Once => {
            phase.is_none() || power_action == Some(VirtualMachinePowerAction::PowerOn)
        }
        RunPolicy::Manual => power_action == Some(VirtualMachinePowerAction::PowerOn),
        RunPolicy::Halted => false,
    }
}

pub fn pod_phase_to_vm_phase(pod_phase: &str) -> Option<VirtualMachinePhase> {
    match pod_phase {
        "Succeeded" => Some(VirtualMachinePhase::Succeeded),
        "Failed" => Some(VirtualMachinePhase::Failed),
        "Unknown" => Some(VirtualMachinePhase::Unknown),
        _ => None,
    }
}

fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("")
}

fn is_controlled_by(pod: &Pod, uid: &str) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .map(|refs| {
            refs.iter()
                .any(|r| r.controller == Some(true) && r.uid == uid)
        })
        .unwrap_or(false)
}

fn owner_reference(vm: &VirtualMachine) -> OwnerReference {
    OwnerReference {
        api_version: VirtualMachine::api_version(&()).into_owned(),
        kind: VirtualMachine::kind(&()).into_owned(),
        name: vm.name_any(),
        uid: vm.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn pod_owner_reference(pod: &Pod) -> OwnerReference {
    OwnerReference {
        api_version: "v1".into(),
        kind: "Pod".into(),
        name: pod.name_any(),
        uid: pod.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn volume_phase_rank(phase: VolumePhase) -> u8 {
    match phase {
        VolumePhase::Pending => 0,
        VolumePhase::AttachedToNode => 1,
        VolumePhase::MountedToPod => 2,
        VolumePhase::Ready => 3,
        VolumePhase::Detaching => 4,
    }
}

const NAME_SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Generate a pod name with a random 5-character suffix, the way the
/// apiserver's name generator does.
pub fn generate_name(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..5)
        .map(|_| NAME_SUFFIX_ALPHABET[rng.gen_range(0..NAME_SUFFIX_ALPHABET.len())] as char)
        .collect();
    format!("{}{}", prefix, suffix)
}

fn add_resource(resources: &mut ResourceRequirements, name: &str, count: i64) {
    let quantity = Quantity(count.to_string());
    resources
        .requests
        .get_or_insert_with(Default::default)
        .insert(name.to_owned(), quantity.clone());
    resources
        .limits
        .get_or_insert_with(Default::default)
        .insert(name.to_owned(), quantity);
}

/// Build the VMM pod for a VM. `block_volumes` names the non-hotplug
/// PVC-backed volumes in block mode; `nad_resources` carries the resource
/// requests advertised by Multus NADs. With `receive_migration` the pod is a
/// migration target: it gets an anti-affinity against the VM's other pods
/// and `RECEIVE_MIGRATION=true`.
pub fn build_vm_pod(
    vm: &VirtualMachine,
    prerunner_image: &str,
    block_volumes: &BTreeSet<String>,
    nad_resources: &BTreeMap<String, i64>,
    receive_migration: bool,
) -> anyhow::Result<Pod> {
    let vm_name = vm.name_any();
    let vm_data = BASE64.encode(serde_json::to_vec(vm)?);

    let mut labels = vm.labels().clone();
    labels.insert(VM_NAME_LABEL.to_owned(), vm_name.clone());
    let mut annotations = vm.annotations().clone();

    let mut resources = vm.spec.resources.clone().unwrap_or_default();
    add_resource(&mut resources, KVM_DEVICE_RESOURCE, 1);
    add_resource(&mut resources, TUN_DEVICE_RESOURCE, 1);
    for (name, count) in nad_resources {
        add_resource(&mut resources, name, *count);
    }

    let mut env = vec![EnvVar {
        name: "VM_DATA".into(),
        value: Some(vm_data),
        ..Default::default()
    }];
    if receive_migration {
        env.push(EnvVar {
            name: "RECEIVE_MIGRATION".into(),
            value: Some("true".into()),
            ..Default::default()
        });
    }

    let mut container = Container {
        name: "cloud-hypervisor".into(),
        image: Some(prerunner_image.to_owned()),
        resources: Some(resources),
        liveness_probe: vm.spec.liveness_probe.clone(),
        readiness_probe: vm.spec.readiness_probe.clone(),
        security_context: Some(SecurityContext {
            capabilities: Some(Capabilities {
                add: Some(vec![
                    "SYS_ADMIN".into(),
                    "NET_ADMIN".into(),
                    "SYS_RESOURCE".into(),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        env: Some(env),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "virtink".into(),
                mount_path: "/var/run/virtink".into(),
                ..Default::default()
            },
            VolumeMount {
                name: "hotplug-volumes".into(),
                mount_path: "/hotplug-volumes".into(),
                mount_propagation: Some("HostToContainer".into()),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let mut pod_volumes = vec![
        PodVolume {
            name: "virtink".into(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        PodVolume {
            name: "hotplug-volumes".into(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ];
    let mut init_containers: Vec<Container> = Vec::new();

    if let Some(kernel) = &vm.spec.instance.kernel {
        pod_volumes.push(PodVolume {
            name: "virtink-kernel".into(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
        let mount = VolumeMount {
            name: "virtink-kernel".into(),
            mount_path: "/mnt/virtink-kernel".into(),
            ..Default::default()
        };
        container.volume_mounts.get_or_insert_with(Vec::new).push(mount.clone());
        init_containers.push(Container {
            name: "init-kernel".into(),
            image: Some(kernel.image.clone()),
            image_pull_policy: kernel.image_pull_policy.clone(),
            args: Some(vec![format!("{}/vmlinux", mount.mount_path)]),
            volume_mounts: Some(vec![mount]),
            ..Default::default()
        });
    }

    let mut block_names: Vec<String> = Vec::new();
    for volume in &vm.spec.volumes {
        let mount_path = format!("/mnt/{}", volume.name);
        if let Some(disk) = &volume.source.container_disk {
            pod_volumes.push(empty_dir_volume(&volume.name));
            let mount = volume_mount(&volume.name, &mount_path);
            container.volume_mounts.get_or_insert_with(Vec::new).push(mount.clone());
            init_containers.push(Container {
                name: format!("init-volume-{}", volume.name),
                image: Some(disk.image.clone()),
                image_pull_policy: disk.image_pull_policy.clone(),
                args: Some(vec![format!("{}/disk.raw", mount_path)]),
                volume_mounts: Some(vec![mount]),
                ..Default::default()
            });
        } else if let Some(rootfs) = &volume.source.container_rootfs {
            pod_volumes.push(empty_dir_volume(&volume.name));
            let mount = volume_mount(&volume.name, &mount_path);
            container.volume_mounts.get_or_insert_with(Vec::new).push(mount.clone());
            init_containers.push(Container {
                name: format!("init-volume-{}", volume.name),
                image: Some(rootfs.image.clone()),
                image_pull_policy: rootfs.image_pull_policy.clone(),
                args: Some(vec![
                    format!("{}/rootfs.raw", mount_path),
                    virtink_api::quantity::parse_quantity(&rootfs.size)
                        .map(|v| v.to_string())
                        .unwrap_or_else(|_| rootfs.size.0.clone()),
                ]),
                volume_mounts: Some(vec![mount]),
                ..Default::default()
            });
        } else if let Some(cloud_init) = &volume.source.cloud_init {
            let mut init = Container {
                name: format!("init-volume-{}", volume.name),
                image: Some(prerunner_image.to_owned()),
                command: Some(vec!["virt-init-volume".into()]),
                args: Some(vec!["cloud-init".into()]),
                ..Default::default()
            };
            let meta_data = BASE64.encode(format!(
                "instance-id: {}\nlocal-hostname: {}",
                vm.uid().unwrap_or_default(),
                vm_name
            ));
            init.args.get_or_insert_with(Vec::new).push(meta_data);

            let user_data = if !cloud_init.user_data.is_empty() {
                BASE64.encode(&cloud_init.user_data)
            } else if !cloud_init.user_data_base64.is_empty() {
                cloud_init.user_data_base64.clone()
            } else if !cloud_init.user_data_secret_name.is_empty() {
                pod_volumes.push(secret_volume(
                    "virtink-cloud-init-user-data",
                    &cloud_init.user_data_secret_name,
                ));
                init.volume_mounts.get_or_insert_with(Vec::new).push(VolumeMount {
                    name: "virtink-cloud-init-user-data".into(),
                    mount_path: "/mnt/virtink-cloud-init-user-data".into(),
                    read_only: Some(true),
                    ..Default::default()
                });
                "/mnt/virtink-cloud-init-user-data/value".into()
            } else {
                String::new()
            };
            init.args.get_or_insert_with(Vec::new).push(user_data);

            let network_data = if !cloud_init.network_data.is_empty() {
                BASE64.encode(&cloud_init.network_data)
            } else if !cloud_init.network_data_base64.is_empty() {
                cloud_init.network_data_base64.clone()
            } else if !cloud_init.network_data_secret_name.is_empty() {
                pod_volumes.push(secret_volume(
                    "virtink-cloud-init-network-data",
                    &cloud_init.network_data_secret_name,
                ));
                init.volume_mounts.get_or_insert_with(Vec::new).push(VolumeMount {
                    name: "virtink-cloud-init-network-data".into(),
                    mount_path: "/mnt/virtink-cloud-init-network-data".into(),
                    read_only: Some(true),
                    ..Default::default()
                });
                "/mnt/virtink-cloud-init-network-data/value".into()
            } else {
                String::new()
            };
            init.args.get_or_insert_with(Vec::new).push(network_data);

            pod_volumes.push(empty_dir_volume(&volume.name));
            let mount = volume_mount(&volume.name, &mount_path);
            container.volume_mounts.get_or_insert_with(Vec::new).push(mount.clone());
            init.volume_mounts.get_or_insert_with(Vec::new).push(mount);
            init.args
                .get_or_insert_with(Vec::new)
                .push(format!("{}/cloud-init.iso", mount_path));
            init_containers.push(init);
        } else if volume.pvc_name().is_some() {
            if volume.is_hotpluggable() {
                continue;
            }
            pod_volumes.push(PodVolume {
                name: volume.name.clone(),
                persistent_volume_claim: Some(PodPvcSource {
                    claim_name: volume.pvc_name().unwrap_or_default().to_owned(),
                    ..Default::default()
                }),
                ..Default::default()
            });
            if block_volumes.contains(&volume.name) {
                block_names.push(volume.name.clone());
                container
                    .volume_devices
                    .get_or_insert_with(Vec::new)
                    .push(VolumeDevice {
                        name: volume.name.clone(),
                        device_path: mount_path,
                    });
            } else {
                container
                    .volume_mounts
                    .get_or_insert_with(Vec::new)
                    .push(volume_mount(&volume.name, &mount_path));
            }
        }
    }

    if !block_names.is_empty() {
        container.env.get_or_insert_with(Vec::new).push(EnvVar {
            name: "BLOCK_VOLUMES".into(),
            value: Some(block_names.join(",")),
            ..Default::default()
        });
    }

    if vm.spec.instance.memory.hugepages.is_some() {
        pod_volumes.push(PodVolume {
            name: "hugepages".into(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some("HugePages".into()),
                ..Default::default()
            }),
            ..Default::default()
        });
        container.volume_mounts.get_or_insert_with(Vec::new).push(VolumeMount {
            name: "hugepages".into(),
            mount_path: "/dev/hugepages".into(),
            ..Default::default()
        });
    }

    let mut networks = Vec::new();
    for (i, network) in vm.spec.networks.iter().enumerate() {
        if let Some(multus) = &network.source.multus {
            networks.push(serde_json::json!({
                "name": multus.network_name,
                "interface": format!("net{}", i),
            }));
        }
    }
    if !networks.is_empty() {
        annotations.insert(
            NETWORKS_ANNOTATION.to_owned(),
            serde_json::to_string(&networks)?,
        );
    }

    let mut node_selector = vm.spec.node_selector.clone().unwrap_or_default();
    let has_vhost_user = vm
        .spec
        .instance
        .interfaces
        .iter()
        .any(|i| i.binding.vhost_user.is_some());
    if has_vhost_user {
        node_selector.insert("ovn.kubernetes.io/vhost_user".into(), "true".into());
        pod_volumes.push(PodVolume {
            name: "vhost-user-sockets".into(),
            host_path: Some(k8s_openapi::api::core::v1::HostPathVolumeSource {
                path: VHOST_USER_SOCKET_DIR.into(),
                ..Default::default()
            }),
            ..Default::default()
        });
        container.volume_mounts.get_or_insert_with(Vec::new).push(VolumeMount {
            name: "vhost-user-sockets".into(),
            mount_path: VHOST_USER_SOCKET_DIR.into(),
            ..Default::default()
        });
        if let Some(iface) = vm
            .spec
            .instance
            .interfaces
            .iter()
            .find(|i| i.binding.vhost_user.is_some())
        {
            container.env.get_or_insert_with(Vec::new).push(EnvVar {
                name: "VHOST_USER_SOCKET".into(),
                value: Some(format!("{}/{}.sock", VHOST_USER_SOCKET_DIR, iface.name)),
                ..Default::default()
            });
        }
    }

    let mut affinity = vm.spec.affinity.clone();
    if receive_migration {
        let anti = PodAffinityTerm {
            label_selector: Some(LabelSelector {
                match_labels: Some(
                    [(VM_NAME_LABEL.to_owned(), vm_name.clone())].into_iter().collect(),
                ),
                ..Default::default()
            }),
            topology_key: "kubernetes.io/hostname".into(),
            ..Default::default()
        };
        let affinity = affinity.get_or_insert_with(Affinity::default);
        affinity
            .pod_anti_affinity
            .get_or_insert_with(PodAntiAffinity::default)
            .required_during_scheduling_ignored_during_execution
            .get_or_insert_with(Vec::new)
            .push(anti);
    }

    let pod = Pod {
        metadata: ObjectMeta {
            labels: Some(labels),
            annotations: if annotations.is_empty() {
                None
            } else {
                Some(annotations)
            },
            owner_references: Some(vec![owner_reference(vm)]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".into()),
            node_selector: if node_selector.is_empty() {
                None
            } else {
                Some(node_selector)
            },
            tolerations: vm.spec.tolerations.clone(),
            affinity,
            init_containers: if init_containers.is_empty() {
                None
            } else {
                Some(init_containers)
            },
            containers: vec![container],
            volumes: Some(pod_volumes),
            ..Default::default()
        }),
        ..Default::default()
    };
    Ok(pod)
}

/// Build the auxiliary pod that holds the ready hotplug PVCs open on the
/// VM's node. Controlled by the VMM pod so its deletion cascades.
pub fn build_hotplug_volume_pod(
    vm: &VirtualMachine,
    anchor_pod: &Pod,
    ready: &[Volume],
    block_volumes: &BTreeSet<String>,
    prerunner_image: &str,
) -> Pod {
    let mut labels = BTreeMap::new();
    labels.insert(VM_NAME_LABEL.to_owned(), vm.name_any());
    labels.insert(HOTPLUG_POD_LABEL.to_owned(), "true".to_owned());

    let node_name = anchor_pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.clone())
        .unwrap_or_default();

    // The daemon resolves this pod's mounts through the PID behind the ncat
    // socket; the socket lives in an empty-dir so the daemon can reach it
    // through the kubelet pod directory.
    let mut container = Container {
        name: "hotplug-volumes".into(),
        image: Some(prerunner_image.to_owned()),
        command: Some(vec![
            "ncat".into(),
            "-lkU".into(),
            "/var/run/hotplug/hp.sock".into(),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: "hotplug".into(),
            mount_path: "/var/run/hotplug".into(),
            ..Default::default()
        }]),
        ..Default::default()
    };
    let mut pod_volumes = vec![PodVolume {
        name: "hotplug".into(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }];
    for volume in ready {
        pod_volumes.push(PodVolume {
            name: volume.name.clone(),
            persistent_volume_claim: Some(PodPvcSource {
                claim_name: volume.pvc_name().unwrap_or_default().to_owned(),
                ..Default::default()
            }),
            ..Default::default()
        });
        let path = format!("/mnt/{}", volume.name);
        if block_volumes.contains(&volume.name) {
            container
                .volume_devices
                .get_or_insert_with(Vec::new)
                .push(VolumeDevice {
                    name: volume.name.clone(),
                    device_path: path,
                });
        } else {
            container
                .volume_mounts
                .get_or_insert_with(Vec::new)
                .push(volume_mount(&volume.name, &path));
        }
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(generate_name(&format!("vm-{}-hotplug-", vm.name_any()))),
            labels: Some(labels),
            owner_references: Some(vec![pod_owner_reference(anchor_pod)]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            affinity: Some(Affinity {
                node_affinity: Some(NodeAffinity {
                    required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                        node_selector_terms: vec![NodeSelectorTerm {
                            match_expressions: Some(vec![NodeSelectorRequirement {
                                key: "kubernetes.io/hostname".into(),
                                operator: "In".into(),
                                values: Some(vec![node_name]),
                            }]),
                            ..Default::default()
                        }],
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            containers: vec![container],
            volumes: Some(pod_volumes),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn empty_dir_volume(name: &str) -> PodVolume {
    PodVolume {
        name: name.to_owned(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret_name: &str) -> PodVolume {
    PodVolume {
        name: name.to_owned(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_owned()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn volume_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_owned(),
        mount_path: path.to_owned(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtink_api::vm::{
        ContainerDiskVolumeSource, Cpu, Instance, Interface, InterfaceBindingMethod,
        InterfaceBridge, Memory, Network, NetworkSource, PodNetworkSource, VirtualMachineSpec,
        VolumeSource,
    };

    fn test_vm() -> VirtualMachine {
        let mut vm = VirtualMachine::new(
            "ubuntu",
            VirtualMachineSpec {
                instance: Instance {
                    cpu: Cpu {
                        sockets: 1,
                        cores_per_socket: 1,
                        dedicated_cpu_placement: false,
                    },
                    memory: Memory {
                        size: Some(Quantity("1Gi".into())),
                        ..Default::default()
                    },
                    interfaces: vec![Interface {
                        name: "pod".into(),
                        mac: "52:54:00:12:34:56".into(),
                        binding: InterfaceBindingMethod {
                            bridge: Some(InterfaceBridge {}),
                            ..Default::default()
                        },
                    }],
                    ..Default::default()
                },
                networks: vec![Network {
                    name: "pod".into(),
                    source: NetworkSource {
                        pod: Some(PodNetworkSource {}),
                        ..Default::default()
                    },
                }],
                ..Default::default()
            },
        );
        vm.metadata.namespace = Some("default".into());
        vm.metadata.uid = Some("vm-uid-1".into());
        vm
    }

    #[test]
    fn run_predicate_by_policy() {
        use VirtualMachinePhase::*;
        use VirtualMachinePowerAction::PowerOn;

        assert!(should_run(RunPolicy::Always, Some(Failed), None));
        assert!(should_run(RunPolicy::RerunOnFailure, Some(Failed), None));
        assert!(should_run(RunPolicy::RerunOnFailure, None, None));
        assert!(!should_run(RunPolicy::RerunOnFailure, Some(Succeeded), None));
        assert!(should_run(RunPolicy::RerunOnFailure, Some(Succeeded), Some(PowerOn)));
        assert!(should_run(RunPolicy::Once, None, None));
        assert!(!should_run(RunPolicy::Once, Some(Succeeded), None));
        assert!(!should_run(RunPolicy::Manual, None, None));
        assert!(should_run(RunPolicy::Manual, Some(Failed), Some(PowerOn)));
        assert!(!should_run(RunPolicy::Halted, None, Some(PowerOn)));
    }

    #[test]
    fn pod_phase_mapping() {
        assert_eq!(
            pod_phase_to_vm_phase("Succeeded"),
            Some(VirtualMachinePhase::Succeeded)
        );
        assert_eq!(
            pod_phase_to_vm_phase("Failed"),
            Some(VirtualMachinePhase::Failed)
        );
        assert_eq!(
            pod_phase_to_vm_phase("Unknown"),
            Some(VirtualMachinePhase::Unknown)
        );
        assert_eq!(pod_phase_to_vm_phase("Running"), None);
        assert_eq!(pod_phase_to_vm_phase("Pending"), None);
    }

    #[test]
    fn generated_names_have_prefix_and_suffix() {
        let name = generate_name("vm-ubuntu-");
        assert!(name.starts_with("vm-ubuntu-"));
        assert_eq!(name.len(), "vm-ubuntu-".len() + 5);
        assert_ne!(generate_name("vm-ubuntu-"), generate_name("vm-ubuntu-"));
    }

    #[test]
    fn vm_pod_carries_device_resources_and_mounts() {
        let vm = test_vm();
        let pod = build_vm_pod(&vm, "prerunner:latest", &BTreeSet::new(), &BTreeMap::new(), false)
            .unwrap();

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let container = &spec.containers[0];
        assert_eq!(container.name, "cloud-hypervisor");

        let limits = container.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits[KVM_DEVICE_RESOURCE].0, "1");
        assert_eq!(limits[TUN_DEVICE_RESOURCE].0, "1");

        let caps = container
            .security_context
            .as_ref()
            .unwrap()
            .capabilities
            .as_ref()
            .unwrap()
            .add
            .as_ref()
            .unwrap();
        assert!(caps.contains(&"SYS_ADMIN".to_owned()));
        assert!(caps.contains(&"SYS_RESOURCE".to_owned()));

        let mounts = container.volume_mounts.as_ref().unwrap();
        let hotplug = mounts.iter().find(|m| m.name == "hotplug-volumes").unwrap();
        assert_eq!(hotplug.mount_path, "/hotplug-volumes");
        assert_eq!(hotplug.mount_propagation.as_deref(), Some("HostToContainer"));

        let env = container.env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "VM_DATA"));
        assert!(!env.iter().any(|e| e.name == "RECEIVE_MIGRATION"));

        assert_eq!(
            pod.labels().get(VM_NAME_LABEL).map(String::as_str),
            Some("ubuntu")
        );
    }

    #[test]
    fn container_disk_gets_init_container() {
        let mut vm = test_vm();
        vm.spec.volumes = vec![Volume {
            name: "root".into(),
            source: VolumeSource {
                container_disk: Some(ContainerDiskVolumeSource {
                    image: "ubuntu:22.04".into(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        }];
        let pod = build_vm_pod(&vm, "prerunner:latest", &BTreeSet::new(), &BTreeMap::new(), false)
            .unwrap();
        let spec = pod.spec.as_ref().unwrap();
        let init = &spec.init_containers.as_ref().unwrap()[0];
        assert_eq!(init.name, "init-volume-root");
        assert_eq!(init.args.as_ref().unwrap()[0], "/mnt/root/disk.raw");
    }

    #[test]
    fn block_pvc_volume_uses_volume_device() {
        let mut vm = test_vm();
        vm.spec.volumes = vec![Volume {
            name: "data".into(),
            source: VolumeSource {
                persistent_volume_claim: Some(
                    virtink_api::vm::PersistentVolumeClaimVolumeSource {
                        claim_name: "pvc-data".into(),
                        hotpluggable: false,
                    },
                ),
                ..Default::default()
            },
        }];
        let block: BTreeSet<String> = ["data".to_owned()].into_iter().collect();
        let pod =
            build_vm_pod(&vm, "prerunner:latest", &block, &BTreeMap::new(), false).unwrap();
        let container = &pod.spec.as_ref().unwrap().containers[0];
        let devices = container.volume_devices.as_ref().unwrap();
        assert_eq!(devices[0].device_path, "/mnt/data");
        let env = container.env.as_ref().unwrap();
        let block_env = env.iter().find(|e| e.name == "BLOCK_VOLUMES").unwrap();
        assert_eq!(block_env.value.as_deref(), Some("data"));
    }

    #[test]
    fn target_pod_gets_anti_affinity_and_env() {
        let vm = test_vm();
        let pod = build_vm_pod(&vm, "prerunner:latest", &BTreeSet::new(), &BTreeMap::new(), true)
            .unwrap();
        let spec = pod.spec.as_ref().unwrap();
        let env = spec.containers[0].env.as_ref().unwrap();
        assert!(env
            .iter()
            .any(|e| e.name == "RECEIVE_MIGRATION" && e.value.as_deref() == Some("true")));

        let terms = spec
            .affinity
            .as_ref()
            .unwrap()
            .pod_anti_affinity
            .as_ref()
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .as_ref()
            .unwrap();
        assert_eq!(terms[0].topology_key, "kubernetes.io/hostname");
        assert_eq!(
            terms[0]
                .label_selector
                .as_ref()
                .unwrap()
                .match_labels
                .as_ref()
                .unwrap()[VM_NAME_LABEL],
            "ubuntu"
        );
    }

    #[test]
    fn hotplug_volume_pod_matches_ready_set() {
        let vm = test_vm();
        let mut anchor = Pod::default();
        anchor.metadata.name = Some("vm-ubuntu-abcde".into());
        anchor.metadata.uid = Some("pod-uid-1".into());
        anchor.spec = Some(PodSpec {
            node_name: Some("node-1".into()),
            containers: vec![],
            ..Default::default()
        });

        let ready = vec![Volume {
            name: "data".into(),
            source: VolumeSource {
                persistent_volume_claim: Some(
                    virtink_api::vm::PersistentVolumeClaimVolumeSource {
                        claim_name: "pvc-data".into(),
                        hotpluggable: true,
                    },
                ),
                ..Default::default()
            },
        }];
        let pod = build_hotplug_volume_pod(&vm, &anchor, &ready, &BTreeSet::new(), "prerunner");

        let owner = &pod.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "Pod");
        assert_eq!(owner.uid, "pod-uid-1");
        assert_eq!(owner.controller, Some(true));

        let spec = pod.spec.as_ref().unwrap();
        let volumes = spec.volumes.as_ref().unwrap();
        assert!(volumes.iter().any(|v| v.name == "hotplug" && v.empty_dir.is_some()));
        let volume = volumes.iter().find(|v| v.name == "data").unwrap();
        assert_eq!(
            volume
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "pvc-data"
        );
        let node_values = spec
            .affinity
            .as_ref()
            .unwrap()
            .node_affinity
            .as_ref()
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .as_ref()
            .unwrap()
            .node_selector_terms[0]
            .match_expressions
            .as_ref()
            .unwrap()[0]
            .values
            .as_ref()
            .unwrap()
            .clone();
        assert_eq!(node_values, vec!["node-1".to_owned()]);
        assert_eq!(pod.labels().get(HOTPLUG_POD_LABEL).map(String::as_str), Some("true"));
    }

    #[test]
    fn migratable_forbidding_features() {
        let vm = test_vm();
        // bridge on the pod network
        let (ok, reason) = compute_migratable(&vm);
        assert!(!ok);
        assert!(reason.contains("pod network"));

        let mut vm = test_vm();
        vm.spec.instance.interfaces[0].binding = InterfaceBindingMethod {
            masquerade: Some(Default::default()),
            ..Default::default()
        };
        let (ok, _) = compute_migratable(&vm);
        assert!(ok);

        vm.spec.instance.cpu.dedicated_cpu_placement = true;
        let (ok, _) = compute_migratable(&vm);
        assert!(!ok);

        let mut vm = test_vm();
        vm.spec.instance.interfaces[0].binding = InterfaceBindingMethod {
            masquerade: Some(Default::default()),
            ..Default::default()
        };
        vm.spec.volumes = vec![Volume {
            name: "root".into(),
            source: VolumeSource {
                container_disk: Some(ContainerDiskVolumeSource {
                    image: "img:v1".into(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        }];
        let (ok, reason) = compute_migratable(&vm);
        assert!(!ok);
        assert!(reason.contains("root"));
    }

    #[test]
    fn volume_phase_order_is_monotonic() {
        assert!(volume_phase_rank(VolumePhase::Pending) < volume_phase_rank(VolumePhase::AttachedToNode));
        assert!(
            volume_phase_rank(VolumePhase::AttachedToNode)
                < volume_phase_rank(VolumePhase::MountedToPod)
        );
        assert!(volume_phase_rank(VolumePhase::MountedToPod) < volume_phase_rank(VolumePhase::Ready));
        assert!(volume_phase_rank(VolumePhase::Ready) < volume_phase_rank(VolumePhase::Detaching));
    }
}
