//! The `VirtualMachine` custom resource.
//!
//! The wire format keeps the tagged variants (interface binding, volume
//! source, network source) as structs of optional sub-structs so that
//! manifests stay compatible with the original API group; accessor helpers
//! give them a sum-type reading and admission enforces exactly-one.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Affinity, Probe, ResourceRequirements, Toleration};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer that holds VM deletion until all owned pods are gone.
pub const VM_PROTECTION_FINALIZER: &str = "virt.virtink.smartx.com/vm-protection";

/// Condition type mirroring the VMM pod's readiness.
pub const CONDITION_READY: &str = "Ready";

/// Condition type recording live-migration eligibility.
pub const CONDITION_MIGRATABLE: &str = "Migratable";

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "virt.virtink.smartx.com",
    version = "v1alpha1",
    kind = "VirtualMachine",
    namespaced,
    status = "VirtualMachineStatus",
    shortname = "vm",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.nodeName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<Probe>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_policy: Option<RunPolicy>,

    pub instance: Instance,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<Network>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum RunPolicy {
    Always,
    RerunOnFailure,
    Once,
    Manual,
    Halted,
}

impl Default for RunPolicy {
    fn default() -> Self {
        RunPolicy::Once
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    #[serde(default)]
    pub cpu: Cpu,
    pub memory: Memory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<Kernel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<Disk>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_systems: Vec<FileSystem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,
}

impl Instance {
    /// Total number of vCPUs exposed to the guest.
    pub fn vcpu_count(&self) -> u32 {
        self.cpu.sockets * self.cpu.cores_per_socket
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Cpu {
    #[serde(default)]
    pub sockets: u32,
    #[serde(default)]
    pub cores_per_socket: u32,
    #[serde(default)]
    pub dedicated_cpu_placement: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hugepages: Option<Hugepages>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Hugepages {
    /// Hugepage size, either `2Mi` or `1Gi`.
    pub page_size: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Kernel {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    pub cmdline: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
}

/// A virtiofs share backed by the volume of the same name.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileSystem {
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
    #[serde(flatten)]
    pub binding: InterfaceBindingMethod,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceBindingMethod {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<InterfaceBridge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masquerade: Option<InterfaceMasquerade>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sriov: Option<InterfaceSriov>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vhost_user: Option<InterfaceVhostUser>,
}

impl InterfaceBindingMethod {
    /// Number of binding methods set. Admission requires exactly one.
    pub fn variant_count(&self) -> usize {
        [
            self.bridge.is_some(),
            self.masquerade.is_some(),
            self.sriov.is_some(),
            self.vhost_user.is_some(),
        ]
        .iter()
        .filter(|v| **v)
        .count()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct InterfaceBridge {}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct InterfaceMasquerade {
    #[serde(default, rename = "ipv4CIDR", skip_serializing_if = "String::is_empty")]
    pub ipv4_cidr: String,
    #[serde(default, rename = "ipv6CIDR", skip_serializing_if = "String::is_empty")]
    pub ipv6_cidr: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct InterfaceSriov {}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct InterfaceVhostUser {}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    #[serde(flatten)]
    pub source: VolumeSource,
}

impl Volume {
    /// Whether this volume may be attached to and detached from a running VM.
    pub fn is_hotpluggable(&self) -> bool {
        match &self.source {
            VolumeSource {
                persistent_volume_claim: Some(pvc),
                ..
            } => pvc.hotpluggable,
            VolumeSource {
                data_volume: Some(dv),
                ..
            } => dv.hotpluggable,
            _ => false,
        }
    }

    /// Name of the PVC backing this volume, for PVC and DataVolume sources.
    pub fn pvc_name(&self) -> Option<&str> {
        if let Some(pvc) = &self.source.persistent_volume_claim {
            return Some(&pvc.claim_name);
        }
        if let Some(dv) = &self.source.data_volume {
            return Some(&dv.volume_name);
        }
        None
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_disk: Option<ContainerDiskVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init: Option<CloudInitVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_rootfs: Option<ContainerRootfsVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PersistentVolumeClaimVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume: Option<DataVolumeVolumeSource>,
}

impl VolumeSource {
    pub fn variant_count(&self) -> usize {
        [
            self.container_disk.is_some(),
            self.cloud_init.is_some(),
            self.container_rootfs.is_some(),
            self.persistent_volume_claim.is_some(),
            self.data_volume.is_some(),
        ]
        .iter()
        .filter(|v| **v)
        .count()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDiskVolumeSource {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudInitVolumeSource {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_data: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_data_base64: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_data_secret_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network_data: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network_data_base64: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network_data_secret_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRootfsVolumeSource {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    pub size: Quantity,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimVolumeSource {
    pub claim_name: String,
    #[serde(default)]
    pub hotpluggable: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeVolumeSource {
    pub volume_name: String,
    #[serde(default)]
    pub hotpluggable: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub name: String,
    #[serde(flatten)]
    pub source: NetworkSource,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodNetworkSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multus: Option<MultusNetworkSource>,
}

impl NetworkSource {
    pub fn variant_count(&self) -> usize {
        [self.pod.is_some(), self.multus.is_some()]
            .iter()
            .filter(|v| **v)
            .count()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PodNetworkSource {}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MultusNetworkSource {
    pub network_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<VirtualMachinePhase>,
    #[serde(default, rename = "vmPodName", skip_serializing_if = "String::is_empty")]
    pub vm_pod_name: String,
    #[serde(default, rename = "vmPodUID", skip_serializing_if = "String::is_empty")]
    pub vm_pod_uid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_action: Option<VirtualMachinePowerAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<VirtualMachineStatusMigration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_status: Vec<VolumeStatus>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum VirtualMachinePhase {
    Pending,
    Scheduling,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl VirtualMachinePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VirtualMachinePhase::Succeeded | VirtualMachinePhase::Failed
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum VirtualMachinePowerAction {
    PowerOn,
    PowerOff,
    Shutdown,
    Reset,
    Reboot,
    Pause,
    Resume,
}

/// The VM's migration slot. At most one migration binds to a VM at a time;
/// the UID identifies the owning `VirtualMachineMigration`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatusMigration {
    #[serde(default, rename = "uid", skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<crate::migration::VirtualMachineMigrationPhase>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_node_name: String,
    #[serde(
        default,
        rename = "targetVMPodName",
        skip_serializing_if = "String::is_empty"
    )]
    pub target_vm_pod_name: String,
    #[serde(
        default,
        rename = "targetVMPodUID",
        skip_serializing_if = "String::is_empty"
    )]
    pub target_vm_pod_uid: String,
    #[serde(default, rename = "targetNodeIP", skip_serializing_if = "String::is_empty")]
    pub target_node_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_port: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<VolumePhase>,
}

/// Hotplug volume phases. The vector is monotonic per (VM, volume): a volume
/// walks Pending → AttachedToNode → MountedToPod → Ready, and leaves through
/// Detaching.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum VolumePhase {
    Pending,
    AttachedToNode,
    MountedToPod,
    Ready,
    Detaching,
}

impl VirtualMachine {
    /// Volume status entry for `name`, if recorded.
    pub fn volume_phase(&self, name: &str) -> Option<VolumePhase> {
        self.status
            .as_ref()?
            .volume_status
            .iter()
            .find(|v| v.name == name)
            .and_then(|v| v.phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_binding_round_trips_inline() {
        let iface: Interface = serde_json::from_str(
            r#"{"name": "pod", "mac": "52:54:00:12:34:56", "masquerade": {"ipv4CIDR": "10.0.2.0/30"}}"#,
        )
        .unwrap();
        assert_eq!(iface.binding.variant_count(), 1);
        assert_eq!(
            iface.binding.masquerade.as_ref().unwrap().ipv4_cidr,
            "10.0.2.0/30"
        );

        let out = serde_json::to_value(&iface).unwrap();
        assert!(out.get("masquerade").is_some());
        assert!(out.get("bridge").is_none());
    }

    #[test]
    fn volume_source_accessors() {
        let volume: Volume = serde_json::from_str(
            r#"{"name": "data", "persistentVolumeClaim": {"claimName": "pvc-data", "hotpluggable": true}}"#,
        )
        .unwrap();
        assert!(volume.is_hotpluggable());
        assert_eq!(volume.pvc_name(), Some("pvc-data"));
        assert_eq!(volume.source.variant_count(), 1);

        let volume: Volume = serde_json::from_str(
            r#"{"name": "root", "containerDisk": {"image": "ubuntu:22.04"}}"#,
        )
        .unwrap();
        assert!(!volume.is_hotpluggable());
        assert_eq!(volume.pvc_name(), None);
    }

    #[test]
    fn phase_terminality() {
        assert!(VirtualMachinePhase::Succeeded.is_terminal());
        assert!(VirtualMachinePhase::Failed.is_terminal());
        assert!(!VirtualMachinePhase::Running.is_terminal());
        assert!(!VirtualMachinePhase::Unknown.is_terminal());
    }

    #[test]
    fn status_serializes_migration_pod_fields() {
        let status = VirtualMachineStatus {
            phase: Some(VirtualMachinePhase::Running),
            vm_pod_name: "vm-foo-abcde".to_owned(),
            migration: Some(VirtualMachineStatusMigration {
                uid: "uid-1".to_owned(),
                target_vm_pod_name: "vm-foo-target-xyz".to_owned(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let out = serde_json::to_value(&status).unwrap();
        assert_eq!(out["vmPodName"], "vm-foo-abcde");
        assert_eq!(out["migration"]["targetVMPodName"], "vm-foo-target-xyz");
    }
}
