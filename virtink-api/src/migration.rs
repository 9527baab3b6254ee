//! The `VirtualMachineMigration` custom resource.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "virt.virtink.smartx.com",
    version = "v1alpha1",
    kind = "VirtualMachineMigration",
    namespaced,
    status = "VirtualMachineMigrationStatus",
    shortname = "vmm",
    printcolumn = r#"{"name":"VM","type":"string","jsonPath":".spec.vmName"}"#,
    printcolumn = r#"{"name":"Source","type":"string","jsonPath":".status.sourceNodeName"}"#,
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".status.targetNodeName"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineMigrationSpec {
    /// Name of the VM to migrate. Immutable after creation.
    #[serde(rename = "vmName")]
    pub vm_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineMigrationStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<VirtualMachineMigrationPhase>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_node_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_node_name: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum VirtualMachineMigrationPhase {
    Pending,
    Scheduling,
    Scheduled,
    TargetReady,
    Running,
    Sent,
    Succeeded,
    Failed,
}

impl VirtualMachineMigrationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VirtualMachineMigrationPhase::Succeeded | VirtualMachineMigrationPhase::Failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_terminality() {
        assert!(VirtualMachineMigrationPhase::Succeeded.is_terminal());
        assert!(VirtualMachineMigrationPhase::Failed.is_terminal());
        assert!(!VirtualMachineMigrationPhase::Sent.is_terminal());
    }

    #[test]
    fn spec_uses_vm_name_key() {
        let spec: VirtualMachineMigrationSpec =
            serde_json::from_str(r#"{"vmName": "ubuntu"}"#).unwrap();
        assert_eq!(spec.vm_name, "ubuntu");
    }
}
