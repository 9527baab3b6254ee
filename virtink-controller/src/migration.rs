//! Migration reconciler.
//!
//! Binds a `VirtualMachineMigration` to its VM's migration slot and mirrors
//! the daemon-driven phase back into the migration status. The slot carries
//! the migration's UID; a VM accepts at most one migration at a time.

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use tracing::{info, warn};

use virtink_api::migration::{
    VirtualMachineMigration, VirtualMachineMigrationPhase, VirtualMachineMigrationStatus,
};
use virtink_api::vm::{VirtualMachine, VirtualMachineStatusMigration};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes API: {0}")]
    Kube(#[from] kube::Error),
    #[error("serialize: {0}")]
    Serde(#[from] serde_json::Error),
}

pub struct Context {
    pub client: Client,
    pub reporter: Reporter,
}

/// What a reconcile pass should do with the VM's migration slot.
#[derive(Debug, PartialEq)]
pub enum BindDecision {
    /// Terminal migration still bound to the VM: clear the slot.
    ClearSlot,
    /// Terminal migration, slot already released: nothing to do.
    Done,
    /// The VM is gone, deleting, or bound to another migration.
    Fail,
    /// The slot is free: acquire it.
    Acquire,
    /// The slot is ours: mirror the VM-side phase and target node.
    Mirror {
        phase: Option<VirtualMachineMigrationPhase>,
        target_node_name: String,
    },
}

/// Pure binding decision; the VM is `None` when not found.
pub fn bind_decision(
    vmm_uid: &str,
    vmm_phase: Option<VirtualMachineMigrationPhase>,
    vm: Option<&VirtualMachine>,
) -> BindDecision {
    let vm_unusable = match vm {
        None => true,
        Some(vm) => vm.metadata.deletion_timestamp.is_some(),
    };
    let slot = vm.and_then(|vm| vm.status.as_ref()).and_then(|s| s.migration.as_ref());

    if vmm_phase.map(|p| p.is_terminal()).unwrap_or(false) {
        let still_bound = !vm_unusable && slot.map(|m| m.uid == vmm_uid).unwrap_or(false);
        return if still_bound {
            BindDecision::ClearSlot
        } else {
            BindDecision::Done
        };
    }

    if vm_unusable || slot.map(|m| m.uid != vmm_uid).unwrap_or(false) {
        return BindDecision::Fail;
    }

    match slot {
        None => BindDecision::Acquire,
        Some(slot) => BindDecision::Mirror {
            phase: slot.phase,
            target_node_name: slot.target_node_name.clone(),
        },
    }
}

pub async fn reconcile(
    vmm: Arc<VirtualMachineMigration>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let namespace = vmm.namespace().unwrap_or_default();
    let name = vmm.name_any();
    let api: Api<VirtualMachineMigration> = Api::namespaced(ctx.client.clone(), &namespace);

    let mut vmm = (*vmm).clone();
    if vmm.status.is_none() {
        vmm.status = Some(VirtualMachineMigrationStatus::default());
    }
    let observed_status = vmm.status.clone();

    if let Err(e) = reconcile_migration(&mut vmm, &ctx).await {
        let recorder = Recorder::new(ctx.client.clone(), ctx.reporter.clone(), vmm.object_ref(&()));
        let _ = recorder
            .publish(Event {
                type_: EventType::Warning,
                reason: "FailedReconcile".into(),
                note: Some(format!("Failed to reconcile VMMigration: {}", e)),
                action: "Reconcile".into(),
                secondary: None,
            })
            .await;
        return Err(e);
    }

    if vmm.status != observed_status {
        match api
            .replace_status(&name, &PostParams::default(), serde_json::to_vec(&vmm)?)
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                return Ok(Action::requeue(Duration::from_secs(1)));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Action::await_change())
}

pub fn error_policy(
    vmm: Arc<VirtualMachineMigration>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    warn!(migration = %vmm.name_any(), error = %error, "migration reconcile failed");
    Action::requeue(Duration::from_secs(5))
}

async fn reconcile_migration(
    vmm: &mut VirtualMachineMigration,
    ctx: &Context,
) -> Result<(), Error> {
    if vmm.metadata.deletion_timestamp.is_some() {
        return Ok(());
    }

    let namespace = vmm.namespace().unwrap_or_default();
    let vms: Api<VirtualMachine> = Api::namespaced(ctx.client.clone(), &namespace);
    let vm = vms.get_opt(&vmm.spec.vm_name).await?;

    let vmm_uid = vmm.uid().unwrap_or_default();
    let vmm_phase = vmm.status.as_ref().and_then(|s| s.phase);
    match bind_decision(&vmm_uid, vmm_phase, vm.as_ref()) {
        BindDecision::Done => {}
        BindDecision::ClearSlot => {
            let mut vm = vm.expect("slot is bound");
            if let Some(status) = vm.status.as_mut() {
                status.migration = None;
            }
            let name = vm.name_any();
            vms.replace_status(&name, &PostParams::default(), serde_json::to_vec(&vm)?)
                .await?;
            info!(migration = %vmm.name_any(), vm = %name, "released VM migration slot");
        }
        BindDecision::Fail => {
            vmm.status.get_or_insert_with(Default::default).phase =
                Some(VirtualMachineMigrationPhase::Failed);
        }
        BindDecision::Acquire => {
            let mut vm = vm.expect("slot is free on a live VM");
            let node_name = vm
                .status
                .as_ref()
                .map(|s| s.node_name.clone())
                .unwrap_or_default();
            vm.status.get_or_insert_with(Default::default).migration =
                Some(VirtualMachineStatusMigration {
                    uid: vmm_uid.clone(),
                    ..Default::default()
                });
            let name = vm.name_any();
            vms.replace_status(&name, &PostParams::default(), serde_json::to_vec(&vm)?)
                .await?;
            vmm.status.get_or_insert_with(Default::default).source_node_name = node_name;
            info!(migration = %vmm.name_any(), vm = %name, "bound VM migration slot");
        }
        BindDecision::Mirror {
            phase,
            target_node_name,
        } => {
            let status = vmm.status.get_or_insert_with(Default::default);
            status.phase = phase;
            if !target_node_name.is_empty() {
                status.target_node_name = target_node_name;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use virtink_api::vm::{VirtualMachineSpec, VirtualMachineStatus};

    fn vm_with_slot(uid: Option<&str>) -> VirtualMachine {
        let mut vm = VirtualMachine::new("ubuntu", VirtualMachineSpec::default());
        vm.status = Some(VirtualMachineStatus {
            node_name: "node-1".into(),
            migration: uid.map(|uid| VirtualMachineStatusMigration {
                uid: uid.into(),
                phase: Some(VirtualMachineMigrationPhase::Running),
                target_node_name: "node-2".into(),
                ..Default::default()
            }),
            ..Default::default()
        });
        vm
    }

    #[test]
    fn missing_vm_fails_migration() {
        assert_eq!(bind_decision("uid-1", None, None), BindDecision::Fail);
    }

    #[test]
    fn deleting_vm_fails_migration() {
        let mut vm = vm_with_slot(None);
        vm.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        assert_eq!(bind_decision("uid-1", None, Some(&vm)), BindDecision::Fail);
    }

    #[test]
    fn foreign_slot_fails_migration_without_touching_source() {
        let vm = vm_with_slot(Some("other-uid"));
        assert_eq!(bind_decision("uid-1", None, Some(&vm)), BindDecision::Fail);
    }

    #[test]
    fn free_slot_is_acquired() {
        let vm = vm_with_slot(None);
        assert_eq!(bind_decision("uid-1", None, Some(&vm)), BindDecision::Acquire);
    }

    #[test]
    fn own_slot_is_mirrored() {
        let vm = vm_with_slot(Some("uid-1"));
        assert_eq!(
            bind_decision("uid-1", None, Some(&vm)),
            BindDecision::Mirror {
                phase: Some(VirtualMachineMigrationPhase::Running),
                target_node_name: "node-2".into(),
            }
        );
    }

    #[test]
    fn terminal_migration_clears_own_slot_only() {
        let vm = vm_with_slot(Some("uid-1"));
        assert_eq!(
            bind_decision("uid-1", Some(VirtualMachineMigrationPhase::Succeeded), Some(&vm)),
            BindDecision::ClearSlot
        );

        let vm = vm_with_slot(Some("other-uid"));
        assert_eq!(
            bind_decision("uid-1", Some(VirtualMachineMigrationPhase::Failed), Some(&vm)),
            BindDecision::Done
        );

        assert_eq!(
            bind_decision("uid-1", Some(VirtualMachineMigrationPhase::Failed), None),
            BindDecision::Done
        );
    }
}
