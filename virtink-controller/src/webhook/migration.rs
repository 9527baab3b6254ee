//! Migration admission: eligibility and immutability.

use kube::api::Api;
use kube::Client;

use virtink_api::condition::find_condition;
use virtink_api::migration::VirtualMachineMigration;
use virtink_api::vm::{VirtualMachine, CONDITION_MIGRATABLE};

use super::FieldError;

/// The migration spec is fully immutable; `vmName` must name a live VM whose
/// `Migratable` condition is `True`.
pub async fn validate_migration(
    client: &Client,
    namespace: &str,
    vmm: &VirtualMachineMigration,
    old_vmm: Option<&VirtualMachineMigration>,
) -> Result<Vec<FieldError>, kube::Error> {
    let mut errs = Vec::new();

    if let Some(old_vmm) = old_vmm {
        if old_vmm.spec != vmm.spec {
            errs.push(FieldError::new("spec", "migration spec may not be updated"));
            return Ok(errs);
        }
    }

    if vmm.spec.vm_name.is_empty() {
        errs.push(FieldError::required("spec.vmName"));
        return Ok(errs);
    }

    let vms: Api<VirtualMachine> = Api::namespaced(client.clone(), namespace);
    let vm = match vms.get_opt(&vmm.spec.vm_name).await? {
        Some(vm) => vm,
        None => {
            errs.push(FieldError::new(
                "spec.vmName",
                &format!("VM {:?} not found", vmm.spec.vm_name),
            ));
            return Ok(errs);
        }
    };

    errs.extend(check_migratable(&vm));
    Ok(errs)
}

pub fn check_migratable(vm: &VirtualMachine) -> Vec<FieldError> {
    let condition = vm
        .status
        .as_ref()
        .and_then(|s| find_condition(&s.conditions, CONDITION_MIGRATABLE));
    match condition {
        None => vec![FieldError::new(
            "spec.vmName",
            "VM migratable condition status is unknown",
        )],
        Some(condition) if condition.status != "True" => {
            vec![FieldError::new("spec.vmName", &condition.message)]
        }
        Some(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtink_api::condition::new_condition;
    use virtink_api::vm::{VirtualMachineSpec, VirtualMachineStatus};

    fn vm_with_migratable(status: Option<bool>) -> VirtualMachine {
        let mut vm = VirtualMachine::new("ubuntu", VirtualMachineSpec::default());
        let mut conditions = Vec::new();
        if let Some(migratable) = status {
            conditions.push(new_condition(
                CONDITION_MIGRATABLE,
                migratable,
                if migratable { "Migratable" } else { "NotMigratable" },
                if migratable { "" } else { "VM with dedicated CPU placement is not migratable" },
            ));
        }
        vm.status = Some(VirtualMachineStatus {
            conditions,
            ..Default::default()
        });
        vm
    }

    #[test]
    fn missing_condition_is_rejected() {
        let errs = check_migratable(&vm_with_migratable(None));
        assert!(errs[0].message.contains("unknown"));
    }

    #[test]
    fn false_condition_is_rejected_with_its_message() {
        let errs = check_migratable(&vm_with_migratable(Some(false)));
        assert!(errs[0].message.contains("dedicated CPU placement"));
    }

    #[test]
    fn true_condition_is_accepted() {
        assert!(check_migratable(&vm_with_migratable(Some(true))).is_empty());
    }
}
