//! VM admission: defaulting and validation.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use rand::Rng;

use virtink_api::quantity::{self, parse_quantity};
use virtink_api::vm::{InterfaceBindingMethod, InterfaceBridge, VirtualMachine, Volume};
use virtink_api::RunPolicy;

use super::FieldError;

const MEMORY_OVERHEAD: i64 = 256 << 20;
const DEFAULT_MEMORY_SIZE: &str = "1Gi";
const DEFAULT_IPV4_CIDR: &str = "10.0.2.0/30";
const DEFAULT_IPV6_CIDR: &str = "fd10:0:2::/120";

/// Apply creation/update defaults. `old_vm` is the previous object on
/// updates, used to keep MAC addresses stable across same-named interfaces.
pub fn mutate_vm(vm: &mut VirtualMachine, old_vm: Option<&VirtualMachine>) -> anyhow::Result<()> {
    if vm.spec.run_policy.is_none() {
        vm.spec.run_policy = Some(RunPolicy::Once);
    }

    let cpu = &mut vm.spec.instance.cpu;
    if cpu.sockets == 0 {
        cpu.sockets = 1;
    }
    if cpu.cores_per_socket == 0 {
        cpu.cores_per_socket = 1;
    }

    if vm.spec.instance.memory.size.is_none() {
        let requested = vm
            .spec
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("memory"))
            .cloned();
        vm.spec.instance.memory.size =
            Some(requested.unwrap_or_else(|| Quantity(DEFAULT_MEMORY_SIZE.into())));
    }

    for iface in vm.spec.instance.interfaces.iter_mut() {
        if iface.binding.variant_count() == 0 {
            iface.binding = InterfaceBindingMethod {
                bridge: Some(InterfaceBridge {}),
                ..Default::default()
            };
        }
        if let Some(masquerade) = iface.binding.masquerade.as_mut() {
            if masquerade.ipv4_cidr.is_empty() {
                masquerade.ipv4_cidr = DEFAULT_IPV4_CIDR.into();
            }
            if masquerade.ipv6_cidr.is_empty() {
                masquerade.ipv6_cidr = DEFAULT_IPV6_CIDR.into();
            }
        }
        if iface.mac.is_empty() {
            let reused = old_vm.and_then(|old| {
                old.spec
                    .instance
                    .interfaces
                    .iter()
                    .find(|i| i.name == iface.name && !i.mac.is_empty())
                    .map(|i| i.mac.clone())
            });
            iface.mac = reused.unwrap_or_else(generate_mac);
        }
    }

    let memory_size = vm
        .spec
        .instance
        .memory
        .size
        .as_ref()
        .and_then(|q| parse_quantity(q).ok());
    let has_hugepages = vm.spec.instance.memory.hugepages.is_some();

    if vm.spec.instance.cpu.dedicated_cpu_placement {
        let vcpus = vm.spec.instance.vcpu_count();
        let resources = vm.spec.resources.get_or_insert_with(Default::default);
        let cpu_quantity = Quantity(vcpus.to_string());
        resources
            .requests
            .get_or_insert_with(Default::default)
            .insert("cpu".into(), cpu_quantity.clone());
        resources
            .limits
            .get_or_insert_with(Default::default)
            .insert("cpu".into(), cpu_quantity);

        if let Some(size) = memory_size {
            let total = if has_hugepages {
                MEMORY_OVERHEAD
            } else {
                size + MEMORY_OVERHEAD
            };
            let memory_quantity = quantity::from_bytes(total);
            resources
                .requests
                .get_or_insert_with(Default::default)
                .insert("memory".into(), memory_quantity.clone());
            resources
                .limits
                .get_or_insert_with(Default::default)
                .insert("memory".into(), memory_quantity);
        }
    }

    if has_hugepages {
        let page_size = vm
            .spec
            .instance
            .memory
            .hugepages
            .as_ref()
            .map(|h| h.page_size.clone())
            .unwrap_or_default();
        if let Some(size) = vm.spec.instance.memory.size.clone() {
            let resource = format!("hugepages-{}", page_size);
            let resources = vm.spec.resources.get_or_insert_with(Default::default);
            resources
                .requests
                .get_or_insert_with(Default::default)
                .insert(resource.clone(), size.clone());
            resources
                .limits
                .get_or_insert_with(Default::default)
                .insert(resource, size);

            let baseline = quantity::from_bytes(MEMORY_OVERHEAD);
            let requests = resources.requests.get_or_insert_with(Default::default);
            if !requests.contains_key("memory") {
                requests.insert("memory".into(), baseline.clone());
                resources
                    .limits
                    .get_or_insert_with(Default::default)
                    .insert("memory".into(), baseline);
            }
        }
    }

    Ok(())
}

/// Locally administered MAC with the fixed 52:54:00 prefix.
pub fn generate_mac() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}

pub fn validate_vm(vm: &VirtualMachine, old_vm: Option<&VirtualMachine>) -> Vec<FieldError> {
    let mut errs = validate_vm_spec(vm);
    if let Some(old_vm) = old_vm {
        errs.extend(validate_vm_update(vm, old_vm));
    }
    errs
}

fn validate_vm_spec(vm: &VirtualMachine) -> Vec<FieldError> {
    let mut errs = Vec::new();
    let spec = &vm.spec;
    let instance = &spec.instance;

    if instance.cpu.sockets < 1 {
        errs.push(FieldError::required("spec.instance.cpu.sockets"));
    }
    if instance.cpu.cores_per_socket < 1 {
        errs.push(FieldError::required("spec.instance.cpu.coresPerSocket"));
    }

    let memory_size = match &instance.memory.size {
        None => {
            errs.push(FieldError::required("spec.instance.memory.size"));
            None
        }
        Some(size) => match parse_quantity(size) {
            Err(e) => {
                errs.push(FieldError::invalid("spec.instance.memory.size", &e.to_string()));
                None
            }
            Ok(bytes) if bytes <= 0 => {
                errs.push(FieldError::invalid(
                    "spec.instance.memory.size",
                    "must be greater than 0",
                ));
                None
            }
            Ok(bytes) => Some(bytes),
        },
    };

    if let Some(hugepages) = &instance.memory.hugepages {
        let page_bytes = match hugepages.page_size.as_str() {
            "2Mi" => Some(2i64 << 20),
            "1Gi" => Some(1i64 << 30),
            _ => {
                errs.push(FieldError::invalid(
                    "spec.instance.memory.hugepages.pageSize",
                    "must be 2Mi or 1Gi",
                ));
                None
            }
        };
        if let (Some(size), Some(page)) = (memory_size, page_bytes) {
            if size % page != 0 {
                errs.push(FieldError::invalid(
                    "spec.instance.memory.size",
                    "must be a multiple of the hugepage size",
                ));
            }
        }

        let resource = format!("hugepages-{}", hugepages.page_size);
        let request = spec
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get(&resource));
        let limit = spec
            .resources
            .as_ref()
            .and_then(|r| r.limits.as_ref())
            .and_then(|r| r.get(&resource));
        match (request, limit, &instance.memory.size) {
            (Some(request), Some(limit), Some(size)) => {
                if !quantity::quantities_equal(request, size) {
                    errs.push(FieldError::invalid(
                        &format!("spec.resources.requests.{}", resource),
                        "must equal the memory size",
                    ));
                }
                if !quantity::quantities_equal(limit, size) {
                    errs.push(FieldError::invalid(
                        &format!("spec.resources.limits.{}", resource),
                        "must equal the memory size",
                    ));
                }
            }
            _ => errs.push(FieldError::required(&format!(
                "spec.resources.requests.{}",
                resource
            ))),
        }

        let has_base_resource = spec
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .map(|r| r.contains_key("cpu") || r.contains_key("memory"))
            .unwrap_or(false);
        if !has_base_resource {
            errs.push(FieldError::required("spec.resources.requests.memory"));
        }
    }

    if instance.cpu.dedicated_cpu_placement {
        errs.extend(validate_dedicated_resources(vm, memory_size));
    }

    if let Some(kernel) = &instance.kernel {
        if kernel.image.is_empty() {
            errs.push(FieldError::required("spec.instance.kernel.image"));
        }
        if kernel.cmdline.is_empty() {
            errs.push(FieldError::required("spec.instance.kernel.cmdline"));
        }
    }

    let mut disk_names = std::collections::BTreeSet::new();
    for (i, disk) in instance.disks.iter().enumerate() {
        if disk.name.is_empty() {
            errs.push(FieldError::required(&format!("spec.instance.disks[{}].name", i)));
        }
        if !disk_names.insert(disk.name.clone()) {
            errs.push(FieldError::duplicate(
                &format!("spec.instance.disks[{}].name", i),
                &disk.name,
            ));
        }
    }
    for (i, fs) in instance.file_systems.iter().enumerate() {
        if fs.name.is_empty() {
            errs.push(FieldError::required(&format!(
                "spec.instance.fileSystems[{}].name",
                i
            )));
        }
        if !disk_names.insert(fs.name.clone()) {
            errs.push(FieldError::duplicate(
                &format!("spec.instance.fileSystems[{}].name", i),
                &fs.name,
            ));
        }
    }

    let mut iface_names = std::collections::BTreeSet::new();
    for (i, iface) in instance.interfaces.iter().enumerate() {
        let path = format!("spec.instance.interfaces[{}]", i);
        if iface.name.is_empty() {
            errs.push(FieldError::required(&format!("{}.name", path)));
        }
        if !iface_names.insert(iface.name.clone()) {
            errs.push(FieldError::duplicate(&format!("{}.name", path), &iface.name));
        }
        if iface.mac.is_empty() {
            errs.push(FieldError::required(&format!("{}.mac", path)));
        } else if !is_valid_mac(&iface.mac) {
            errs.push(FieldError::invalid(&format!("{}.mac", path), "invalid MAC address"));
        }

        match iface.binding.variant_count() {
            0 => errs.push(FieldError::new(&path, "exactly 1 binding method is required")),
            1 => {}
            _ => errs.push(FieldError::new(
                &path,
                "may not specify more than 1 binding method",
            )),
        }
        if let Some(masquerade) = &iface.binding.masquerade {
            errs.extend(validate_ipv4_cidr(
                &masquerade.ipv4_cidr,
                4,
                &format!("{}.masquerade.ipv4CIDR", path),
            ));
            errs.extend(validate_ipv6_cidr(
                &masquerade.ipv6_cidr,
                4,
                &format!("{}.masquerade.ipv6CIDR", path),
            ));
        }
        if iface.binding.vhost_user.is_some() {
            if !instance.cpu.dedicated_cpu_placement {
                errs.push(FieldError::new(
                    &format!("{}.vhostUser", path),
                    "requires dedicated CPU placement",
                ));
            }
            if instance.memory.hugepages.is_none() {
                errs.push(FieldError::new(
                    &format!("{}.vhostUser", path),
                    "requires hugepages",
                ));
            }
        }
    }

    let mut volume_names = std::collections::BTreeSet::new();
    for (i, volume) in spec.volumes.iter().enumerate() {
        let path = format!("spec.volumes[{}]", i);
        if volume.name.is_empty() {
            errs.push(FieldError::required(&format!("{}.name", path)));
        }
        if !volume_names.insert(volume.name.clone()) {
            errs.push(FieldError::duplicate(&format!("{}.name", path), &volume.name));
        }
        errs.extend(validate_volume(volume, &path));
    }

    let mut network_names = std::collections::BTreeSet::new();
    for (i, network) in spec.networks.iter().enumerate() {
        let path = format!("spec.networks[{}]", i);
        if network.name.is_empty() {
            errs.push(FieldError::required(&format!("{}.name", path)));
        }
        if !network_names.insert(network.name.clone()) {
            errs.push(FieldError::duplicate(&format!("{}.name", path), &network.name));
        }
        match network.source.variant_count() {
            0 => errs.push(FieldError::new(&path, "exactly 1 network source is required")),
            1 => {}
            _ => errs.push(FieldError::new(
                &path,
                "may not specify more than 1 network source",
            )),
        }
        if let Some(multus) = &network.source.multus {
            if multus.network_name.is_empty() {
                errs.push(FieldError::required(&format!("{}.multus.networkName", path)));
            }
        }
    }

    errs
}

fn validate_dedicated_resources(vm: &VirtualMachine, memory_size: Option<i64>) -> Vec<FieldError> {
    let mut errs = Vec::new();
    let vcpus = vm.spec.instance.vcpu_count() as i64;
    let resources = vm.spec.resources.as_ref();
    let requests = resources.and_then(|r| r.requests.as_ref());
    let limits = resources.and_then(|r| r.limits.as_ref());

    match requests.and_then(|r| r.get("cpu")) {
        None => errs.push(FieldError::required("spec.resources.requests.cpu")),
        Some(request) => {
            if parse_quantity(request).ok() != Some(vcpus) {
                errs.push(FieldError::invalid(
                    "spec.resources.requests.cpu",
                    "must equal the number of vCPUs",
                ));
            }
            match limits.and_then(|r| r.get("cpu")) {
                None => errs.push(FieldError::required("spec.resources.limits.cpu")),
                Some(limit) if !quantity::quantities_equal(limit, request) => {
                    errs.push(FieldError::invalid(
                        "spec.resources.limits.cpu",
                        "must equal the CPU request",
                    ));
                }
                Some(_) => {}
            }
        }
    }

    let required_memory = match (memory_size, vm.spec.instance.memory.hugepages.is_some()) {
        (_, true) => Some(MEMORY_OVERHEAD),
        (Some(size), false) => Some(size + MEMORY_OVERHEAD),
        (None, false) => None,
    };
    match requests.and_then(|r| r.get("memory")) {
        None => errs.push(FieldError::required("spec.resources.requests.memory")),
        Some(request) => {
            if let (Ok(bytes), Some(required)) = (parse_quantity(request), required_memory) {
                if bytes < required {
                    errs.push(FieldError::invalid(
                        "spec.resources.requests.memory",
                        "must cover the memory size plus overhead",
                    ));
                }
            }
            match limits.and_then(|r| r.get("memory")) {
                None => errs.push(FieldError::required("spec.resources.limits.memory")),
                Some(limit) if !quantity::quantities_equal(limit, request) => {
                    errs.push(FieldError::invalid(
                        "spec.resources.limits.memory",
                        "must equal the memory request",
                    ));
                }
                Some(_) => {}
            }
        }
    }
    errs
}

fn validate_volume(volume: &Volume, path: &str) -> Vec<FieldError> {
    let mut errs = Vec::new();
    match volume.source.variant_count() {
        0 => errs.push(FieldError::new(path, "exactly 1 volume source is required")),
        1 => {}
        _ => errs.push(FieldError::new(path, "may not specify more than 1 volume source")),
    }

    if let Some(disk) = &volume.source.container_disk {
        if disk.image.is_empty() {
            errs.push(FieldError::required(&format!("{}.containerDisk.image", path)));
        }
    }
    if let Some(rootfs) = &volume.source.container_rootfs {
        if rootfs.image.is_empty() {
            errs.push(FieldError::required(&format!("{}.containerRootfs.image", path)));
        }
        match parse_quantity(&rootfs.size) {
            Ok(size) if size > 0 => {}
            _ => errs.push(FieldError::invalid(
                &format!("{}.containerRootfs.size", path),
                "must be greater than 0",
            )),
        }
    }
    if let Some(cloud_init) = &volume.source.cloud_init {
        let user_data = [
            !cloud_init.user_data.is_empty(),
            !cloud_init.user_data_base64.is_empty(),
            !cloud_init.user_data_secret_name.is_empty(),
        ]
        .iter()
        .filter(|v| **v)
        .count();
        if user_data > 1 {
            errs.push(FieldError::new(
                &format!("{}.cloudInit", path),
                "may not specify more than 1 user data",
            ));
        }
        let network_data = [
            !cloud_init.network_data.is_empty(),
            !cloud_init.network_data_base64.is_empty(),
            !cloud_init.network_data_secret_name.is_empty(),
        ]
        .iter()
        .filter(|v| **v)
        .count();
        if network_data > 1 {
            errs.push(FieldError::new(
                &format!("{}.cloudInit", path),
                "may not specify more than 1 network data",
            ));
        }
    }
    if let Some(pvc) = &volume.source.persistent_volume_claim {
        if pvc.claim_name.is_empty() {
            errs.push(FieldError::required(&format!(
                "{}.persistentVolumeClaim.claimName",
                path
            )));
        }
    }
    if let Some(dv) = &volume.source.data_volume {
        if dv.volume_name.is_empty() {
            errs.push(FieldError::required(&format!("{}.dataVolume.volumeName", path)));
        }
    }
    errs
}

/// Only `runPolicy`, `volumes` and `instance.disks` may change; volume edits
/// are limited to adding and removing hotpluggable volumes.
fn validate_vm_update(vm: &VirtualMachine, old_vm: &VirtualMachine) -> Vec<FieldError> {
    let mut errs = Vec::new();

    let mut old_cmp = old_vm.spec.clone();
    let mut new_cmp = vm.spec.clone();
    old_cmp.run_policy = None;
    new_cmp.run_policy = None;
    old_cmp.volumes = Vec::new();
    new_cmp.volumes = Vec::new();
    old_cmp.instance.disks = Vec::new();
    new_cmp.instance.disks = Vec::new();
    if old_cmp != new_cmp {
        errs.push(FieldError::new(
            "spec",
            "may not be updated except runPolicy, volumes and disks",
        ));
        return errs;
    }

    for old_volume in &old_vm.spec.volumes {
        match vm.spec.volumes.iter().find(|v| v.name == old_volume.name) {
            None => {
                if !old_volume.is_hotpluggable() {
                    errs.push(FieldError::new(
                        "spec.volumes",
                        &format!(
                            "non-hotpluggable volume {:?} may not be removed",
                            old_volume.name
                        ),
                    ));
                }
            }
            Some(new_volume) => {
                if !old_volume.is_hotpluggable() && new_volume != old_volume {
                    errs.push(FieldError::new(
                        "spec.volumes",
                        &format!("volume {:?} is immutable", old_volume.name),
                    ));
                }
            }
        }
    }
    for (i, new_volume) in vm.spec.volumes.iter().enumerate() {
        let existed = old_vm.spec.volumes.iter().any(|v| v.name == new_volume.name);
        if !existed && !new_volume.is_hotpluggable() {
            errs.push(FieldError::new(
                &format!("spec.volumes[{}]", i),
                "only hotpluggable volumes may be added",
            ));
        }
    }
    errs
}

fn is_valid_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

fn validate_ipv4_cidr(cidr: &str, min_capacity: u32, path: &str) -> Vec<FieldError> {
    if cidr.is_empty() {
        return vec![FieldError::required(path)];
    }
    match cidr.parse::<ipnet::Ipv4Net>() {
        Err(e) => vec![FieldError::invalid(path, &e.to_string())],
        Ok(net) => {
            let capacity = 1u64 << (32 - net.prefix_len() as u64);
            if capacity < min_capacity as u64 {
                vec![FieldError::invalid(
                    path,
                    &format!("must contain at least {} IPs", min_capacity),
                )]
            } else {
                Vec::new()
            }
        }
    }
}

fn validate_ipv6_cidr(cidr: &str, min_capacity: u32, path: &str) -> Vec<FieldError> {
    if cidr.is_empty() {
        return vec![FieldError::required(path)];
    }
    match cidr.parse::<ipnet::Ipv6Net>() {
        Err(e) => vec![FieldError::invalid(path, &e.to_string())],
        Ok(net) => {
            let free_bits = 128 - net.prefix_len() as u32;
            let capacity = if free_bits >= u64::BITS {
                u64::MAX
            } else {
                1u64 << free_bits
            };
            if capacity < min_capacity as u64 {
                vec![FieldError::invalid(
                    path,
                    &format!("must contain at least {} IPs", min_capacity),
                )]
            } else {
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtink_api::vm::{
        ContainerDiskVolumeSource, Cpu, Hugepages, Instance, Interface, InterfaceMasquerade,
        Memory, PersistentVolumeClaimVolumeSource, VirtualMachineSpec, VolumeSource,
    };

    fn base_vm() -> VirtualMachine {
        VirtualMachine::new(
            "ubuntu",
            VirtualMachineSpec {
                instance: Instance {
                    cpu: Cpu {
                        sockets: 1,
                        cores_per_socket: 2,
                        dedicated_cpu_placement: false,
                    },
                    memory: Memory {
                        size: Some(Quantity("1Gi".into())),
                        ..Default::default()
                    },
                    interfaces: vec![Interface {
                        name: "pod".into(),
                        mac: "52:54:00:aa:bb:cc".into(),
                        binding: InterfaceBindingMethod {
                            bridge: Some(InterfaceBridge {}),
                            ..Default::default()
                        },
                    }],
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    #[test]
    fn mutation_fills_defaults() {
        let mut vm = base_vm();
        vm.spec.run_policy = None;
        vm.spec.instance.cpu.sockets = 0;
        vm.spec.instance.cpu.cores_per_socket = 0;
        vm.spec.instance.memory.size = None;
        vm.spec.instance.interfaces[0].binding = InterfaceBindingMethod::default();
        vm.spec.instance.interfaces[0].mac = String::new();

        mutate_vm(&mut vm, None).unwrap();

        assert_eq!(vm.spec.run_policy, Some(RunPolicy::Once));
        assert_eq!(vm.spec.instance.cpu.sockets, 1);
        assert_eq!(vm.spec.instance.cpu.cores_per_socket, 1);
        assert_eq!(vm.spec.instance.memory.size.as_ref().unwrap().0, "1Gi");
        assert!(vm.spec.instance.interfaces[0].binding.bridge.is_some());
        assert!(vm.spec.instance.interfaces[0].mac.starts_with("52:54:00:"));
        assert!(is_valid_mac(&vm.spec.instance.interfaces[0].mac));
    }

    #[test]
    fn mutation_defaults_masquerade_cidrs() {
        let mut vm = base_vm();
        vm.spec.instance.interfaces[0].binding = InterfaceBindingMethod {
            masquerade: Some(InterfaceMasquerade::default()),
            ..Default::default()
        };
        mutate_vm(&mut vm, None).unwrap();
        let masquerade = vm.spec.instance.interfaces[0]
            .binding
            .masquerade
            .as_ref()
            .unwrap();
        assert_eq!(masquerade.ipv4_cidr, "10.0.2.0/30");
        assert_eq!(masquerade.ipv6_cidr, "fd10:0:2::/120");
    }

    #[test]
    fn mutation_reuses_mac_for_same_named_interface() {
        let old_vm = base_vm();
        let mut vm = base_vm();
        vm.spec.instance.interfaces[0].mac = String::new();
        mutate_vm(&mut vm, Some(&old_vm)).unwrap();
        assert_eq!(vm.spec.instance.interfaces[0].mac, "52:54:00:aa:bb:cc");

        // A renamed interface gets a fresh address.
        let mut vm = base_vm();
        vm.spec.instance.interfaces[0].name = "other".into();
        vm.spec.instance.interfaces[0].mac = String::new();
        mutate_vm(&mut vm, Some(&old_vm)).unwrap();
        assert_ne!(vm.spec.instance.interfaces[0].mac, "52:54:00:aa:bb:cc");
        assert!(vm.spec.instance.interfaces[0].mac.starts_with("52:54:00:"));
    }

    #[test]
    fn mutation_injects_dedicated_resources() {
        let mut vm = base_vm();
        vm.spec.instance.cpu.dedicated_cpu_placement = true;
        mutate_vm(&mut vm, None).unwrap();

        let resources = vm.spec.resources.as_ref().unwrap();
        let requests = resources.requests.as_ref().unwrap();
        let limits = resources.limits.as_ref().unwrap();
        assert_eq!(requests["cpu"].0, "2");
        assert_eq!(limits["cpu"].0, "2");
        // 1Gi + 256Mi overhead
        assert_eq!(requests["memory"].0, "1280Mi");
        assert_eq!(limits["memory"].0, "1280Mi");
    }

    #[test]
    fn mutation_injects_hugepages_resources() {
        let mut vm = base_vm();
        vm.spec.instance.memory.hugepages = Some(Hugepages {
            page_size: "2Mi".into(),
        });
        mutate_vm(&mut vm, None).unwrap();

        let resources = vm.spec.resources.as_ref().unwrap();
        let requests = resources.requests.as_ref().unwrap();
        assert_eq!(requests["hugepages-2Mi"].0, "1Gi");
        assert_eq!(requests["memory"].0, "256Mi");
    }

    #[test]
    fn missing_binding_is_rejected_with_field_path() {
        let mut vm = base_vm();
        vm.spec.instance.interfaces[0].binding = InterfaceBindingMethod::default();
        let errs = validate_vm(&vm, None);
        assert!(errs
            .iter()
            .any(|e| e.field == "spec.instance.interfaces[0]"
                && e.message.contains("binding method")));
    }

    #[test]
    fn two_volume_sources_are_rejected() {
        let mut vm = base_vm();
        vm.spec.volumes = vec![Volume {
            name: "root".into(),
            source: VolumeSource {
                container_disk: Some(ContainerDiskVolumeSource {
                    image: "img".into(),
                    ..Default::default()
                }),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: "pvc".into(),
                    hotpluggable: false,
                }),
                ..Default::default()
            },
        }];
        let errs = validate_vm(&vm, None);
        assert!(errs
            .iter()
            .any(|e| e.field == "spec.volumes[0]" && e.message.contains("more than 1")));
    }

    #[test]
    fn invalid_mac_and_cidr_are_rejected() {
        let mut vm = base_vm();
        vm.spec.instance.interfaces[0].mac = "not-a-mac".into();
        vm.spec.instance.interfaces[0].binding = InterfaceBindingMethod {
            masquerade: Some(InterfaceMasquerade {
                ipv4_cidr: "10.0.2.0/31".into(),
                ipv6_cidr: "fd10:0:2::/120".into(),
            }),
            ..Default::default()
        };
        let errs = validate_vm(&vm, None);
        assert!(errs.iter().any(|e| e.field.ends_with(".mac")));
        assert!(errs
            .iter()
            .any(|e| e.field.ends_with("ipv4CIDR") && e.message.contains("at least 4")));

        vm.spec.instance.interfaces[0].binding = InterfaceBindingMethod {
            masquerade: Some(InterfaceMasquerade {
                ipv4_cidr: "10.0.2.0/30".into(),
                ipv6_cidr: "fd10:0:2::/127".into(),
            }),
            ..Default::default()
        };
        let errs = validate_vm(&vm, None);
        assert!(errs
            .iter()
            .any(|e| e.field.ends_with("ipv6CIDR") && e.message.contains("at least 4")));
    }

    #[test]
    fn hugepages_size_must_be_multiple() {
        let mut vm = base_vm();
        vm.spec.instance.memory.size = Some(Quantity("1025Mi".into()));
        vm.spec.instance.memory.hugepages = Some(Hugepages {
            page_size: "1Gi".into(),
        });
        mutate_vm(&mut vm, None).unwrap();
        let errs = validate_vm(&vm, None);
        assert!(errs
            .iter()
            .any(|e| e.field == "spec.instance.memory.size" && e.message.contains("multiple")));
    }

    #[test]
    fn vhost_user_requires_dedicated_cpu_and_hugepages() {
        let mut vm = base_vm();
        vm.spec.instance.interfaces[0].binding = InterfaceBindingMethod {
            vhost_user: Some(Default::default()),
            ..Default::default()
        };
        let errs = validate_vm(&vm, None);
        assert!(errs
            .iter()
            .any(|e| e.message.contains("dedicated CPU placement")));
        assert!(errs.iter().any(|e| e.message.contains("hugepages")));
    }

    #[test]
    fn update_allows_run_policy_only_outside_volumes_and_disks() {
        let old_vm = {
            let mut vm = base_vm();
            mutate_vm(&mut vm, None).unwrap();
            vm
        };

        let mut vm = old_vm.clone();
        vm.spec.run_policy = Some(RunPolicy::Halted);
        assert!(validate_vm(&vm, Some(&old_vm)).is_empty());

        let mut vm = old_vm.clone();
        vm.spec.instance.cpu.sockets = 4;
        let errs = validate_vm(&vm, Some(&old_vm));
        assert!(errs.iter().any(|e| e.field == "spec"));
    }

    #[test]
    fn update_volume_rules() {
        let mut old_vm = base_vm();
        old_vm.spec.volumes = vec![
            Volume {
                name: "root".into(),
                source: VolumeSource {
                    container_disk: Some(ContainerDiskVolumeSource {
                        image: "img".into(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            },
            Volume {
                name: "data".into(),
                source: VolumeSource {
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: "pvc-data".into(),
                        hotpluggable: true,
                    }),
                    ..Default::default()
                },
            },
        ];
        mutate_vm(&mut old_vm, None).unwrap();

        // Removing the hotpluggable volume is fine.
        let mut vm = old_vm.clone();
        vm.spec.volumes.retain(|v| v.name != "data");
        assert!(validate_vm(&vm, Some(&old_vm)).is_empty());

        // Removing the container disk is not.
        let mut vm = old_vm.clone();
        vm.spec.volumes.retain(|v| v.name != "root");
        let errs = validate_vm(&vm, Some(&old_vm));
        assert!(errs.iter().any(|e| e.message.contains("may not be removed")));

        // Adding a non-hotpluggable volume is not.
        let mut vm = old_vm.clone();
        vm.spec.volumes.push(Volume {
            name: "extra".into(),
            source: VolumeSource {
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: "pvc-extra".into(),
                    hotpluggable: false,
                }),
                ..Default::default()
            },
        });
        let errs = validate_vm(&vm, Some(&old_vm));
        assert!(errs
            .iter()
            .any(|e| e.message.contains("only hotpluggable volumes may be added")));
    }
}
