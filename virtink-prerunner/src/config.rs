//! VMM config planning.
//!
//! Pure mapping from the VM spec (delivered through `VM_DATA`) and the pod
//! environment to the Cloud Hypervisor config sections. Network plans are
//! resolved into concrete `net` entries by the netconf module, which owns
//! the side effects.

use std::collections::BTreeSet;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use virtink_api::cloudhypervisor::{
    ConsoleConfig, CpuAffinity, CpuTopology, CpusConfig, DeviceConfig, DiskConfig, FsConfig,
    MemoryConfig, PayloadConfig,
};
use virtink_api::quantity::parse_quantity;
use virtink_api::vm::VirtualMachine;

pub const VIRTIOFSD_SOCKET_DIR: &str = "/var/run/virtink";

/// A Multus `k8s.v1.cni.cncf.io/network-status` entry; SR-IOV interfaces
/// carry their PCI address here.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct NetworkStatusEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub interface: String,
    #[serde(default, rename = "device-info")]
    pub device_info: Option<DeviceInfo>,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct DeviceInfo {
    #[serde(default)]
    pub pci: Option<PciInfo>,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct PciInfo {
    #[serde(default, rename = "pci-address")]
    pub pci_address: String,
}

/// Pod-side inputs that shape the config.
#[derive(Clone, Debug, Default)]
pub struct BuildEnv {
    /// Names of block-mode PVC volumes (`BLOCK_VOLUMES`).
    pub block_volumes: BTreeSet<String>,
    /// vhost-user socket path (`VHOST_USER_SOCKET`).
    pub vhost_user_socket: Option<String>,
    /// Parsed `NETWORK_STATUS` annotation.
    pub network_status: Vec<NetworkStatusEntry>,
    /// Pod cpuset, for dedicated CPU placement.
    pub cpuset: Option<Vec<u32>>,
    /// Target architecture, `std::env::consts::ARCH`.
    pub arch: &'static str,
}

/// How each interface's backend is realised in the pod.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkPlan {
    Bridge {
        iface: String,
        link_name: String,
        network_index: usize,
    },
    Masquerade {
        iface: String,
        link_name: String,
        network_index: usize,
        ipv4_cidr: String,
        ipv6_cidr: String,
        mac: String,
    },
    Sriov {
        iface: String,
        pci_address: String,
    },
    VhostUser {
        iface: String,
        socket: String,
        mac: String,
    },
}

pub fn plan_cpu(vm: &VirtualMachine, env: &BuildEnv) -> CpusConfig {
    let cpu = &vm.spec.instance.cpu;
    let vcpus = vm.spec.instance.vcpu_count().max(1);
    let affinity = if cpu.dedicated_cpu_placement {
        env.cpuset.as_ref().map(|host_cpus| {
            (0..vcpus)
                .map(|vcpu| CpuAffinity {
                    vcpu,
                    host_cpus: vec![host_cpus[vcpu as usize % host_cpus.len()]],
                })
                .collect()
        })
    } else {
        None
    };
    CpusConfig {
        boot_vcpus: vcpus,
        max_vcpus: vcpus,
        topology: Some(CpuTopology {
            threads_per_core: 1,
            cores_per_die: cpu.cores_per_socket.max(1),
            dies_per_package: 1,
            packages: cpu.sockets.max(1),
        }),
        affinity,
    }
}

pub fn plan_memory(vm: &VirtualMachine) -> Result<MemoryConfig> {
    let memory = &vm.spec.instance.memory;
    let size = memory
        .size
        .as_ref()
        .context("memory size is not set")
        .and_then(|q| parse_quantity(q).map_err(Into::into))?;

    let has_vhost_user = vm
        .spec
        .instance
        .interfaces
        .iter()
        .any(|i| i.binding.vhost_user.is_some());
    let hugepage_size = match memory.hugepages.as_ref().map(|h| h.page_size.as_str()) {
        None => None,
        Some("2Mi") => Some(2i64 << 20),
        Some("1Gi") => Some(1i64 << 30),
        Some(other) => bail!("unsupported hugepage size {:?}", other),
    };
    Ok(MemoryConfig {
        size,
        // vhost-user backends map guest memory from the VMM.
        shared: has_vhost_user,
        hugepages: hugepage_size.is_some(),
        hugepage_size,
    })
}

pub fn plan_payload(vm: &VirtualMachine, env: &BuildEnv) -> Result<PayloadConfig> {
    if let Some(kernel) = &vm.spec.instance.kernel {
        return Ok(PayloadConfig {
            kernel: Some("/mnt/virtink-kernel/vmlinux".into()),
            cmdline: Some(kernel.cmdline.clone()),
            ..Default::default()
        });
    }
    match env.arch {
        "x86_64" => Ok(PayloadConfig {
            kernel: Some("/var/lib/cloud-hypervisor/hypervisor-fw".into()),
            ..Default::default()
        }),
        "aarch64" => Ok(PayloadConfig {
            firmware: Some("/var/lib/cloud-hypervisor/CLOUDHV_EFI.fd".into()),
            ..Default::default()
        }),
        other => bail!("unsupported architecture {:?}", other),
    }
}

/// Disks in `instance.disks` order. Hotplug volumes are added live by the
/// daemon and are not part of the boot config.
pub fn plan_disks(vm: &VirtualMachine, env: &BuildEnv) -> Result<Vec<DiskConfig>> {
    let mut disks = Vec::new();
    for disk in &vm.spec.instance.disks {
        let volume = vm
            .spec
            .volumes
            .iter()
            .find(|v| v.name == disk.name)
            .with_context(|| format!("disk {:?} has no matching volume", disk.name))?;
        if volume.is_hotpluggable() {
            continue;
        }

        let path = if volume.source.container_disk.is_some() {
            format!("/mnt/{}/disk.raw", volume.name)
        } else if volume.source.cloud_init.is_some() {
            format!("/mnt/{}/cloud-init.iso", volume.name)
        } else if volume.source.container_rootfs.is_some() {
            format!("/mnt/{}/rootfs.raw", volume.name)
        } else if volume.pvc_name().is_some() {
            if env.block_volumes.contains(&volume.name) {
                format!("/mnt/{}", volume.name)
            } else {
                format!("/mnt/{}/disk.img", volume.name)
            }
        } else {
            bail!("volume {:?} has no usable source", volume.name);
        };

        disks.push(DiskConfig {
            path,
            readonly: disk.read_only.unwrap_or(false),
            id: Some(disk.name.clone()),
        });
    }
    Ok(disks)
}

/// One virtiofs share per filesystem, backed by a virtiofsd the pre-runner
/// spawns before the VMM.
pub fn plan_filesystems(vm: &VirtualMachine) -> Vec<FsConfig> {
    vm.spec
        .instance
        .file_systems
        .iter()
        .map(|fs| FsConfig {
            tag: fs.name.clone(),
            socket: virtiofsd_socket(&fs.name),
            num_queues: Some(1),
            queue_size: Some(1024),
            id: Some(fs.name.clone()),
        })
        .collect()
}

pub fn virtiofsd_socket(name: &str) -> String {
    format!("{}/virtiofsd-{}.sock", VIRTIOFSD_SOCKET_DIR, name)
}

/// Decide how each interface is wired up.
pub fn plan_networks(vm: &VirtualMachine, env: &BuildEnv) -> Result<Vec<NetworkPlan>> {
    let mut plans = Vec::new();
    for iface in &vm.spec.instance.interfaces {
        let (network_index, network) = vm
            .spec
            .networks
            .iter()
            .enumerate()
            .find(|(_, n)| n.name == iface.name)
            .with_context(|| format!("interface {:?} has no matching network", iface.name))?;

        let link_name = if network.source.pod.is_some() {
            "eth0".to_owned()
        } else if network.source.multus.is_some() {
            format!("net{}", network_index)
        } else {
            bail!("network {:?} has no usable source", network.name);
        };

        if iface.binding.bridge.is_some() {
            plans.push(NetworkPlan::Bridge {
                iface: iface.name.clone(),
                link_name,
                network_index,
            });
        } else if let Some(masquerade) = &iface.binding.masquerade {
            plans.push(NetworkPlan::Masquerade {
                iface: iface.name.clone(),
                link_name,
                network_index,
                ipv4_cidr: masquerade.ipv4_cidr.clone(),
                ipv6_cidr: masquerade.ipv6_cidr.clone(),
                mac: iface.mac.clone(),
            });
        } else if iface.binding.sriov.is_some() {
            let entry = env
                .network_status
                .iter()
                .find(|e| e.interface == link_name)
                .and_then(|e| e.device_info.as_ref())
                .and_then(|d| d.pci.as_ref())
                .with_context(|| {
                    format!("no PCI address in network status for interface {:?}", iface.name)
                })?;
            plans.push(NetworkPlan::Sriov {
                iface: iface.name.clone(),
                pci_address: entry.pci_address.clone(),
            });
        } else if iface.binding.vhost_user.is_some() {
            let socket = env
                .vhost_user_socket
                .clone()
                .context("VHOST_USER_SOCKET is not set")?;
            plans.push(NetworkPlan::VhostUser {
                iface: iface.name.clone(),
                socket,
                mac: iface.mac.clone(),
            });
        } else {
            bail!("interface {:?} has no binding method", iface.name);
        }
    }
    Ok(plans)
}

/// VFIO device entries for SR-IOV interfaces.
pub fn plan_devices(plans: &[NetworkPlan]) -> Vec<DeviceConfig> {
    plans
        .iter()
        .filter_map(|plan| match plan {
            NetworkPlan::Sriov { iface, pci_address } => Some(DeviceConfig {
                path: format!("/sys/bus/pci/devices/{}", pci_address),
                id: Some(iface.clone()),
            }),
            _ => None,
        })
        .collect()
}

pub fn serial_console() -> (ConsoleConfig, ConsoleConfig) {
    (
        ConsoleConfig {
            mode: "Tty".into(),
            ..Default::default()
        },
        ConsoleConfig {
            mode: "Pty".into(),
            ..Default::default()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use virtink_api::vm::{
        ContainerDiskVolumeSource, Cpu, Disk, FileSystem, Hugepages, Instance, Interface,
        InterfaceBindingMethod, InterfaceBridge, InterfaceMasquerade, Memory,
        MultusNetworkSource, Network, NetworkSource, PersistentVolumeClaimVolumeSource,
        PodNetworkSource, VirtualMachineSpec, Volume, VolumeSource,
    };

    fn test_vm() -> VirtualMachine {
        VirtualMachine::new(
            "ubuntu",
            VirtualMachineSpec {
                instance: Instance {
                    cpu: Cpu {
                        sockets: 2,
                        cores_per_socket: 2,
                        dedicated_cpu_placement: false,
                    },
                    memory: Memory {
                        size: Some(Quantity("1Gi".into())),
                        ..Default::default()
                    },
                    disks: vec![
                        Disk {
                            name: "root".into(),
                            read_only: None,
                        },
                        Disk {
                            name: "data".into(),
                            read_only: Some(true),
                        },
                    ],
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
                volumes: vec![
                    Volume {
                        name: "root".into(),
                        source: VolumeSource {
                            container_disk: Some(ContainerDiskVolumeSource {
                                image: "img:v1".into(),
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
                                hotpluggable: false,
                            }),
                            ..Default::default()
                        },
                    },
                ],
                networks: vec![Network {
                    name: "pod".into(),
                    source: NetworkSource {
                        pod: Some(PodNetworkSource {}),
                        ..Default::default()
                    },
                }],
                ..Default::default()
            },
        )
    }

    #[test]
    fn cpu_topology_follows_sockets_and_cores() {
        let vm = test_vm();
        let cpus = plan_cpu(&vm, &BuildEnv::default());
        assert_eq!(cpus.boot_vcpus, 4);
        assert_eq!(cpus.max_vcpus, 4);
        let topology = cpus.topology.unwrap();
        assert_eq!(topology.packages, 2);
        assert_eq!(topology.cores_per_die, 2);
        assert!(cpus.affinity.is_none());
    }

    #[test]
    fn dedicated_placement_pins_vcpus() {
        let mut vm = test_vm();
        vm.spec.instance.cpu.dedicated_cpu_placement = true;
        let env = BuildEnv {
            cpuset: Some(vec![10, 11, 12, 13]),
            ..Default::default()
        };
        let cpus = plan_cpu(&vm, &env);
        let affinity = cpus.affinity.unwrap();
        assert_eq!(affinity.len(), 4);
        assert_eq!(affinity[0].host_cpus, vec![10]);
        assert_eq!(affinity[3].host_cpus, vec![13]);
    }

    #[test]
    fn memory_carries_hugepages_and_sharing() {
        let mut vm = test_vm();
        let memory = plan_memory(&vm).unwrap();
        assert_eq!(memory.size, 1 << 30);
        assert!(!memory.hugepages);
        assert!(!memory.shared);

        vm.spec.instance.memory.hugepages = Some(Hugepages {
            page_size: "2Mi".into(),
        });
        let memory = plan_memory(&vm).unwrap();
        assert!(memory.hugepages);
        assert_eq!(memory.hugepage_size, Some(2 << 20));
    }

    #[test]
    fn disks_follow_volume_variants() {
        let vm = test_vm();
        let disks = plan_disks(&vm, &BuildEnv::default()).unwrap();
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].path, "/mnt/root/disk.raw");
        assert!(!disks[0].readonly);
        assert_eq!(disks[1].path, "/mnt/data/disk.img");
        assert!(disks[1].readonly);

        let env = BuildEnv {
            block_volumes: ["data".to_owned()].into_iter().collect(),
            ..Default::default()
        };
        let disks = plan_disks(&vm, &env).unwrap();
        assert_eq!(disks[1].path, "/mnt/data");
    }

    #[test]
    fn hotplug_volumes_are_not_boot_disks() {
        let mut vm = test_vm();
        vm.spec.volumes[1]
            .source
            .persistent_volume_claim
            .as_mut()
            .unwrap()
            .hotpluggable = true;
        let disks = plan_disks(&vm, &BuildEnv::default()).unwrap();
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].id.as_deref(), Some("root"));
    }

    #[test]
    fn filesystems_become_virtiofs_shares() {
        let mut vm = test_vm();
        vm.spec.instance.file_systems = vec![FileSystem {
            name: "shared".into(),
        }];
        let fs = plan_filesystems(&vm);
        assert_eq!(fs[0].tag, "shared");
        assert_eq!(fs[0].socket, "/var/run/virtink/virtiofsd-shared.sock");
    }

    #[test]
    fn pod_network_bridges_eth0() {
        let vm = test_vm();
        let plans = plan_networks(&vm, &BuildEnv::default()).unwrap();
        assert_eq!(
            plans[0],
            NetworkPlan::Bridge {
                iface: "pod".into(),
                link_name: "eth0".into(),
                network_index: 0,
            }
        );
    }

    #[test]
    fn multus_masquerade_uses_indexed_link() {
        let mut vm = test_vm();
        vm.spec.networks.push(Network {
            name: "ovs".into(),
            source: NetworkSource {
                multus: Some(MultusNetworkSource {
                    network_name: "default/ovs-net".into(),
                }),
                ..Default::default()
            },
        });
        vm.spec.instance.interfaces.push(Interface {
            name: "ovs".into(),
            mac: "52:54:00:00:00:01".into(),
            binding: InterfaceBindingMethod {
                masquerade: Some(InterfaceMasquerade {
                    ipv4_cidr: "10.0.2.0/30".into(),
                    ipv6_cidr: "fd10:0:2::/120".into(),
                }),
                ..Default::default()
            },
        });
        let plans = plan_networks(&vm, &BuildEnv::default()).unwrap();
        match &plans[1] {
            NetworkPlan::Masquerade {
                link_name,
                network_index,
                ipv4_cidr,
                ..
            } => {
                assert_eq!(link_name, "net1");
                assert_eq!(*network_index, 1);
                assert_eq!(ipv4_cidr, "10.0.2.0/30");
            }
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn sriov_takes_pci_address_from_network_status() {
        let mut vm = test_vm();
        vm.spec.instance.interfaces[0].binding = InterfaceBindingMethod {
            sriov: Some(Default::default()),
            ..Default::default()
        };
        let env = BuildEnv {
            network_status: vec![NetworkStatusEntry {
                name: "default/sriov-net".into(),
                interface: "eth0".into(),
                device_info: Some(DeviceInfo {
                    pci: Some(PciInfo {
                        pci_address: "0000:65:00.2".into(),
                    }),
                }),
            }],
            ..Default::default()
        };
        let plans = plan_networks(&vm, &env).unwrap();
        let devices = plan_devices(&plans);
        assert_eq!(devices[0].path, "/sys/bus/pci/devices/0000:65:00.2");
    }
}
