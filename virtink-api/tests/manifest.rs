//! Wire-format tests against realistic manifests.

use virtink_api::vm::{VirtualMachine, VirtualMachinePhase, VolumePhase};
use virtink_api::{RunPolicy, VirtualMachineMigration, VirtualMachineMigrationPhase};

#[test]
fn full_vm_manifest_round_trips() {
    let manifest = serde_json::json!({
        "apiVersion": "virt.virtink.smartx.com/v1alpha1",
        "kind": "VirtualMachine",
        "metadata": {
            "name": "ubuntu",
            "namespace": "default",
            "uid": "2f1f2ab0-9ffe-4a31-8e3e-7b1f9d5f1a11"
        },
        "spec": {
            "runPolicy": "RerunOnFailure",
            "resources": {
                "requests": { "memory": "1Gi" }
            },
            "instance": {
                "cpu": { "sockets": 2, "coresPerSocket": 2 },
                "memory": { "size": "2Gi", "hugepages": { "pageSize": "2Mi" } },
                "kernel": {
                    "image": "smartxworks/virtink-kernel-5.15.12",
                    "cmdline": "console=ttyS0 root=/dev/vda rw"
                },
                "disks": [
                    { "name": "ubuntu" },
                    { "name": "cloud-init" },
                    { "name": "data", "readOnly": true }
                ],
                "fileSystems": [
                    { "name": "shared" }
                ],
                "interfaces": [
                    { "name": "pod", "mac": "52:54:00:4e:9c:12", "bridge": {} },
                    {
                        "name": "overlay",
                        "masquerade": { "ipv4CIDR": "10.0.2.0/30", "ipv6CIDR": "fd10:0:2::/120" }
                    },
                    { "name": "fast", "sriov": {} }
                ]
            },
            "volumes": [
                { "name": "ubuntu", "containerDisk": { "image": "smartxworks/virtink-container-disk-ubuntu" } },
                { "name": "cloud-init", "cloudInit": { "userData": "#cloud-config\npassword: password\n" } },
                { "name": "data", "persistentVolumeClaim": { "claimName": "pvc-data", "hotpluggable": true } },
                { "name": "shared", "dataVolume": { "volumeName": "dv-shared" } }
            ],
            "networks": [
                { "name": "pod", "pod": {} },
                { "name": "overlay", "multus": { "networkName": "default/overlay" } },
                { "name": "fast", "multus": { "networkName": "default/sriov" } }
            ]
        },
        "status": {
            "phase": "Running",
            "vmPodName": "vm-ubuntu-x7k2p",
            "vmPodUID": "88a9e2a1-18a5-4a11-95d7-38b4b26a9a1f",
            "nodeName": "node-1",
            "volumeStatus": [
                { "name": "data", "phase": "Ready" }
            ],
            "migration": {
                "uid": "b1b6e37a-14af-4e08-8b9f-3c710ac9f21d",
                "phase": "TargetReady",
                "targetNodeName": "node-2",
                "targetVMPodName": "vm-ubuntu-target-q8w3r",
                "targetVMPodUID": "11e2c7aa-40dd-47a6-9f9b-2a2d0f5c4b10",
                "targetNodeIP": "10.0.0.2",
                "targetNodePort": 49152
            }
        }
    });

    let vm: VirtualMachine = serde_json::from_value(manifest.clone()).unwrap();
    assert_eq!(vm.spec.run_policy, Some(RunPolicy::RerunOnFailure));
    assert_eq!(vm.spec.instance.vcpu_count(), 4);
    assert_eq!(
        vm.spec.instance.memory.hugepages.as_ref().unwrap().page_size,
        "2Mi"
    );
    assert_eq!(vm.spec.instance.interfaces[0].mac, "52:54:00:4e:9c:12");
    assert!(vm.spec.instance.interfaces[1].binding.masquerade.is_some());
    assert!(vm.spec.instance.interfaces[2].binding.sriov.is_some());
    assert!(vm.spec.volumes[2].is_hotpluggable());
    assert_eq!(vm.spec.volumes[3].pvc_name(), Some("dv-shared"));
    assert!(vm.spec.networks[1].source.multus.is_some());

    let status = vm.status.as_ref().unwrap();
    assert_eq!(status.phase, Some(VirtualMachinePhase::Running));
    assert_eq!(vm.volume_phase("data"), Some(VolumePhase::Ready));
    let migration = status.migration.as_ref().unwrap();
    assert_eq!(migration.phase, Some(VirtualMachineMigrationPhase::TargetReady));
    assert_eq!(migration.target_node_port, Some(49152));

    // Serializing back must keep the inline variant keys and camelCase names.
    let out = serde_json::to_value(&vm).unwrap();
    assert_eq!(out["spec"]["volumes"][0]["containerDisk"]["image"], manifest["spec"]["volumes"][0]["containerDisk"]["image"]);
    assert_eq!(out["spec"]["instance"]["interfaces"][1]["masquerade"]["ipv4CIDR"], "10.0.2.0/30");
    assert_eq!(out["status"]["migration"]["targetVMPodName"], "vm-ubuntu-target-q8w3r");
    assert_eq!(out["status"]["vmPodUID"], "88a9e2a1-18a5-4a11-95d7-38b4b26a9a1f");
}

#[test]
fn migration_manifest_round_trips() {
    let manifest = serde_json::json!({
        "apiVersion": "virt.virtink.smartx.com/v1alpha1",
        "kind": "VirtualMachineMigration",
        "metadata": { "name": "ubuntu-migration", "namespace": "default" },
        "spec": { "vmName": "ubuntu" },
        "status": {
            "phase": "Sent",
            "sourceNodeName": "node-1",
            "targetNodeName": "node-2"
        }
    });

    let vmm: VirtualMachineMigration = serde_json::from_value(manifest).unwrap();
    assert_eq!(vmm.spec.vm_name, "ubuntu");
    let status = vmm.status.as_ref().unwrap();
    assert_eq!(status.phase, Some(VirtualMachineMigrationPhase::Sent));
    assert_eq!(status.source_node_name, "node-1");

    let out = serde_json::to_value(&vmm).unwrap();
    assert_eq!(out["spec"]["vmName"], "ubuntu");
    assert_eq!(out["status"]["phase"], "Sent");
}
