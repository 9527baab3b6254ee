//! virt-controller: cluster control plane for Virtink VMs.
//!
//! Runs the VM reconciler, the migration reconciler and the admission
//! webhook server against the cluster's apiserver.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::Api;
use kube::runtime::controller::Controller;
use kube::runtime::events::Reporter;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{reflector, watcher};
use kube::{Client, ResourceExt};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod migration;
mod vm;
mod webhook;

use virtink_api::migration::VirtualMachineMigration;
use virtink_api::vm::VirtualMachine;

/// Virtink cluster controller
#[derive(Parser, Debug)]
#[command(name = "virt-controller", version, about)]
struct Args {
    /// Image used for VMM pod containers (pre-runner)
    #[arg(long, env = "PRERUNNER_IMAGE")]
    prerunner_image: String,

    /// Listen address for the admission webhook server
    #[arg(long, default_value = "0.0.0.0:9443")]
    webhook_addr: SocketAddr,

    /// Directory holding the webhook serving certificate (tls.crt, tls.key)
    #[arg(long, default_value = "/tmp/k8s-webhook-server/serving-certs")]
    webhook_cert_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "virt_controller=info,kube=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let client = Client::try_default()
        .await
        .context("create Kubernetes client")?;

    info!(prerunner_image = %args.prerunner_image, "starting virt-controller");

    let reporter = Reporter {
        controller: "virt-controller".into(),
        instance: None,
    };

    // Reflector store of VMs, used to map PVC events back to the VMs that
    // reference them.
    let (vm_reader, vm_writer) = reflector::store::<VirtualMachine>();
    {
        let vms: Api<VirtualMachine> = Api::all(client.clone());
        let stream = reflector(vm_writer, watcher(vms, watcher::Config::default()));
        tokio::spawn(async move {
            futures::pin_mut!(stream);
            while let Some(event) = stream.next().await {
                if let Err(e) = event {
                    warn!(error = %e, "VM reflector error");
                }
            }
        });
    }

    // Reflector store of migrations, used to map a VM's migration slot UID
    // back to the owning VirtualMachineMigration.
    let (vmm_reader, vmm_writer) = reflector::store::<VirtualMachineMigration>();
    {
        let vmms: Api<VirtualMachineMigration> = Api::all(client.clone());
        let stream = reflector(vmm_writer, watcher(vmms, watcher::Config::default()));
        tokio::spawn(async move {
            futures::pin_mut!(stream);
            while let Some(event) = stream.next().await {
                if let Err(e) = event {
                    warn!(error = %e, "migration reflector error");
                }
            }
        });
    }

    let vm_ctx = Arc::new(vm::Context {
        client: client.clone(),
        reporter: reporter.clone(),
        prerunner_image: args.prerunner_image.clone(),
        vm_store: vm_reader.clone(),
    });

    let vm_controller = {
        let vms: Api<VirtualMachine> = Api::all(client.clone());
        let pods: Api<Pod> = Api::all(client.clone());
        let pvcs: Api<PersistentVolumeClaim> = Api::all(client.clone());
        let vm_reader = vm_reader.clone();

        Controller::new(vms, watcher::Config::default())
            .owns(
                pods,
                watcher::Config::default().labels(vm::VM_NAME_LABEL),
            )
            .watches(pvcs, watcher::Config::default(), move |pvc| {
                let claim_name = pvc.name_any();
                let namespace = pvc.namespace();
                vm_reader
                    .state()
                    .into_iter()
                    .filter(|vm| {
                        vm.namespace() == namespace
                            && vm
                                .spec
                                .volumes
                                .iter()
                                .any(|v| v.pvc_name() == Some(claim_name.as_str()))
                    })
                    .map(|vm| ObjectRef::from_obj(&*vm))
                    .collect::<Vec<_>>()
            })
            .run(vm::reconcile, vm::error_policy, vm_ctx)
            .for_each(|result| async move {
                match result {
                    Ok((vm, _)) => tracing::debug!(vm = %vm.name, "reconciled VM"),
                    Err(e) => warn!(error = %e, "VM controller error"),
                }
            })
    };

    let migration_ctx = Arc::new(migration::Context {
        client: client.clone(),
        reporter: reporter.clone(),
    });

    let migration_controller = {
        let vmms: Api<VirtualMachineMigration> = Api::all(client.clone());
        let vms: Api<VirtualMachine> = Api::all(client.clone());

        Controller::new(vmms, watcher::Config::default())
            .watches(vms, watcher::Config::default(), move |vm| {
                let slot_uid = vm
                    .status
                    .as_ref()
                    .and_then(|s| s.migration.as_ref())
                    .map(|m| m.uid.clone());
                match slot_uid {
                    None => Vec::new(),
                    Some(uid) => vmm_reader
                        .state()
                        .into_iter()
                        .filter(|vmm| vmm.uid().as_deref() == Some(uid.as_str()))
                        .map(|vmm| ObjectRef::from_obj(&*vmm))
                        .collect(),
                }
            })
            .run(migration::reconcile, migration::error_policy, migration_ctx)
            .for_each(|result| async move {
                match result {
                    Ok((vmm, _)) => tracing::debug!(migration = %vmm.name, "reconciled migration"),
                    Err(e) => warn!(error = %e, "migration controller error"),
                }
            })
    };

    let webhook_server = webhook::serve(
        args.webhook_addr,
        &args.webhook_cert_dir,
        webhook::WebhookState { client },
    );

    tokio::select! {
        _ = vm_controller => warn!("VM controller stream ended"),
        _ = migration_controller => warn!("migration controller stream ended"),
        result = webhook_server => result?,
    }
    Ok(())
}
