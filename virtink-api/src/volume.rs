//! Volume helpers shared by the cluster reconciler and the node daemon.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::Api;
use kube::Client;

use crate::vm::Volume;

/// Annotation the CDI importer stamps on a DataVolume's PVC once the
/// populating pod has finished.
const CDI_POD_PHASE_ANNOTATION: &str = "cdi.kubevirt.io/storage.pod.phase";

/// Whether the PVC backing this volume is in block mode.
pub async fn is_block(client: &Client, namespace: &str, volume: &Volume) -> Result<bool> {
    let pvc = get_pvc(client, namespace, volume)
        .await?
        .context("PVC not found")?;
    Ok(pvc
        .spec
        .as_ref()
        .and_then(|s| s.volume_mode.as_deref())
        .map(|m| m == "Block")
        .unwrap_or(false))
}

/// Whether the volume's backing storage is ready to attach. PVC-backed
/// volumes are ready once the claim exists; DataVolume-backed volumes wait
/// for the CDI import to complete.
pub async fn is_ready(client: &Client, namespace: &str, volume: &Volume) -> Result<bool> {
    if volume.source.data_volume.is_none() {
        return Ok(true);
    }
    let Some(pvc) = get_pvc(client, namespace, volume).await? else {
        return Ok(false);
    };
    Ok(pvc
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(CDI_POD_PHASE_ANNOTATION))
        .map(|phase| phase == "Succeeded")
        .unwrap_or(false))
}

async fn get_pvc(
    client: &Client,
    namespace: &str,
    volume: &Volume,
) -> Result<Option<PersistentVolumeClaim>> {
    let name = volume.pvc_name().context("volume is not on a PVC")?;
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    match pvcs.get_opt(name).await {
        Ok(pvc) => Ok(pvc),
        Err(e) => Err(e).context("get PVC"),
    }
}
