//! Cloud Hypervisor REST binding over the pod-local Unix socket.
//!
//! Mechanical mapping of the `/api/v1/` surface the daemon and pre-runner
//! consume. Responses with status >= 400 are errors, except that a body
//! naming `VmNotCreated` is surfaced as [`Error::VmNotCreated`] so callers
//! can treat it as state.

use std::path::{Path, PathBuf};

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use hyperlocal::{UnixConnector, Uri};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("VM is not created")]
    VmNotCreated,
    #[error("VMM responded {status}: {body}")]
    Api { status: u16, body: String },
    #[error("request VMM: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),
    #[error("read VMM response: {0}")]
    Body(#[from] hyper::Error),
    #[error("build VMM request: {0}")]
    Http(#[from] hyper::http::Error),
    #[error("VMM payload: {0}")]
    Codec(#[from] serde_json::Error),
}

impl Error {
    pub fn is_not_created(&self) -> bool {
        matches!(self, Error::VmNotCreated)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub struct Client {
    socket_path: PathBuf,
    client: HyperClient<UnixConnector, Full<Bytes>>,
}

impl Client {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            client: HyperClient::builder(TokioExecutor::new()).build(UnixConnector),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn call(&self, method: Method, endpoint: &str, body: Option<Vec<u8>>) -> Result<Bytes> {
        let uri = Uri::new(&self.socket_path, &format!("/api/v1/{}", endpoint));
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body.unwrap_or_default())))?;

        let resp = self.client.request(req).await?;
        let status = resp.status();
        let body = resp.into_body().collect().await?.to_bytes();
        if status.as_u16() >= 400 {
            let text = String::from_utf8_lossy(&body).into_owned();
            if text.contains("VmNotCreated") {
                return Err(Error::VmNotCreated);
            }
            return Err(Error::Api {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(body)
    }

    async fn put(&self, endpoint: &str, arg: Option<&impl Serialize>) -> Result<Bytes> {
        let body = match arg {
            Some(arg) => Some(serde_json::to_vec(arg)?),
            None => None,
        };
        self.call(Method::PUT, endpoint, body).await
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let body = self.call(Method::GET, endpoint, None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn vmm_ping(&self) -> Result<VmmPingResponse> {
        self.get("vmm.ping").await
    }

    pub async fn vm_info(&self) -> Result<VmInfo> {
        self.get("vm.info").await
    }

    pub async fn vm_create(&self, config: &VmConfig) -> Result<()> {
        self.put("vm.create", Some(config)).await.map(|_| ())
    }

    pub async fn vm_boot(&self) -> Result<()> {
        self.put("vm.boot", None::<&()>).await.map(|_| ())
    }

    pub async fn vm_shutdown(&self) -> Result<()> {
        self.put("vm.shutdown", None::<&()>).await.map(|_| ())
    }

    pub async fn vm_power_button(&self) -> Result<()> {
        self.put("vm.power-button", None::<&()>).await.map(|_| ())
    }

    pub async fn vm_reboot(&self) -> Result<()> {
        self.put("vm.reboot", None::<&()>).await.map(|_| ())
    }

    pub async fn vm_pause(&self) -> Result<()> {
        self.put("vm.pause", None::<&()>).await.map(|_| ())
    }

    pub async fn vm_resume(&self) -> Result<()> {
        self.put("vm.resume", None::<&()>).await.map(|_| ())
    }

    pub async fn vm_delete(&self) -> Result<()> {
        self.put("vm.delete", None::<&()>).await.map(|_| ())
    }

    pub async fn vm_add_disk(&self, disk: &DiskConfig) -> Result<PciDeviceInfo> {
        let body = self.put("vm.add-disk", Some(disk)).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn vm_remove_device(&self, id: &str) -> Result<()> {
        let arg = VmRemoveDevice { id: id.to_owned() };
        self.put("vm.remove-device", Some(&arg)).await.map(|_| ())
    }

    pub async fn vm_receive_migration(&self, arg: &ReceiveMigrationData) -> Result<()> {
        self.put("vm.receive-migration", Some(arg)).await.map(|_| ())
    }

    pub async fn vm_send_migration(&self, arg: &SendMigrationData) -> Result<()> {
        self.put("vm.send-migration", Some(arg)).await.map(|_| ())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct VmConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<CpusConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<PayloadConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disks: Option<Vec<DiskConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net: Option<Vec<NetConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs: Option<Vec<FsConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<DeviceConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vdpa: Option<Vec<VdpaConfig>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<ConsoleConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console: Option<ConsoleConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct CpusConfig {
    pub boot_vcpus: u32,
    pub max_vcpus: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<CpuTopology>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Vec<CpuAffinity>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct CpuTopology {
    pub threads_per_core: u32,
    pub cores_per_die: u32,
    pub dies_per_package: u32,
    pub packages: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct CpuAffinity {
    pub vcpu: u32,
    pub host_cpus: Vec<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct MemoryConfig {
    pub size: i64,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub hugepages: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hugepage_size: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct PayloadConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initramfs: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct DiskConfig {
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct NetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub vhost_user: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vhost_socket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_queues: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct FsConfig {
    pub tag: String,
    pub socket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_queues: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// VFIO passthrough device.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct DeviceConfig {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct VdpaConfig {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_queues: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ConsoleConfig {
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct VmInfo {
    #[serde(default)]
    pub config: VmConfig,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_actual_size: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct VmmPingResponse {
    pub version: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct PciDeviceInfo {
    pub id: String,
    pub bdf: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct VmRemoveDevice {
    pub id: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct SendMigrationData {
    pub destination_url: String,
    #[serde(default)]
    pub local: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ReceiveMigrationData {
    pub receiver_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_config_omits_unset_sections() {
        let config = VmConfig {
            cpus: Some(CpusConfig {
                boot_vcpus: 2,
                max_vcpus: 2,
                ..Default::default()
            }),
            memory: Some(MemoryConfig {
                size: 1 << 30,
                ..Default::default()
            }),
            ..Default::default()
        };
        let out = serde_json::to_value(&config).unwrap();
        assert_eq!(out["cpus"]["boot_vcpus"], 2);
        assert_eq!(out["memory"]["size"], 1i64 << 30);
        assert!(out.get("disks").is_none());
        assert!(out.get("net").is_none());
    }

    #[test]
    fn vm_info_tolerates_extra_fields() {
        let info: VmInfo = serde_json::from_str(
            r#"{"config": {}, "state": "Running", "device_tree": {}, "memory_actual_size": 1024}"#,
        )
        .unwrap();
        assert_eq!(info.state, "Running");
        assert_eq!(info.memory_actual_size, Some(1024));
    }
}
