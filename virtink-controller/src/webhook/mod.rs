//! Admission webhook server.
//!
//! HTTPS endpoints consumed by the apiserver:
//! `/mutate-v1alpha1-virtualmachine`, `/validate-v1alpha1-virtualmachine`
//! and `/validate-v1alpha1-virtualmachinemigration`.

pub mod migration;
pub mod vm;

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use kube::Client;
use tracing::{info, warn};

use virtink_api::migration::VirtualMachineMigration;
use virtink_api::vm::VirtualMachine;

/// A single admission failure, anchored to a spec field path.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &str, message: &str) -> Self {
        Self {
            field: field.to_owned(),
            message: message.to_owned(),
        }
    }

    pub fn required(field: &str) -> Self {
        Self::new(field, "a value is required")
    }

    pub fn invalid(field: &str, message: &str) -> Self {
        Self::new(field, message)
    }

    pub fn duplicate(field: &str, value: &str) -> Self {
        Self::new(field, &format!("duplicate value {:?}", value))
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn deny_message(errs: &[FieldError]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Clone)]
pub struct WebhookState {
    pub client: Client,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/mutate-v1alpha1-virtualmachine", post(mutate_vm_handler))
        .route("/validate-v1alpha1-virtualmachine", post(validate_vm_handler))
        .route(
            "/validate-v1alpha1-virtualmachinemigration",
            post(validate_migration_handler),
        )
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Serve the webhook endpoints over TLS. `cert_dir` must hold `tls.crt` and
/// `tls.key`, rotated externally.
pub async fn serve(addr: SocketAddr, cert_dir: &Path, state: WebhookState) -> anyhow::Result<()> {
    let config =
        RustlsConfig::from_pem_file(cert_dir.join("tls.crt"), cert_dir.join("tls.key")).await?;
    info!(addr = %addr, "serving admission webhooks");
    axum_server::bind_rustls(addr, config)
        .serve(router(state).into_make_service())
        .await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn mutate_vm_handler(
    Json(review): Json<AdmissionReview<VirtualMachine>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<VirtualMachine> = match review.try_into() {
        Ok(req) => req,
        Err(e) => return Json(AdmissionResponse::invalid(e.to_string()).into_review()),
    };

    let mut resp = AdmissionResponse::from(&req);
    if matches!(req.operation, Operation::Create | Operation::Update) {
        if let Some(vm) = &req.object {
            let mut mutated = vm.clone();
            match vm::mutate_vm(&mut mutated, req.old_object.as_ref()) {
                Ok(()) => {
                    let patch = match (serde_json::to_value(vm), serde_json::to_value(&mutated)) {
                        (Ok(original), Ok(mutated)) => json_patch::diff(&original, &mutated),
                        _ => return Json(AdmissionResponse::invalid("serialize VM").into_review()),
                    };
                    resp = match resp.with_patch(patch) {
                        Ok(resp) => resp,
                        Err(e) => AdmissionResponse::invalid(e.to_string()),
                    };
                }
                Err(e) => {
                    warn!(error = %e, "VM mutation failed");
                    resp = resp.deny(format!("mutate VM: {}", e));
                }
            }
        }
    }
    Json(resp.into_review())
}

async fn validate_vm_handler(
    Json(review): Json<AdmissionReview<VirtualMachine>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<VirtualMachine> = match review.try_into() {
        Ok(req) => req,
        Err(e) => return Json(AdmissionResponse::invalid(e.to_string()).into_review()),
    };

    let mut resp = AdmissionResponse::from(&req);
    if matches!(req.operation, Operation::Create | Operation::Update) {
        if let Some(vm) = &req.object {
            let errs = vm::validate_vm(vm, req.old_object.as_ref());
            if !errs.is_empty() {
                resp = resp.deny(deny_message(&errs));
            }
        }
    }
    Json(resp.into_review())
}

async fn validate_migration_handler(
    State(state): State<WebhookState>,
    Json(review): Json<AdmissionReview<VirtualMachineMigration>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<VirtualMachineMigration> = match review.try_into() {
        Ok(req) => req,
        Err(e) => return Json(AdmissionResponse::invalid(e.to_string()).into_review()),
    };

    let mut resp = AdmissionResponse::from(&req);
    if matches!(req.operation, Operation::Create | Operation::Update) {
        if let Some(vmm) = &req.object {
            let namespace = req.namespace.clone().unwrap_or_default();
            match migration::validate_migration(
                &state.client,
                &namespace,
                vmm,
                req.old_object.as_ref(),
            )
            .await
            {
                Ok(errs) if errs.is_empty() => {}
                Ok(errs) => resp = resp.deny(deny_message(&errs)),
                Err(e) => resp = AdmissionResponse::invalid(e.to_string()),
            }
        }
    }
    Json(resp.into_review())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_message_joins_field_errors() {
        let errs = vec![
            FieldError::required("spec.instance.memory.size"),
            FieldError::invalid("spec.instance.interfaces[0].mac", "invalid MAC address"),
        ];
        let message = deny_message(&errs);
        assert!(message.contains("spec.instance.memory.size: a value is required"));
        assert!(message.contains("; spec.instance.interfaces[0].mac"));
    }
}
