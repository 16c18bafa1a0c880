use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use json_patch::Patch;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::Severity;
use crate::engine::CheckEngine;
use crate::mutation;
use crate::output::{ResourceResult, ResultSet};
use crate::resources::{GenericResource, ResourceProvider};

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("failed to bind webhook listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("webhook server failed: {0}")]
    Serve(std::io::Error),
}

pub struct AppState {
    pub engine: CheckEngine,
}

pub type SharedState = Arc<AppState>;

#[derive(Clone, Copy)]
enum WebhookType {
    Validate,
    Mutate,
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/validate", post(handle_validate))
        .route("/mutate", post(handle_mutate))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

pub async fn serve(engine: CheckEngine, port: u16) -> Result<(), AdmissionError> {
    let state = Arc::new(AppState { engine });
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| AdmissionError::Bind { addr, source })?;
    info!(%addr, "webhook server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(AdmissionError::Serve)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received CTRL+C, starting graceful shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, starting graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl_c");
        info!("received CTRL+C, starting graceful shutdown");
    }
}

async fn handle_validate(
    State(state): State<SharedState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    handle_webhook(&state, body, WebhookType::Validate)
}

async fn handle_mutate(
    State(state): State<SharedState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    handle_webhook(&state, body, WebhookType::Mutate)
}

fn handle_webhook(
    state: &AppState,
    body: serde_json::Value,
    webhook_type: WebhookType,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let review: AdmissionReview<DynamicObject> = serde_json::from_value(body).map_err(|e| {
        warn!("failed to deserialize AdmissionReview: {e}");
        (
            StatusCode::BAD_REQUEST,
            format!("failed to deserialize request: {e}"),
        )
    })?;
    let req: AdmissionRequest<DynamicObject> = review.try_into().map_err(|e| {
        warn!("AdmissionReview missing request field: {e}");
        (
            StatusCode::BAD_REQUEST,
            format!("missing request field in AdmissionReview: {e}"),
        )
    })?;

    let response = review_response(state, &req, webhook_type);
    Ok(review_to_json(response.into_review()))
}

fn review_response(
    state: &AppState,
    req: &AdmissionRequest<DynamicObject>,
    webhook_type: WebhookType,
) -> AdmissionResponse {
    let Some(object) = &req.object else {
        return AdmissionResponse::from(req);
    };
    let value = match serde_json::to_value(object) {
        Ok(value) => value,
        Err(e) => {
            error!(uid = %req.uid, "object did not serialize: {e}");
            return AdmissionResponse::invalid(format!("object did not serialize: {e}"));
        }
    };
    let resource = match GenericResource::from_value(value) {
        Ok(resource) => resource,
        Err(e) => {
            warn!(uid = %req.uid, "object is not auditable: {e}");
            return AdmissionResponse::invalid(format!("object is not auditable: {e}"));
        }
    };

    let provider = ResourceProvider::from_resource(resource.clone());
    let result = state.engine.apply_all_checks(&provider, &resource);

    let mut resp = AdmissionResponse::from(req);
    let blocking = failures(&result, Severity::Danger);
    let warnings = failures(&result, Severity::Warning);

    match webhook_type {
        WebhookType::Validate => {
            if !blocking.is_empty() {
                resp = resp.deny(blocking.join("; "));
            }
        }
        WebhookType::Mutate => {
            // Wildcard and ensure-path semantics only exist in our applier, so
            // apply locally and hand the API server the literal diff.
            let (mutations, _) = mutation::collect_mutations(&result);
            if !mutations.is_empty() {
                let mutated = match mutation::apply_mutations(&resource.resource, &mutations) {
                    Ok(mutated) => mutated,
                    Err(e) => {
                        error!(uid = %req.uid, "failed to apply mutations: {e}");
                        return AdmissionResponse::invalid(format!(
                            "failed to apply mutations: {e}"
                        ));
                    }
                };
                let patch: Patch = json_patch::diff(&resource.resource, &mutated);
                if !patch.0.is_empty() {
                    resp = match resp.with_patch(patch) {
                        Ok(patched) => patched,
                        Err(e) => {
                            error!(uid = %req.uid, "failed to attach patch: {e}");
                            return AdmissionResponse::invalid(format!(
                                "failed to attach patch: {e}"
                            ));
                        }
                    };
                }
            }
        }
    }

    if !warnings.is_empty() {
        resp.warnings.get_or_insert_with(Vec::new).extend(warnings);
    }
    resp
}

/// Failing messages at exactly the given severity, grouped by the scope
/// they were produced at.
fn failures(result: &ResourceResult, severity: Severity) -> Vec<String> {
    let mut out = Vec::new();
    let mut collect = |scope: &str, set: &ResultSet| {
        for message in set.values() {
            if !message.success && message.severity == severity {
                out.push(format!("{scope}: {} - {}", message.id, message.message));
            }
        }
    };
    collect("resource", &result.results);
    if let Some(pod) = &result.pod_result {
        collect("pod", &pod.results);
        for container in &pod.container_results {
            let scope = format!("container {}", container.name);
            collect(&scope, &container.results);
        }
    }
    out
}

fn review_to_json(review: AdmissionReview<DynamicObject>) -> Json<serde_json::Value> {
    let mut value =
        serde_json::to_value(review).expect("AdmissionReview serialization is infallible");
    // admission/v1 carries the patch as base64 text, but the response struct
    // holds raw bytes and serializes them as a number array.
    if let Some(patch) = value.pointer_mut("/response/patch") {
        if let Some(bytes) = patch.as_array() {
            let bytes: Vec<u8> = bytes
                .iter()
                .filter_map(|b| b.as_u64().map(|b| b as u8))
                .collect();
            *patch = serde_json::Value::String(STANDARD.encode(bytes));
        }
    }
    Json(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use serde_json::json;

    fn state(config_yaml: &str) -> AppState {
        let config = Configuration::parse(config_yaml.as_bytes()).unwrap();
        AppState {
            engine: CheckEngine::new(config).unwrap(),
        }
    }

    fn review_body(object: serde_json::Value) -> serde_json::Value {
        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "test-uid",
                "kind": {"group": "apps", "version": "v1", "kind": "Deployment"},
                "resource": {"group": "apps", "version": "v1", "resource": "deployments"},
                "operation": "CREATE",
                "userInfo": {},
                "object": object
            }
        })
    }

    fn deployment(host_ipc: bool) -> serde_json::Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "default"},
            "spec": {
                "template": {
                    "spec": {
                        "hostIPC": host_ipc,
                        "containers": [{"name": "app", "image": "nginx:1.27"}]
                    }
                }
            }
        })
    }

    #[test]
    fn test_validate_denies_danger_failure() {
        let state = state("checks:\n  hostIPCSet: danger\n");
        let body = review_body(deployment(true));
        let Json(out) = handle_webhook(&state, body, WebhookType::Validate).unwrap();
        assert_eq!(out["response"]["allowed"], json!(false));
        let status = out["response"]["status"]["message"].as_str().unwrap();
        assert!(status.contains("hostIPCSet"));
    }

    #[test]
    fn test_validate_allows_clean_resource() {
        let state = state("checks:\n  hostIPCSet: danger\n");
        let body = review_body(deployment(false));
        let Json(out) = handle_webhook(&state, body, WebhookType::Validate).unwrap();
        assert_eq!(out["response"]["allowed"], json!(true));
    }

    #[test]
    fn test_validate_warning_does_not_block() {
        let state = state("checks:\n  hostIPCSet: warning\n");
        let body = review_body(deployment(true));
        let Json(out) = handle_webhook(&state, body, WebhookType::Validate).unwrap();
        assert_eq!(out["response"]["allowed"], json!(true));
        let warnings = out["response"]["warnings"].as_array().unwrap();
        assert!(warnings[0].as_str().unwrap().contains("hostIPCSet"));
    }

    #[test]
    fn test_mutate_attaches_patch() {
        let state = state(
            "checks:\n  pullPolicyNotAlways: warning\nmutations:\n  - pullPolicyNotAlways\n",
        );
        let body = review_body(deployment(false));
        let Json(out) = handle_webhook(&state, body, WebhookType::Mutate).unwrap();
        assert_eq!(out["response"]["allowed"], json!(true));
        assert_eq!(out["response"]["patchType"], json!("JSONPatch"));
        let encoded = out["response"]["patch"].as_str().unwrap();
        let decoded = STANDARD.decode(encoded).unwrap();
        let patch: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        let ops = patch.as_array().unwrap();
        assert!(
            ops.iter()
                .any(|op| op["path"].as_str().unwrap().contains("imagePullPolicy"))
        );
    }

    #[test]
    fn test_bad_body_is_rejected() {
        let state = state("checks: {}\n");
        let result = handle_webhook(&state, json!({"not": "a review"}), WebhookType::Validate);
        assert!(matches!(result, Err((StatusCode::BAD_REQUEST, _))));
    }
}
