//! Pod mutation handler
//!
//! Handles AdmissionReview requests for Pods: checks the opt-in annotation and
//! namespace policy, loads the referenced agent configuration, plans the
//! injection and answers with a JSON Patch.
//!
//! Every failure after the review has been decoded is fail-open: the pod is
//! allowed unchanged and the reason is carried in `status.message`.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap},
    Json,
};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::DynamicObject,
    core::{
        admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
        Status,
    },
};
use tracing::{debug, info, warn};

use super::{WebhookError, WebhookState, PROTECTED_NAMESPACES};
use crate::inject::annotations::{self, PodAnnotations};
use crate::inject::MutationPlanner;
use crate::patch::PatchBuilder;
use crate::{Error, Result};

/// Handle a mutating admission review for a Pod
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Json<AdmissionReview<DynamicObject>>, WebhookError> {
    check_content_type(&headers)?;

    if body.is_empty() {
        return Err(WebhookError::InvalidReview(
            "no request body was sent".to_string(),
        ));
    }

    let review: AdmissionReview<DynamicObject> = serde_json::from_slice(&body)
        .map_err(|e| WebhookError::InvalidReview(e.to_string()))?;

    let request: AdmissionRequest<DynamicObject> = review
        .try_into()
        .map_err(|_| WebhookError::InvalidReview("review carries no request".to_string()))?;

    let response = mutate_pod(&state, &request).await;
    Ok(Json(response.into_review()))
}

fn check_content_type(headers: &HeaderMap) -> std::result::Result<(), WebhookError> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let mime = content_type.split(';').next().unwrap_or_default().trim();
    if mime.eq_ignore_ascii_case("application/json") {
        Ok(())
    } else {
        Err(WebhookError::UnsupportedContentType(content_type.to_string()))
    }
}

/// Process a single pod admission; never denies
async fn mutate_pod(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let uid = &request.uid;

    let Some(object) = &request.object else {
        debug!(uid = %uid, "No pod object in request, allowing unchanged");
        return AdmissionResponse::from(request);
    };

    let pod: Pod = match serde_json::to_value(object).and_then(serde_json::from_value) {
        Ok(pod) => pod,
        Err(e) => return fail_open(request, &Error::from(e)),
    };

    match inject(state, request, &pod).await {
        Ok(None) => AdmissionResponse::from(request),
        Ok(Some(patch)) => {
            info!(
                uid = %uid,
                pod = ?pod.metadata.name,
                patch_ops = patch.0.len(),
                "Injecting infisical agent"
            );
            match AdmissionResponse::from(request).with_patch(patch) {
                Ok(response) => response,
                Err(e) => fail_open(request, &Error::serialization(e.to_string())),
            }
        }
        Err(e) => fail_open(request, &e),
    }
}

async fn inject(
    state: &WebhookState,
    request: &AdmissionRequest<DynamicObject>,
    pod: &Pod,
) -> Result<Option<json_patch::Patch>> {
    let uid = &request.uid;
    let pod_annotations = PodAnnotations::new(pod.metadata.annotations.as_ref());

    if !pod_annotations.wants_injection() {
        debug!(uid = %uid, pod = ?pod.metadata.name, "Pod did not opt in, allowing unchanged");
        return Ok(None);
    }

    let namespace = request
        .namespace
        .as_deref()
        .or(pod.metadata.namespace.as_deref())
        .unwrap_or("default");

    if PROTECTED_NAMESPACES.contains(&namespace) {
        return Err(Error::policy(format!(
            "system namespace is not injectable: {namespace}"
        )));
    }

    let planner = MutationPlanner::new(pod)?;

    let config_map = pod_annotations
        .get(annotations::AGENT_CONFIG_MAP)
        .ok_or_else(|| {
            Error::validation(format!(
                "annotation {} is required",
                annotations::AGENT_CONFIG_MAP
            ))
        })?;

    debug!(
        uid = %uid,
        namespace = %namespace,
        config_map = %config_map,
        mode = %planner.mode(),
        platform = ?planner.platform(),
        "Planning injection"
    );

    let config = state.config_source.fetch(namespace, config_map).await?;
    let plan = planner.plan(config)?;
    let patch = PatchBuilder::new(pod).build(&plan)?;

    if patch.is_none() {
        debug!(
            uid = %uid,
            pod = ?pod.metadata.name,
            "Pod already matches the plan, nothing to patch"
        );
    }
    Ok(patch)
}

fn fail_open(request: &AdmissionRequest<DynamicObject>, error: &Error) -> AdmissionResponse {
    warn!(
        uid = %request.uid,
        error = %error,
        "Injection failed, allowing pod unchanged"
    );

    let mut response = AdmissionResponse::from(request);
    response.result = Status::failure(&error.to_string(), "InjectionFailed");
    response
}
