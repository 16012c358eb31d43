//! Pod admission: add the scheduling gate
//!
//! Handles AdmissionReview requests for Pod CREATE. Gated pods get the
//! `multiarch.dev/scheduling-gate` gate and label through a JSON patch; pods
//! that already pin their architecture only get the node-affinity label.

use std::sync::Arc;

use axum::{extract::State, Json};
use json_patch::{AddOperation, PatchOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::Pod;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::runtime::events::EventType;
use kube::Resource;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use multiarch_common::events::{actions, reasons, PendingEvent};
use multiarch_common::labels::{
    AFFINITY_NOT_SET, NODE_AFFINITY_LABEL, SCHEDULING_GATE_GATED, SCHEDULING_GATE_LABEL,
    SCHEDULING_GATE_NAME,
};
use multiarch_common::metrics::{self, AdmissionDecision};

use super::WebhookState;
use crate::gate::{has_gate, should_ignore, IgnoreReason};

/// Handle mutating admission review for Pods
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<Pod> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    Json(admit_pod(&state, &req).into_review())
}

/// Decide on a single pod and build the response
///
/// Never denies; events are queued on the dispatcher and never awaited.
pub fn admit_pod(state: &WebhookState, request: &AdmissionRequest<Pod>) -> AdmissionResponse {
    let Some(object) = request.object.as_ref() else {
        debug!(uid = %request.uid, "No pod object in request, allowing unchanged");
        return AdmissionResponse::from(request);
    };

    let mut pod = object.clone();
    if pod.metadata.namespace.is_none() {
        pod.metadata.namespace = request.namespace.clone();
    }

    let Some(ops) = admission_patch(state, &pod) else {
        return AdmissionResponse::from(request);
    };

    match AdmissionResponse::from(request).with_patch(json_patch::Patch(ops)) {
        Ok(response) => response,
        Err(e) => {
            // Admission must not block pod creation on our behalf
            error!(
                uid = %request.uid,
                error = %e,
                "Failed to serialize patch, allowing unchanged"
            );
            AdmissionResponse::from(request)
        }
    }
}

/// Patch to apply to a pod being created, or None to leave it unchanged
///
/// `pod` must already carry its namespace.
pub fn admission_patch(state: &WebhookState, pod: &Pod) -> Option<Vec<PatchOperation>> {
    let pod_name = pod
        .metadata
        .name
        .as_deref()
        .or(pod.metadata.generate_name.as_deref())
        .unwrap_or_default();

    let scoring = state.config.scoring();
    match should_ignore(pod, &state.settings, &scoring) {
        Some(IgnoreReason::ArchitectureConstrained) => {
            debug!(pod = %pod_name, "Pod already constrains architecture");
            metrics::record_admission(AdmissionDecision::Ignored);
            dispatch(
                state,
                pod,
                EventType::Normal,
                reasons::PREDICATE_CONFLICT,
                "node affinity already constrains the architecture, leaving it as is",
            );
            Some(vec![label_operation(pod, NODE_AFFINITY_LABEL, AFFINITY_NOT_SET)])
        }
        Some(reason) => {
            debug!(pod = %pod_name, reason = reason.as_str(), "Pod not gated");
            metrics::record_admission(AdmissionDecision::Ignored);
            None
        }
        None => {
            info!(pod = %pod_name, namespace = ?pod.metadata.namespace, "Gating pod");
            metrics::record_admission(AdmissionDecision::Gated);
            dispatch(
                state,
                pod,
                EventType::Normal,
                reasons::SCHEDULING_GATE_ADDED,
                "scheduling gated until image architectures are known",
            );
            Some(gate_operations(pod))
        }
    }
}

fn dispatch(state: &WebhookState, pod: &Pod, type_: EventType, reason: &'static str, note: &str) {
    state.events.dispatch(PendingEvent {
        resource_ref: pod.object_ref(&()),
        type_,
        reason,
        action: actions::ADMIT,
        note: Some(note.to_string()),
    });
}

/// Patch adding the gate (if absent) and the `gated` label
fn gate_operations(pod: &Pod) -> Vec<PatchOperation> {
    let mut ops = Vec::new();

    if !has_gate(pod) {
        let gate = json!({ "name": SCHEDULING_GATE_NAME });
        let existing = pod.spec.as_ref().and_then(|s| s.scheduling_gates.as_ref());
        ops.push(match existing {
            Some(_) => PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["spec", "schedulingGates", "-"]),
                value: gate,
            }),
            None => PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["spec", "schedulingGates"]),
                value: Value::Array(vec![gate]),
            }),
        });
    }

    ops.push(label_operation(pod, SCHEDULING_GATE_LABEL, SCHEDULING_GATE_GATED));
    ops
}

/// Add (or overwrite) one label, creating the label map when missing
fn label_operation(pod: &Pod, key: &str, value: &str) -> PatchOperation {
    if pod.metadata.labels.is_some() {
        PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["metadata", "labels", key]),
            value: Value::String(value.to_string()),
        })
    } else {
        PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["metadata", "labels"]),
            value: json!({ key: value }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::GateSettings;
    use k8s_openapi::api::core::v1::{
        Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
        PodSchedulingGate, PodSpec,
    };
    use multiarch_common::events::{EventDispatcher, NoopEventPublisher};
    use multiarch_common::labels::label;
    use multiarch_common::store::ConfigStore;
    use multiarch_common::ARCH_LABEL;
    use std::collections::BTreeMap;

    fn state() -> WebhookState {
        WebhookState {
            config: Arc::new(ConfigStore::new()),
            settings: GateSettings::default(),
            events: Arc::new(EventDispatcher::start(Arc::new(NoopEventPublisher), 1, 16)),
        }
    }

    fn plain_pod() -> Pod {
        Pod {
            metadata: kube::api::ObjectMeta {
                generate_name: Some("web-".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            ..Default::default()
        }
    }

    fn arch_pinned_pod() -> Pod {
        let mut pod = plain_pod();
        pod.spec.as_mut().unwrap().affinity = Some(Affinity {
            node_affinity: Some(NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(vec![NodeSelectorRequirement {
                            key: ARCH_LABEL.to_string(),
                            operator: "In".to_string(),
                            values: Some(vec!["arm64".to_string()]),
                        }]),
                        match_fields: None,
                    }],
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
        pod
    }

    fn request(pod: &Pod, namespace: &str) -> AdmissionRequest<Pod> {
        let review: AdmissionReview<Pod> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "namespace": namespace,
                "operation": "CREATE",
                "userInfo": {"username": "system:serviceaccount:apps:deployer"},
                "object": pod,
            }
        }))
        .unwrap();
        review.try_into().unwrap()
    }

    fn has_patch(response: AdmissionResponse) -> bool {
        let review = serde_json::to_value(response.into_review()).unwrap();
        !review["response"]["patch"].is_null()
    }

    fn apply(pod: &Pod, ops: Vec<PatchOperation>) -> Pod {
        let mut doc = serde_json::to_value(pod).unwrap();
        json_patch::patch(&mut doc, &ops).unwrap();
        serde_json::from_value(doc).unwrap()
    }

    #[tokio::test]
    async fn story_plain_pod_is_gated_and_labelled() {
        let state = state();
        let req = request(&plain_pod(), "apps");

        let response = admit_pod(&state, &req);
        assert!(response.allowed);
        assert!(has_patch(response));

        let patched = apply(&plain_pod(), gate_operations(&plain_pod()));
        assert!(has_gate(&patched));
        assert_eq!(
            label(&patched.metadata, SCHEDULING_GATE_LABEL),
            Some(SCHEDULING_GATE_GATED)
        );
    }

    #[test]
    fn gate_is_appended_after_foreign_gates() {
        let mut pod = plain_pod();
        pod.spec.as_mut().unwrap().scheduling_gates = Some(vec![PodSchedulingGate {
            name: "example.com/quota".to_string(),
        }]);
        pod.metadata.labels = Some(BTreeMap::from([("app".to_string(), "web".to_string())]));

        let patched = apply(&pod, gate_operations(&pod));
        let gates = patched.spec.unwrap().scheduling_gates.unwrap();
        assert_eq!(gates.len(), 2);
        assert_eq!(gates[0].name, "example.com/quota");
        assert_eq!(gates[1].name, SCHEDULING_GATE_NAME);
        assert_eq!(patched.metadata.labels.unwrap().len(), 2);
    }

    #[test]
    fn already_gated_pod_only_gets_label() {
        let mut pod = plain_pod();
        crate::gate::add_gate(&mut pod);
        let ops = gate_operations(&pod);
        assert_eq!(ops.len(), 1);

        let patched = apply(&pod, ops);
        assert_eq!(patched.spec.unwrap().scheduling_gates.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn arch_pinned_pod_is_labelled_not_gated() {
        let state = state();
        let response = admit_pod(&state, &request(&arch_pinned_pod(), "apps"));
        assert!(response.allowed);
        assert!(has_patch(response));

        let pod = arch_pinned_pod();
        let ops = vec![label_operation(&pod, NODE_AFFINITY_LABEL, AFFINITY_NOT_SET)];
        let patched = apply(&pod, ops);
        assert!(!has_gate(&patched));
        assert_eq!(
            label(&patched.metadata, NODE_AFFINITY_LABEL),
            Some(AFFINITY_NOT_SET)
        );
    }

    #[tokio::test]
    async fn reserved_namespace_pod_passes_unchanged() {
        let state = state();
        let response = admit_pod(&state, &request(&plain_pod(), "kube-system"));
        assert!(response.allowed);
        assert!(!has_patch(response));
    }

    #[tokio::test]
    async fn request_namespace_fills_missing_pod_namespace() {
        let state = state();
        // Operator namespace only known from the request
        let response = admit_pod(&state, &request(&plain_pod(), "multiarch-system"));
        assert!(!has_patch(response));

        let response = admit_pod(&state, &request(&plain_pod(), "apps"));
        assert!(has_patch(response));
    }

    #[test]
    fn label_keys_with_slashes_are_escaped() {
        let mut labelled = plain_pod();
        labelled.metadata.labels = Some(BTreeMap::new());
        let op = label_operation(&labelled, SCHEDULING_GATE_LABEL, SCHEDULING_GATE_GATED);
        let PatchOperation::Add(add) = &op else {
            panic!("expected add operation");
        };
        assert_eq!(add.path.as_str(), "/metadata/labels/multiarch.dev~1scheduling-gate");
    }
}
