//! Scheduling gate decisions
//!
//! A pod is gated at admission unless placing it is someone else's job: the
//! operator's own pods, system namespaces, pods already bound to a node,
//! control-plane pods, DaemonSet pods, and pods whose author already pinned
//! the architecture.

use k8s_openapi::api::core::v1::{Pod, PodSchedulingGate};
use multiarch_common::crd::NodeAffinityScoring;
use multiarch_common::labels::SCHEDULING_GATE_NAME;
use multiarch_common::{
    CONTROL_PLANE_NODE_SELECTORS, DEFAULT_OPERATOR_NAMESPACE, DEFAULT_RESERVED_NAMESPACE_PREFIXES,
};

use crate::affinity::{has_preferred_arch_term, required_arch_constrained};

const DAEMONSET_KIND: &str = "DaemonSet";

/// Namespaces the gate decision treats specially
#[derive(Clone, Debug)]
pub struct GateSettings {
    /// Namespace the operator itself runs in
    pub operator_namespace: String,
    /// Namespace prefixes reserved for system components
    pub reserved_prefixes: Vec<String>,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            operator_namespace: DEFAULT_OPERATOR_NAMESPACE.to_string(),
            reserved_prefixes: DEFAULT_RESERVED_NAMESPACE_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

/// Why a pod is left alone
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Pod belongs to the operator
    OperatorNamespace,
    /// Namespace starts with a reserved prefix
    ReservedNamespace,
    /// Pod is already bound to a node
    NodeNameSet,
    /// Node selector targets control-plane nodes
    ControlPlane,
    /// Pod is managed by a DaemonSet controller
    DaemonSet,
    /// Author already constrains the architecture
    ArchitectureConstrained,
}

impl IgnoreReason {
    /// Short form for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OperatorNamespace => "operator-namespace",
            Self::ReservedNamespace => "reserved-namespace",
            Self::NodeNameSet => "node-name-set",
            Self::ControlPlane => "control-plane",
            Self::DaemonSet => "daemonset",
            Self::ArchitectureConstrained => "architecture-constrained",
        }
    }
}

/// Reason to leave `pod` ungated, if any
///
/// Pure: looks only at the pod and the passed settings. With scoring enabled
/// an arch-pinned pod is still gated unless it also carries a preferred arch
/// term, so the preferred weights can be added.
pub fn should_ignore(
    pod: &Pod,
    settings: &GateSettings,
    scoring: &NodeAffinityScoring,
) -> Option<IgnoreReason> {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    if namespace == settings.operator_namespace {
        return Some(IgnoreReason::OperatorNamespace);
    }
    if settings
        .reserved_prefixes
        .iter()
        .any(|p| namespace.starts_with(p.as_str()))
    {
        return Some(IgnoreReason::ReservedNamespace);
    }

    let spec = pod.spec.as_ref();
    if spec.and_then(|s| s.node_name.as_deref()).is_some_and(|n| !n.is_empty()) {
        return Some(IgnoreReason::NodeNameSet);
    }
    if spec
        .and_then(|s| s.node_selector.as_ref())
        .is_some_and(|sel| CONTROL_PLANE_NODE_SELECTORS.iter().any(|k| sel.contains_key(*k)))
    {
        return Some(IgnoreReason::ControlPlane);
    }
    if is_daemonset_pod(pod) {
        return Some(IgnoreReason::DaemonSet);
    }
    if required_arch_constrained(pod) && (!scoring.is_enabled() || has_preferred_arch_term(pod)) {
        return Some(IgnoreReason::ArchitectureConstrained);
    }
    None
}

/// Whether `pod` should receive the scheduling gate
pub fn should_gate(pod: &Pod, settings: &GateSettings, scoring: &NodeAffinityScoring) -> bool {
    should_ignore(pod, settings, scoring).is_none()
}

/// Owned by a DaemonSet acting as its controller
fn is_daemonset_pod(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .iter()
        .flatten()
        .any(|o| o.kind == DAEMONSET_KIND && o.controller == Some(true))
}

/// Whether the pod carries our scheduling gate
pub fn has_gate(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.scheduling_gates.as_ref())
        .is_some_and(|gates| gates.iter().any(|g| g.name == SCHEDULING_GATE_NAME))
}

/// Add the scheduling gate; returns false if it was already present
pub fn add_gate(pod: &mut Pod) -> bool {
    if has_gate(pod) {
        return false;
    }
    pod.spec
        .get_or_insert_with(Default::default)
        .scheduling_gates
        .get_or_insert_with(Vec::new)
        .push(PodSchedulingGate {
            name: SCHEDULING_GATE_NAME.to_string(),
        });
    true
}

/// Remove the scheduling gate, keeping any other gates
///
/// Returns false if the gate was not present. An emptied gate list is
/// dropped entirely.
pub fn remove_gate(pod: &mut Pod) -> bool {
    let Some(gates) = pod.spec.as_mut().and_then(|s| s.scheduling_gates.as_mut()) else {
        return false;
    };
    let before = gates.len();
    gates.retain(|g| g.name != SCHEDULING_GATE_NAME);
    let removed = gates.len() != before;
    if gates.is_empty() {
        if let Some(spec) = pod.spec.as_mut() {
            spec.scheduling_gates = None;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, PodSpec,
        PreferredSchedulingTerm,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use multiarch_common::crd::ArchitectureWeight;
    use multiarch_common::ARCH_LABEL;
    use std::collections::BTreeMap;

    fn pod_in(namespace: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            ..Default::default()
        }
    }

    fn owned_by(kind: &str, controller: Option<bool>) -> Pod {
        let mut pod = pod_in("apps");
        pod.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: kind.to_string(),
            name: "owner".to_string(),
            uid: "uid-1".to_string(),
            controller,
            ..Default::default()
        }]);
        pod
    }

    fn arch_term() -> NodeSelectorTerm {
        NodeSelectorTerm {
            match_expressions: Some(vec![NodeSelectorRequirement {
                key: ARCH_LABEL.to_string(),
                operator: "In".to_string(),
                values: Some(vec!["amd64".to_string()]),
            }]),
            match_fields: None,
        }
    }

    fn arch_pinned(with_preferred: bool) -> Pod {
        let mut pod = pod_in("apps");
        pod.spec = Some(PodSpec {
            affinity: Some(Affinity {
                node_affinity: Some(NodeAffinity {
                    required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                        node_selector_terms: vec![arch_term()],
                    }),
                    preferred_during_scheduling_ignored_during_execution: with_preferred.then(
                        || {
                            vec![PreferredSchedulingTerm {
                                weight: 1,
                                preference: arch_term(),
                            }]
                        },
                    ),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
        pod
    }

    fn scoring_enabled() -> NodeAffinityScoring {
        NodeAffinityScoring::Enabled(vec![ArchitectureWeight {
            architecture: "arm64".to_string(),
            weight: 10,
        }])
    }

    fn reason(pod: &Pod) -> Option<IgnoreReason> {
        should_ignore(pod, &GateSettings::default(), &NodeAffinityScoring::Disabled)
    }

    #[test]
    fn ordinary_pod_is_gated() {
        assert!(should_gate(
            &pod_in("apps"),
            &GateSettings::default(),
            &NodeAffinityScoring::Disabled
        ));
    }

    #[test]
    fn system_namespaces_are_ignored() {
        assert_eq!(reason(&pod_in("multiarch-system")), Some(IgnoreReason::OperatorNamespace));
        assert_eq!(reason(&pod_in("kube-system")), Some(IgnoreReason::ReservedNamespace));
        assert_eq!(reason(&pod_in("openshift-dns")), Some(IgnoreReason::ReservedNamespace));
        assert_eq!(reason(&pod_in("hypershift-x")), Some(IgnoreReason::ReservedNamespace));
        assert_eq!(reason(&pod_in("kubeflow")), None);
    }

    #[test]
    fn custom_operator_namespace_is_honoured() {
        let settings = GateSettings {
            operator_namespace: "placement".to_string(),
            reserved_prefixes: vec![],
        };
        let scoring = NodeAffinityScoring::Disabled;
        assert_eq!(
            should_ignore(&pod_in("placement"), &settings, &scoring),
            Some(IgnoreReason::OperatorNamespace)
        );
        assert_eq!(should_ignore(&pod_in("kube-system"), &settings, &scoring), None);
    }

    #[test]
    fn bound_pod_is_ignored() {
        let mut pod = pod_in("apps");
        pod.spec.as_mut().unwrap().node_name = Some("worker-1".to_string());
        assert_eq!(reason(&pod), Some(IgnoreReason::NodeNameSet));
    }

    #[test]
    fn control_plane_selector_is_ignored() {
        for key in CONTROL_PLANE_NODE_SELECTORS {
            let mut pod = pod_in("apps");
            pod.spec.as_mut().unwrap().node_selector =
                Some(BTreeMap::from([(key.to_string(), String::new())]));
            assert_eq!(reason(&pod), Some(IgnoreReason::ControlPlane));
        }
    }

    /// Story: only the DaemonSet that controls a pod exempts it
    #[test]
    fn story_daemonset_controller_flag_decides() {
        assert_eq!(
            reason(&owned_by("DaemonSet", Some(true))),
            Some(IgnoreReason::DaemonSet)
        );
        assert_eq!(reason(&owned_by("DaemonSet", Some(false))), None);
        assert_eq!(reason(&owned_by("DaemonSet", None)), None);
        assert_eq!(reason(&owned_by("ReplicaSet", Some(true))), None);
    }

    /// Story: an arch-pinned pod is still gated when scoring needs to add
    /// preferred terms
    #[test]
    fn story_arch_pinned_pod_and_scoring() {
        let settings = GateSettings::default();

        let pinned = arch_pinned(false);
        assert_eq!(
            should_ignore(&pinned, &settings, &NodeAffinityScoring::Disabled),
            Some(IgnoreReason::ArchitectureConstrained)
        );
        assert!(should_gate(&pinned, &settings, &scoring_enabled()));

        let pinned_and_weighted = arch_pinned(true);
        assert_eq!(
            should_ignore(&pinned_and_weighted, &settings, &scoring_enabled()),
            Some(IgnoreReason::ArchitectureConstrained)
        );
    }

    #[test]
    fn node_selector_arch_pins_the_pod() {
        let mut pod = pod_in("apps");
        pod.spec.as_mut().unwrap().node_selector =
            Some(BTreeMap::from([(ARCH_LABEL.to_string(), "arm64".to_string())]));
        assert_eq!(reason(&pod), Some(IgnoreReason::ArchitectureConstrained));
    }

    #[test]
    fn add_gate_is_idempotent() {
        let mut pod = pod_in("apps");
        assert!(add_gate(&mut pod));
        assert!(!add_gate(&mut pod));
        assert!(has_gate(&pod));
        assert_eq!(pod.spec.as_ref().unwrap().scheduling_gates.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn remove_gate_keeps_foreign_gates() {
        let mut pod = pod_in("apps");
        pod.spec.as_mut().unwrap().scheduling_gates = Some(vec![PodSchedulingGate {
            name: "example.com/other".to_string(),
        }]);
        add_gate(&mut pod);

        assert!(remove_gate(&mut pod));
        assert!(!has_gate(&pod));
        let gates = pod.spec.as_ref().unwrap().scheduling_gates.as_ref().unwrap();
        assert_eq!(gates.len(), 1);
        assert_eq!(gates[0].name, "example.com/other");

        assert!(!remove_gate(&mut pod));
    }

    #[test]
    fn removing_last_gate_drops_the_list() {
        let mut pod = pod_in("apps");
        add_gate(&mut pod);
        assert!(remove_gate(&mut pod));
        assert!(pod.spec.as_ref().unwrap().scheduling_gates.is_none());
    }
}
