//! Node affinity construction
//!
//! Required affinity pins a pod to the architectures all of its images
//! support. Preferred affinity adds cluster-configured weights on top. Both
//! only ever add to what the pod author wrote.

use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, Pod,
    PreferredSchedulingTerm,
};
use multiarch_common::crd::NodeAffinityScoring;
use multiarch_common::labels::{
    set_label, AFFINITY_NOT_SET, AFFINITY_SET, NODE_AFFINITY_LABEL, NO_SUPPORTED_ARCH_LABEL,
    PREFERRED_NODE_AFFINITY_LABEL,
};
use multiarch_common::ARCH_LABEL;
use multiarch_image::ArchitectureSet;

const OP_IN: &str = "In";
const OP_EXISTS: &str = "Exists";

/// Requirement restricting nodes to `architectures`
///
/// An empty set yields `multiarch.dev/no-supported-arch Exists`, a key no
/// node carries, so the pod stays Pending instead of landing on a node it
/// cannot run on.
pub fn build_requirement(architectures: &ArchitectureSet) -> NodeSelectorRequirement {
    if architectures.is_empty() {
        return NodeSelectorRequirement {
            key: NO_SUPPORTED_ARCH_LABEL.to_string(),
            operator: OP_EXISTS.to_string(),
            values: None,
        };
    }
    NodeSelectorRequirement {
        key: ARCH_LABEL.to_string(),
        operator: OP_IN.to_string(),
        values: Some(architectures.to_vec()),
    }
}

/// Whether a term already says something about the architecture
pub fn term_constrains_arch(term: &NodeSelectorTerm) -> bool {
    term.match_expressions
        .iter()
        .flatten()
        .any(|e| e.key == ARCH_LABEL)
}

fn node_affinity(pod: &Pod) -> Option<&NodeAffinity> {
    pod.spec
        .as_ref()
        .and_then(|s| s.affinity.as_ref())
        .and_then(|a| a.node_affinity.as_ref())
}

fn node_selector_has_arch(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_selector.as_ref())
        .is_some_and(|sel| sel.contains_key(ARCH_LABEL))
}

/// Whether the pod's required scheduling fully pins the architecture
///
/// True when the node selector names the arch label, or when every OR'd
/// required term carries an arch expression.
pub fn required_arch_constrained(pod: &Pod) -> bool {
    if node_selector_has_arch(pod) {
        return true;
    }
    let terms = node_affinity(pod)
        .and_then(|na| na.required_during_scheduling_ignored_during_execution.as_ref())
        .map(|sel| sel.node_selector_terms.as_slice())
        .unwrap_or_default();
    !terms.is_empty() && terms.iter().all(term_constrains_arch)
}

/// Whether any preferred term already weights the architecture
pub fn has_preferred_arch_term(pod: &Pod) -> bool {
    node_affinity(pod)
        .and_then(|na| na.preferred_during_scheduling_ignored_during_execution.as_ref())
        .is_some_and(|terms| terms.iter().any(|t| term_constrains_arch(&t.preference)))
}

/// Add `requirement` to every required term that lacks an arch expression
///
/// Terms are OR'd by the scheduler, so each one must carry the requirement.
/// Returns whether any term was patched; the node-affinity label records the
/// outcome.
pub fn apply_required(pod: &mut Pod, requirement: &NodeSelectorRequirement) -> bool {
    let patched = !node_selector_has_arch(pod) && patch_required_terms(pod, requirement);
    let value = if patched { AFFINITY_SET } else { AFFINITY_NOT_SET };
    set_label(&mut pod.metadata, NODE_AFFINITY_LABEL, value);
    patched
}

fn patch_required_terms(pod: &mut Pod, requirement: &NodeSelectorRequirement) -> bool {
    let spec = pod.spec.get_or_insert_with(Default::default);
    let selector = spec
        .affinity
        .get_or_insert_with(Affinity::default)
        .node_affinity
        .get_or_insert_with(NodeAffinity::default)
        .required_during_scheduling_ignored_during_execution
        .get_or_insert_with(NodeSelector::default);

    if selector.node_selector_terms.is_empty() {
        selector.node_selector_terms.push(NodeSelectorTerm::default());
    }

    let mut patched = false;
    for term in selector.node_selector_terms.iter_mut() {
        if term_constrains_arch(term) {
            continue;
        }
        term.match_expressions
            .get_or_insert_with(Vec::new)
            .push(requirement.clone());
        patched = true;
    }
    patched
}

/// Append one preferred term per configured architecture weight
///
/// No-op when scoring is disabled or the author already weighted the
/// architecture. Existing preferred terms keep their order.
pub fn apply_preferred(pod: &mut Pod, scoring: &NodeAffinityScoring) -> bool {
    let patched = match scoring {
        NodeAffinityScoring::Enabled(platforms)
            if !platforms.is_empty() && !has_preferred_arch_term(pod) =>
        {
            let spec = pod.spec.get_or_insert_with(Default::default);
            let preferred = spec
                .affinity
                .get_or_insert_with(Affinity::default)
                .node_affinity
                .get_or_insert_with(NodeAffinity::default)
                .preferred_during_scheduling_ignored_during_execution
                .get_or_insert_with(Vec::new);

            preferred.extend(platforms.iter().map(|p| PreferredSchedulingTerm {
                weight: p.weight,
                preference: NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: ARCH_LABEL.to_string(),
                        operator: OP_IN.to_string(),
                        values: Some(vec![p.architecture.clone()]),
                    }]),
                    match_fields: None,
                },
            }));
            true
        }
        _ => false,
    };
    let value = if patched { AFFINITY_SET } else { AFFINITY_NOT_SET };
    set_label(&mut pod.metadata, PREFERRED_NODE_AFFINITY_LABEL, value);
    patched
}
