//! Label and annotation contract written onto pods
//!
//! External observers select on these keys, so they are stable. The retry
//! counter is stored as a label string but handled as [`RetryCount`] inside
//! the operator.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Group prefix for every label the operator writes
pub const LABEL_GROUP: &str = "multiarch.dev";

/// Scheduling gate added at admission and removed once placement is decided
pub const SCHEDULING_GATE_NAME: &str = "multiarch.dev/scheduling-gate";

/// Label mirroring the gate state (`gated` / `removed`)
pub const SCHEDULING_GATE_LABEL: &str = "multiarch.dev/scheduling-gate";
/// Gate present, placement pending
pub const SCHEDULING_GATE_GATED: &str = "gated";
/// Gate removed by the controller
pub const SCHEDULING_GATE_REMOVED: &str = "removed";

/// Label selector the pod controller watches on
pub const GATED_POD_SELECTOR: &str = "multiarch.dev/scheduling-gate=gated";

/// Whether the required node affinity was patched (`set` / `not-set`)
pub const NODE_AFFINITY_LABEL: &str = "multiarch.dev/node-affinity";
/// Whether the preferred node affinity was patched (`set` / `not-set`)
pub const PREFERRED_NODE_AFFINITY_LABEL: &str = "multiarch.dev/preferred-node-affinity";
/// Affinity was written by the operator
pub const AFFINITY_SET: &str = "set";
/// Affinity was left as the author wrote it
pub const AFFINITY_NOT_SET: &str = "not-set";

/// All images resolve to exactly one common architecture
pub const SINGLE_ARCH_LABEL: &str = "multiarch.dev/single-arch";
/// All images share more than one architecture
pub const MULTI_ARCH_LABEL: &str = "multiarch.dev/multi-arch";
/// Images share no architecture
///
/// Also used as the node affinity key of the unsatisfiable requirement, so no
/// node may ever carry it.
pub const NO_SUPPORTED_ARCH_LABEL: &str = "multiarch.dev/no-supported-arch";

/// Marker set while the last inspection attempt failed
pub const IMAGE_INSPECT_ERROR_LABEL: &str = "multiarch.dev/image-inspect-error";
/// Number of failed inspection attempts
pub const IMAGE_INSPECT_ERROR_COUNT_LABEL: &str = "multiarch.dev/image-inspect-error-count";
/// Annotation carrying the text of the last inspection error
pub const IMAGE_INSPECT_ERROR_ANNOTATION: &str = "multiarch.dev/image-inspect-error";
/// Annotation with the unix time (seconds) of the last failed inspection
pub const IMAGE_INSPECT_LAST_ATTEMPT_ANNOTATION: &str =
    "multiarch.dev/image-inspect-last-attempt";

/// Value used for presence-only marker labels
pub const MARKER_VALUE: &str = "";

/// Maximum number of failed inspections before the gate is removed anyway
pub const MAX_RETRY_COUNT: RetryCount = RetryCount(5);

/// Per-architecture marker label key, e.g. `multiarch.dev/arch.arm64`
pub fn arch_label(architecture: &str) -> String {
    format!("{}/arch.{}", LABEL_GROUP, architecture)
}

/// Number of failed image inspections recorded on a pod
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct RetryCount(pub u32);

impl RetryCount {
    /// Parse a label value; absent or non-numeric means not retried yet
    pub fn parse(value: Option<&str>) -> Self {
        Self(value.and_then(|v| v.trim().parse().ok()).unwrap_or(0))
    }

    /// Read the counter from object metadata
    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self::parse(
            meta.labels
                .as_ref()
                .and_then(|l| l.get(IMAGE_INSPECT_ERROR_COUNT_LABEL))
                .map(String::as_str),
        )
    }

    /// The counter after one more failure
    pub fn incremented(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Whether retries are exhausted
    pub fn is_exhausted(self) -> bool {
        self >= MAX_RETRY_COUNT
    }
}

impl fmt::Display for RetryCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Set a label, creating the label map if needed
pub fn set_label(meta: &mut ObjectMeta, key: &str, value: &str) {
    meta.labels
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
}

/// Remove a label if present
pub fn remove_label(meta: &mut ObjectMeta, key: &str) {
    if let Some(labels) = meta.labels.as_mut() {
        labels.remove(key);
    }
}

/// Set an annotation, creating the annotation map if needed
pub fn set_annotation(meta: &mut ObjectMeta, key: &str, value: &str) {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
}

/// Remove an annotation if present
pub fn remove_annotation(meta: &mut ObjectMeta, key: &str) {
    if let Some(annotations) = meta.annotations.as_mut() {
        annotations.remove(key);
    }
}

/// Read an annotation value
pub fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Read a label value
pub fn label<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}
