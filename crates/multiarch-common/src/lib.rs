//! Common types for the multiarch placement operator: CRDs, label contract,
//! shared stores, errors, events and telemetry

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod labels;
pub mod metrics;
pub mod store;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default namespace the operator runs in
pub const DEFAULT_OPERATOR_NAMESPACE: &str = "multiarch-system";

/// Field manager / reporting component name used for API writes and Events
pub const OPERATOR_NAME: &str = "multiarch-placement";

/// Namespace prefixes reserved for cluster system components
///
/// Pods in these namespaces are never gated.
pub const DEFAULT_RESERVED_NAMESPACE_PREFIXES: &[&str] = &["kube-", "openshift-", "hypershift-"];

/// Well-known node label carrying the CPU architecture
pub const ARCH_LABEL: &str = "kubernetes.io/arch";

/// Node selector keys identifying control-plane nodes
pub const CONTROL_PLANE_NODE_SELECTORS: &[&str] = &[
    "node-role.kubernetes.io/master",
    "node-role.kubernetes.io/control-plane",
];
