//! Architecture sets and container image references

use std::collections::BTreeSet;
use std::fmt;

use k8s_openapi::api::core::v1::{Container, Pod};

/// Pull policy that forces a fresh image lookup
pub const PULL_POLICY_ALWAYS: &str = "Always";

/// Set of CPU architecture names (e.g. `amd64`, `arm64`)
///
/// Iteration is sorted, which keeps generated node affinity deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArchitectureSet(BTreeSet<String>);

impl ArchitectureSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Architectures present in both sets
    pub fn intersection(&self, other: &ArchitectureSet) -> ArchitectureSet {
        Self(self.0.intersection(&other.0).cloned().collect())
    }

    /// Whether `architecture` is in the set
    pub fn contains(&self, architecture: &str) -> bool {
        self.0.contains(architecture)
    }

    /// Add an architecture
    pub fn insert(&mut self, architecture: impl Into<String>) -> bool {
        self.0.insert(architecture.into())
    }

    /// Number of architectures
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no architecture is present
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sorted iterator over architecture names
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Sorted owned architecture names
    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for ArchitectureSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for ArchitectureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.to_vec().join(", "))
    }
}

/// An image referenced by a container, with its cache policy
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerImageRef {
    /// Image reference as written in the pod spec
    pub image: String,
    /// Bypass cached results (pull policy `Always`)
    pub skip_cache: bool,
}

impl ContainerImageRef {
    /// Build a reference from a container
    ///
    /// Returns None for containers without an image.
    pub fn from_container(container: &Container) -> Option<Self> {
        let image = container.image.as_deref()?.trim();
        if image.is_empty() {
            return None;
        }
        Some(Self {
            image: image.to_string(),
            skip_cache: container.image_pull_policy.as_deref() == Some(PULL_POLICY_ALWAYS),
        })
    }
}

/// Distinct image references of a pod's init and regular containers
pub fn pod_images(pod: &Pod) -> BTreeSet<ContainerImageRef> {
    let Some(spec) = pod.spec.as_ref() else {
        return BTreeSet::new();
    };
    spec.init_containers
        .iter()
        .flatten()
        .chain(spec.containers.iter())
        .filter_map(ContainerImageRef::from_container)
        .collect()
}
