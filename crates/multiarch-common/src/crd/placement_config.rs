//! ClusterPodPlacementConfig CRD
//!
//! Cluster-wide singleton that tunes how gated pods are placed. Only the
//! object named [`PLACEMENT_CONFIG_NAME`] is honoured. When it is absent all
//! plugins are disabled.

use std::collections::HashSet;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Name of the singleton ClusterPodPlacementConfig
pub const PLACEMENT_CONFIG_NAME: &str = "cluster";

/// Lowest accepted preference weight (matches the scheduler's range)
pub const MIN_WEIGHT: i32 = 1;
/// Highest accepted preference weight
pub const MAX_WEIGHT: i32 = 100;

/// ClusterPodPlacementConfig configures architecture-aware placement.
///
/// Example:
/// ```yaml
/// apiVersion: multiarch.dev/v1alpha1
/// kind: ClusterPodPlacementConfig
/// metadata:
///   name: cluster
/// spec:
///   logVerbosity: Normal
///   plugins:
///     nodeAffinityScoring:
///       enabled: true
///       platforms:
///         - architecture: arm64
///           weight: 50
///         - architecture: amd64
///           weight: 25
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "multiarch.dev",
    version = "v1alpha1",
    kind = "ClusterPodPlacementConfig",
    plural = "clusterpodplacementconfigs",
    shortname = "cppc",
    printcolumn = r#"{"name":"Scoring","type":"boolean","jsonPath":".spec.plugins.nodeAffinityScoring.enabled"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPodPlacementConfigSpec {
    /// Log verbosity of the operator components
    #[serde(default)]
    pub log_verbosity: LogVerbosity,

    /// Optional placement plugins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<PluginsSpec>,
}

/// Operator log verbosity
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LogVerbosity {
    /// info and above
    #[default]
    Normal,
    /// debug and above
    Debug,
    /// everything
    Trace,
}

impl LogVerbosity {
    /// tracing filter directive for this verbosity
    pub fn as_directive(&self) -> &'static str {
        match self {
            Self::Normal => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Placement plugins
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginsSpec {
    /// Preferred node affinity scoring by architecture
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_affinity_scoring: Option<NodeAffinityScoringSpec>,
}

/// Preferred node affinity scoring plugin
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeAffinityScoringSpec {
    /// Whether the plugin is active
    #[serde(default)]
    pub enabled: bool,

    /// Architectures to prefer, each with a scheduler weight
    #[serde(default)]
    pub platforms: Vec<ArchitectureWeight>,
}

/// A single architecture preference
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArchitectureWeight {
    /// Architecture name as reported by `kubernetes.io/arch` (e.g. arm64)
    pub architecture: String,
    /// Scheduler weight in 1..=100
    pub weight: i32,
}

/// Effective preference scoring, resolved from the config singleton
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum NodeAffinityScoring {
    /// No preferred terms are added
    #[default]
    Disabled,
    /// One preferred term is added per entry, in order
    Enabled(Vec<ArchitectureWeight>),
}

impl NodeAffinityScoring {
    /// Whether the plugin is active
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled(_))
    }
}

impl ClusterPodPlacementConfigSpec {
    /// Validate the spec; rejected configs never become active
    pub fn validate(&self) -> Result<(), Error> {
        let Some(scoring) = self
            .plugins
            .as_ref()
            .and_then(|p| p.node_affinity_scoring.as_ref())
        else {
            return Ok(());
        };

        let field = "spec.plugins.nodeAffinityScoring.platforms";
        let mut seen = HashSet::new();
        for platform in &scoring.platforms {
            if platform.architecture.trim().is_empty() {
                return Err(Error::validation_for_field(
                    PLACEMENT_CONFIG_NAME,
                    field,
                    "architecture must not be empty",
                ));
            }
            if !(MIN_WEIGHT..=MAX_WEIGHT).contains(&platform.weight) {
                return Err(Error::validation_for_field(
                    PLACEMENT_CONFIG_NAME,
                    field,
                    format!(
                        "weight {} for {} must be between {} and {}",
                        platform.weight, platform.architecture, MIN_WEIGHT, MAX_WEIGHT
                    ),
                ));
            }
            if !seen.insert(platform.architecture.as_str()) {
                return Err(Error::validation_for_field(
                    PLACEMENT_CONFIG_NAME,
                    field,
                    format!("duplicate architecture {}", platform.architecture),
                ));
            }
        }
        Ok(())
    }

    /// Effective scoring plugin state
    pub fn scoring(&self) -> NodeAffinityScoring {
        match self
            .plugins
            .as_ref()
            .and_then(|p| p.node_affinity_scoring.as_ref())
        {
            Some(s) if s.enabled => NodeAffinityScoring::Enabled(s.platforms.clone()),
            _ => NodeAffinityScoring::Disabled,
        }
    }
}

impl ClusterPodPlacementConfig {
    /// Validate name and spec
    pub fn validate(&self) -> Result<(), Error> {
        let name = self.metadata.name.as_deref().unwrap_or_default();
        if name != PLACEMENT_CONFIG_NAME {
            return Err(Error::validation_for_field(
                name,
                "metadata.name",
                format!("only the singleton named {} is honoured", PLACEMENT_CONFIG_NAME),
            ));
        }
        self.spec.validate()
    }
}
