//! Custom Resource Definitions for the placement operator

mod placement_config;

pub use placement_config::{
    ArchitectureWeight, ClusterPodPlacementConfig, ClusterPodPlacementConfigSpec, LogVerbosity,
    NodeAffinityScoring, NodeAffinityScoringSpec, PluginsSpec, MAX_WEIGHT, MIN_WEIGHT,
    PLACEMENT_CONFIG_NAME,
};
