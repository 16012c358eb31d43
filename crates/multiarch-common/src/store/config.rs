//! Holder of the ClusterPodPlacementConfig singleton
//!
//! Written by the config watcher, read concurrently by the webhook and the
//! pod controller. Writers always replace the whole value so readers holding
//! an `Arc` from before keep a consistent snapshot.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::crd::{ClusterPodPlacementConfig, NodeAffinityScoring, PLACEMENT_CONFIG_NAME};
use crate::Error;

/// Thread-safe store for the active placement config
#[derive(Debug, Default)]
pub struct ConfigStore {
    current: RwLock<Option<Arc<ClusterPodPlacementConfig>>>,
}

impl ConfigStore {
    /// Create an empty store (all plugins disabled)
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and activate a config, replacing the previous one
    ///
    /// Invalid configs are rejected and the previous value stays active.
    pub fn apply(&self, config: ClusterPodPlacementConfig) -> Result<(), Error> {
        config.validate()?;
        info!(
            scoring = config.spec.scoring().is_enabled(),
            "Activating ClusterPodPlacementConfig"
        );
        *self.current.write() = Some(Arc::new(config));
        Ok(())
    }

    /// Forget the active config if `name` is the singleton
    pub fn remove(&self, name: &str) {
        if name != PLACEMENT_CONFIG_NAME {
            debug!(name, "Ignoring delete of non-singleton ClusterPodPlacementConfig");
            return;
        }
        info!("ClusterPodPlacementConfig removed, plugins disabled");
        *self.current.write() = None;
    }

    /// Snapshot of the active config
    pub fn get(&self) -> Option<Arc<ClusterPodPlacementConfig>> {
        self.current.read().clone()
    }

    /// Effective scoring plugin state; disabled when no config is active
    pub fn scoring(&self) -> NodeAffinityScoring {
        self.current
            .read()
            .as_ref()
            .map(|c| c.spec.scoring())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        ArchitectureWeight, ClusterPodPlacementConfigSpec, NodeAffinityScoringSpec, PluginsSpec,
    };

    fn config(name: &str, platforms: Vec<(&str, i32)>) -> ClusterPodPlacementConfig {
        ClusterPodPlacementConfig::new(
            name,
            ClusterPodPlacementConfigSpec {
                plugins: Some(PluginsSpec {
                    node_affinity_scoring: Some(NodeAffinityScoringSpec {
                        enabled: true,
                        platforms: platforms
                            .into_iter()
                            .map(|(a, w)| ArchitectureWeight {
                                architecture: a.to_string(),
                                weight: w,
                            })
                            .collect(),
                    }),
                }),
                ..Default::default()
            },
        )
    }

    #[test]
    fn absent_config_disables_scoring() {
        let store = ConfigStore::new();
        assert!(store.get().is_none());
        assert_eq!(store.scoring(), NodeAffinityScoring::Disabled);
    }

    #[test]
    fn apply_then_remove() {
        let store = ConfigStore::new();
        store.apply(config("cluster", vec![("arm64", 10)])).unwrap();
        assert!(store.scoring().is_enabled());

        store.remove("cluster");
        assert!(store.get().is_none());
    }

    #[test]
    fn invalid_config_keeps_previous_value() {
        let store = ConfigStore::new();
        store.apply(config("cluster", vec![("arm64", 10)])).unwrap();

        let bad = config("cluster", vec![("amd64", 1), ("amd64", 2)]);
        assert!(store.apply(bad).is_err());

        match store.scoring() {
            NodeAffinityScoring::Enabled(p) => assert_eq!(p[0].architecture, "arm64"),
            NodeAffinityScoring::Disabled => panic!("previous config should stay active"),
        }
    }

    #[test]
    fn non_singleton_is_rejected_and_not_removed() {
        let store = ConfigStore::new();
        assert!(store.apply(config("other", vec![])).is_err());

        store.apply(config("cluster", vec![])).unwrap();
        store.remove("other");
        assert!(store.get().is_some());
    }

    #[test]
    fn snapshot_survives_replacement() {
        let store = ConfigStore::new();
        store.apply(config("cluster", vec![("arm64", 10)])).unwrap();
        let before = store.get().unwrap();

        store.apply(config("cluster", vec![("amd64", 20)])).unwrap();
        assert_eq!(
            before.spec.scoring(),
            config("cluster", vec![("arm64", 10)]).spec.scoring()
        );
    }

    #[test]
    fn concurrent_readers_see_whole_values() {
        let store = Arc::new(ConfigStore::new());
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    let arch = if i % 2 == 0 { "arm64" } else { "amd64" };
                    store.apply(config("cluster", vec![(arch, 10), ("s390x", 5)])).unwrap();
                }
            })
        };
        for _ in 0..200 {
            if let NodeAffinityScoring::Enabled(p) = store.scoring() {
                assert_eq!(p.len(), 2);
                assert_eq!(p[1].architecture, "s390x");
            }
        }
        writer.join().unwrap();
    }
}
