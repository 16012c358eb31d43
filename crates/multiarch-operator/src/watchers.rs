//! Watchers feeding the shared stores
//!
//! The ClusterPodPlacementConfig singleton and the global pull secret are
//! both watched and mirrored into their in-memory stores. Stream errors are
//! retried with the default watcher backoff; the stores keep their last value
//! meanwhile.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use multiarch_common::crd::{ClusterPodPlacementConfig, LogVerbosity, PLACEMENT_CONFIG_NAME};
use multiarch_common::store::{extract_auth_payload, ConfigStore, PullSecretStore};
use multiarch_common::telemetry::LogLevelHandle;

/// Tracks whether an object survived a relist
///
/// A relist that no longer contains the object means it was deleted while
/// the watch was down, which never produces a `Delete` event.
#[derive(Debug, Default)]
struct RelistTracker {
    in_relist: bool,
    seen: bool,
}

impl RelistTracker {
    fn start(&mut self) {
        self.in_relist = true;
        self.seen = false;
    }

    fn saw(&mut self) {
        if self.in_relist {
            self.seen = true;
        }
    }

    /// True when the object vanished during the relist
    fn finish(&mut self) -> bool {
        let vanished = self.in_relist && !self.seen;
        self.in_relist = false;
        vanished
    }
}

/// Applies ClusterPodPlacementConfig watch events to the store
#[derive(Debug)]
pub struct ConfigWatchHandler {
    store: Arc<ConfigStore>,
    relist: RelistTracker,
}

impl ConfigWatchHandler {
    /// Create a handler writing into `store`
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            store,
            relist: RelistTracker::default(),
        }
    }

    /// Apply one event; returns the verbosity to switch to, if any
    pub fn handle(&mut self, event: Event<ClusterPodPlacementConfig>) -> Option<LogVerbosity> {
        match event {
            Event::Init => {
                self.relist.start();
                None
            }
            Event::Apply(config) | Event::InitApply(config) => {
                let name = config.name_any();
                if name != PLACEMENT_CONFIG_NAME {
                    debug!(%name, "Ignoring non-singleton ClusterPodPlacementConfig");
                    return None;
                }
                self.relist.saw();
                let verbosity = config.spec.log_verbosity;
                match self.store.apply(config) {
                    Ok(()) => Some(verbosity),
                    Err(e) => {
                        warn!(error = %e, "Invalid ClusterPodPlacementConfig, keeping previous");
                        None
                    }
                }
            }
            Event::Delete(config) => {
                self.store.remove(&config.name_any());
                if config.name_any() == PLACEMENT_CONFIG_NAME {
                    Some(LogVerbosity::default())
                } else {
                    None
                }
            }
            Event::InitDone => {
                if self.relist.finish() && self.store.get().is_some() {
                    info!("ClusterPodPlacementConfig gone after relist");
                    self.store.remove(PLACEMENT_CONFIG_NAME);
                    return Some(LogVerbosity::default());
                }
                None
            }
        }
    }
}

/// Applies global pull secret watch events to the store
#[derive(Debug)]
pub struct PullSecretWatchHandler {
    store: Arc<PullSecretStore>,
    name: String,
    relist: RelistTracker,
}

impl PullSecretWatchHandler {
    /// Create a handler for the secret called `name`
    pub fn new(store: Arc<PullSecretStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
            relist: RelistTracker::default(),
        }
    }

    /// Apply one event
    pub fn handle(&mut self, event: Event<Secret>) {
        match event {
            Event::Init => self.relist.start(),
            Event::Apply(secret) | Event::InitApply(secret) => {
                if secret.name_any() != self.name {
                    return;
                }
                self.relist.saw();
                match extract_auth_payload(&secret) {
                    Ok(bytes) => {
                        info!(secret = %self.name, "Global pull secret updated");
                        self.store.set(bytes);
                    }
                    Err(e) => {
                        // Stale credentials are worse than none
                        warn!(secret = %self.name, error = %e, "Unusable global pull secret, clearing");
                        self.store.clear();
                    }
                }
            }
            Event::Delete(secret) => {
                if secret.name_any() == self.name {
                    info!(secret = %self.name, "Global pull secret deleted");
                    self.store.clear();
                }
            }
            Event::InitDone => {
                if self.relist.finish() && self.store.get().is_some() {
                    info!(secret = %self.name, "Global pull secret gone after relist");
                    self.store.clear();
                }
            }
        }
    }
}

/// Mirror the ClusterPodPlacementConfig singleton into `store`
///
/// Log verbosity changes are applied through `log_level` as they arrive.
pub async fn watch_placement_config(
    client: Client,
    store: Arc<ConfigStore>,
    log_level: Option<LogLevelHandle>,
) {
    let api: Api<ClusterPodPlacementConfig> = Api::all(client);
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    tokio::pin!(stream);

    let mut handler = ConfigWatchHandler::new(store);
    info!("Watching ClusterPodPlacementConfig");

    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                if let (Some(verbosity), Some(handle)) = (handler.handle(event), &log_level) {
                    handle.set_verbosity(verbosity);
                }
            }
            Err(e) => warn!(error = %e, "ClusterPodPlacementConfig watch error, will retry"),
        }
    }
}

/// Mirror the global pull secret `namespace/name` into `store`
pub async fn watch_global_pull_secret(
    client: Client,
    namespace: String,
    name: String,
    store: Arc<PullSecretStore>,
) {
    let api: Api<Secret> = Api::namespaced(client, &namespace);
    let config = watcher::Config::default().fields(&format!("metadata.name={}", name));
    let stream = watcher::watcher(api, config).default_backoff();
    tokio::pin!(stream);

    let mut handler = PullSecretWatchHandler::new(store, name.clone());
    info!(%namespace, %name, "Watching global pull secret");

    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => handler.handle(event),
            Err(e) => warn!(%namespace, %name, error = %e, "Pull secret watch error, will retry"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use multiarch_common::crd::{
        ArchitectureWeight, ClusterPodPlacementConfigSpec, NodeAffinityScoringSpec, PluginsSpec,
    };
    use std::collections::BTreeMap;

    fn config(name: &str, weight: i32, verbosity: LogVerbosity) -> ClusterPodPlacementConfig {
        let mut config = ClusterPodPlacementConfig::new(
            name,
            ClusterPodPlacementConfigSpec {
                log_verbosity: verbosity,
                plugins: Some(PluginsSpec {
                    node_affinity_scoring: Some(NodeAffinityScoringSpec {
                        enabled: true,
                        platforms: vec![ArchitectureWeight {
                            architecture: "arm64".to_string(),
                            weight,
                        }],
                    }),
                }),
            },
        );
        config.metadata.resource_version = Some("1".to_string());
        config
    }

    fn secret(name: &str, payload: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("openshift-config".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                ".dockerconfigjson".to_string(),
                ByteString(payload.as_bytes().to_vec()),
            )])),
            type_: Some("kubernetes.io/dockerconfigjson".to_string()),
            ..Default::default()
        }
    }

    const AUTHS: &str = r#"{"auths":{"registry.example.com":{"auth":"dXNlcjpwYXNz"}}}"#;

    #[test]
    fn story_config_lifecycle() {
        let store = Arc::new(ConfigStore::new());
        let mut handler = ConfigWatchHandler::new(Arc::clone(&store));

        // Valid singleton activates scoring and verbosity
        let verbosity = handler.handle(Event::Apply(config("cluster", 50, LogVerbosity::Debug)));
        assert_eq!(verbosity, Some(LogVerbosity::Debug));
        assert!(store.scoring().is_enabled());

        // Invalid update keeps the previous config
        assert_eq!(
            handler.handle(Event::Apply(config("cluster", 0, LogVerbosity::Trace))),
            None
        );
        assert!(store.scoring().is_enabled());

        // Other names never touch the store
        handler.handle(Event::Delete(config("other", 50, LogVerbosity::Normal)));
        assert!(store.get().is_some());

        // Delete disables plugins and resets verbosity
        let verbosity = handler.handle(Event::Delete(config("cluster", 50, LogVerbosity::Debug)));
        assert_eq!(verbosity, Some(LogVerbosity::Normal));
        assert!(!store.scoring().is_enabled());
    }

    #[test]
    fn config_missing_from_relist_is_removed() {
        let store = Arc::new(ConfigStore::new());
        let mut handler = ConfigWatchHandler::new(Arc::clone(&store));
        handler.handle(Event::Apply(config("cluster", 50, LogVerbosity::Normal)));

        handler.handle(Event::Init);
        assert_eq!(handler.handle(Event::InitDone), Some(LogVerbosity::Normal));
        assert!(store.get().is_none());
    }

    #[test]
    fn config_present_in_relist_is_kept() {
        let store = Arc::new(ConfigStore::new());
        let mut handler = ConfigWatchHandler::new(Arc::clone(&store));

        handler.handle(Event::Init);
        handler.handle(Event::InitApply(config("cluster", 50, LogVerbosity::Normal)));
        handler.handle(Event::InitDone);
        assert!(store.scoring().is_enabled());

        // A second relist that still contains it changes nothing
        handler.handle(Event::Init);
        handler.handle(Event::InitApply(config("cluster", 50, LogVerbosity::Normal)));
        assert_eq!(handler.handle(Event::InitDone), None);
        assert!(store.get().is_some());
    }

    #[test]
    fn story_pull_secret_lifecycle() {
        let store = Arc::new(PullSecretStore::new());
        let mut handler = PullSecretWatchHandler::new(Arc::clone(&store), "pull-secret");

        handler.handle(Event::Apply(secret("pull-secret", AUTHS)));
        assert_eq!(store.get().as_deref(), Some(&AUTHS.as_bytes().to_vec()));

        // Unrelated secret is ignored
        handler.handle(Event::Delete(secret("other", AUTHS)));
        assert!(store.get().is_some());

        // Garbage clears rather than keeping stale credentials
        handler.handle(Event::Apply(secret("pull-secret", "not json")));
        assert!(store.get().is_none());

        handler.handle(Event::Apply(secret("pull-secret", AUTHS)));
        handler.handle(Event::Delete(secret("pull-secret", AUTHS)));
        assert!(store.get().is_none());
    }

    #[test]
    fn pull_secret_missing_from_relist_is_cleared() {
        let store = Arc::new(PullSecretStore::new());
        let mut handler = PullSecretWatchHandler::new(Arc::clone(&store), "pull-secret");
        handler.handle(Event::InitApply(secret("pull-secret", AUTHS)));

        handler.handle(Event::Init);
        handler.handle(Event::InitDone);
        assert!(store.get().is_none());
    }
}
