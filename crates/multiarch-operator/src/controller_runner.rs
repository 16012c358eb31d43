//! Controller runner - builds the long-running futures of the operator
//!
//! Each `build_*` function returns boxed futures that the binary composes,
//! which keeps construction separate from process wiring.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use multiarch_common::labels::GATED_POD_SELECTOR;
use multiarch_common::store::{ConfigStore, PullSecretStore};
use multiarch_common::telemetry::LogLevelHandle;

use crate::controller::{error_policy, reconcile, Context};
use crate::watchers::{watch_global_pull_secret, watch_placement_config};

/// Boxed background future
pub type BackgroundFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Default number of pods reconciled concurrently
pub const DEFAULT_RECONCILE_WORKERS: u16 = 16;

/// Build the gated-pod controller
///
/// Only pods carrying the `gated` label are watched, so the informer cache
/// stays proportional to the pods currently waiting on us.
pub fn build_pod_controller(client: Client, ctx: Arc<Context>, workers: u16) -> BackgroundFuture {
    let pods: Api<Pod> = Api::all(client);

    tracing::info!(workers, "- Pod placement controller");

    Box::pin(
        Controller::new(
            pods,
            WatcherConfig::default()
                .labels(GATED_POD_SELECTOR)
                .timeout(WATCH_TIMEOUT_SECS),
        )
        .with_config(ControllerConfig::default().concurrency(workers))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("Pod")),
    )
}

/// Global pull secret location
#[derive(Clone, Debug)]
pub struct GlobalPullSecret {
    /// Namespace holding the secret
    pub namespace: String,
    /// Secret name
    pub name: String,
}

/// Build the store watchers (placement config, optional global pull secret)
pub fn build_store_watchers(
    client: Client,
    config: Arc<ConfigStore>,
    pull_secret: Arc<PullSecretStore>,
    global_pull_secret: Option<GlobalPullSecret>,
    log_level: Option<LogLevelHandle>,
) -> Vec<BackgroundFuture> {
    tracing::info!("- ClusterPodPlacementConfig watcher");
    let mut futures: Vec<BackgroundFuture> = vec![Box::pin(watch_placement_config(
        client.clone(),
        config,
        log_level,
    ))];

    if let Some(secret) = global_pull_secret {
        tracing::info!(namespace = %secret.namespace, name = %secret.name, "- Global pull secret watcher");
        futures.push(Box::pin(watch_global_pull_secret(
            client,
            secret.namespace,
            secret.name,
            pull_secret,
        )));
    }

    futures
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
