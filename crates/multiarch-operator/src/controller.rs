//! Pod controller
//!
//! Watches pods carrying the scheduling gate, works out which architectures
//! all of their images support, writes the matching node affinity and lifts
//! the gate. Image inspection failures are recorded on the pod and retried
//! with backoff; after [`MAX_RETRY_COUNT`] failures the gate is lifted
//! without a required architecture constraint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use multiarch_common::crd::NodeAffinityScoring;
use multiarch_common::events::{actions, reasons, EventPublisher, NoopEventPublisher};
use multiarch_common::labels::{
    annotation, arch_label, remove_annotation, remove_label, set_annotation, set_label,
    RetryCount, AFFINITY_NOT_SET, IMAGE_INSPECT_ERROR_ANNOTATION, IMAGE_INSPECT_ERROR_COUNT_LABEL,
    IMAGE_INSPECT_ERROR_LABEL, IMAGE_INSPECT_LAST_ATTEMPT_ANNOTATION, MARKER_VALUE,
    MAX_RETRY_COUNT, MULTI_ARCH_LABEL, NODE_AFFINITY_LABEL, NO_SUPPORTED_ARCH_LABEL,
    SCHEDULING_GATE_LABEL, SCHEDULING_GATE_REMOVED, SINGLE_ARCH_LABEL,
};
use multiarch_common::metrics::{self, ResolveTimer, UngateOutcome};
use multiarch_common::store::{extract_auth_payload, ConfigStore, PullSecretStore};
use multiarch_common::{Error, OPERATOR_NAME};
use multiarch_image::{pod_images, ArchitectureResolver, ArchitectureSet};

use crate::affinity::{apply_preferred, apply_required, build_requirement};
use crate::gate::{has_gate, remove_gate, should_ignore, GateSettings, IgnoreReason};

/// Default bound on one pod's architecture resolution
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Base delay between inspection retries, doubled per failure
const RETRY_BASE_DELAY_SECS: u64 = 5;
/// Cap on the inspection retry delay
const RETRY_MAX_DELAY_SECS: u64 = 120;
/// Requeue delay after a reconcile error
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Pod and Secret access needed by the controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodClient: Send + Sync {
    /// Write the full pod back; fails on a stale resourceVersion
    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, Error>;

    /// Get a Secret, returning None if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;
}

/// [`PodClient`] backed by the API server
pub struct KubePodClient {
    client: Client,
}

impl KubePodClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodClient for KubePodClient {
    async fn replace_pod(&self, pod: &Pod) -> Result<Pod, Error> {
        let namespace = pod.namespace().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let params = PostParams {
            field_manager: Some(OPERATOR_NAME.to_string()),
            ..Default::default()
        };
        Ok(api.replace(&pod.name_any(), &params, pod).await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// Shared state for the pod controller
pub struct Context {
    /// Pod and Secret access
    pub pods: Arc<dyn PodClient>,
    /// Architecture resolver over the shared image cache
    pub resolver: ArchitectureResolver,
    /// Active ClusterPodPlacementConfig
    pub config: Arc<ConfigStore>,
    /// Cluster-wide pull secret
    pub pull_secret: Arc<PullSecretStore>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Gate decision settings, re-checked on every reconcile
    pub settings: GateSettings,
    /// Bound on one resolution attempt
    pub resolve_timeout: Duration,
}

impl Context {
    /// Start building a context
    pub fn builder(pods: Arc<dyn PodClient>, resolver: ArchitectureResolver) -> ContextBuilder {
        ContextBuilder {
            pods,
            resolver,
            config: None,
            pull_secret: None,
            events: None,
            settings: GateSettings::default(),
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    pods: Arc<dyn PodClient>,
    resolver: ArchitectureResolver,
    config: Option<Arc<ConfigStore>>,
    pull_secret: Option<Arc<PullSecretStore>>,
    events: Option<Arc<dyn EventPublisher>>,
    settings: GateSettings,
    resolve_timeout: Duration,
}

impl ContextBuilder {
    /// Share a config store with the webhook
    pub fn config(mut self, config: Arc<ConfigStore>) -> Self {
        self.config = Some(config);
        self
    }

    /// Share the global pull secret store
    pub fn pull_secret(mut self, store: Arc<PullSecretStore>) -> Self {
        self.pull_secret = Some(store);
        self
    }

    /// Publish events through `events`
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the gate settings
    pub fn settings(mut self, settings: GateSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Override the resolve timeout
    pub fn resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    /// Build the context
    pub fn build(self) -> Context {
        Context {
            pods: self.pods,
            resolver: self.resolver,
            config: self.config.unwrap_or_default(),
            pull_secret: self.pull_secret.unwrap_or_default(),
            events: self.events.unwrap_or_else(|| Arc::new(NoopEventPublisher)),
            settings: self.settings,
            resolve_timeout: self.resolve_timeout,
        }
    }
}

/// Reconcile a gated pod
///
/// The pod is written with a plain replace so a concurrent edit surfaces as
/// a conflict and the next reconcile sees the fresh object.
#[instrument(skip(pod, ctx), fields(pod = %pod.name_any(), namespace = %pod.namespace().unwrap_or_default()))]
pub async fn reconcile(pod: Arc<Pod>, ctx: Arc<Context>) -> Result<Action, Error> {
    if !has_gate(&pod) || pod.metadata.deletion_timestamp.is_some() {
        debug!("pod not gated, nothing to do");
        return Ok(Action::await_change());
    }

    let scoring = ctx.config.scoring();
    let mut updated = (*pod).clone();

    if let Some(reason) = should_ignore(&pod, &ctx.settings, &scoring) {
        info!(reason = reason.as_str(), "pod no longer needs placement, removing gate");
        if reason == IgnoreReason::ArchitectureConstrained {
            set_label(&mut updated.metadata, NODE_AFFINITY_LABEL, AFFINITY_NOT_SET);
        }
        ungate(&mut updated);
        ctx.pods.replace_pod(&updated).await?;
        metrics::record_ungated(UngateOutcome::Ignored, gated_seconds(&pod));
        publish(&ctx, &pod, EventType::Normal, reasons::SCHEDULING_GATE_REMOVED, None).await;
        return Ok(Action::await_change());
    }

    let failures = RetryCount::from_meta(&pod.metadata);
    if let Some(wait) = backoff_remaining(&pod, failures) {
        debug!(failures = %failures, wait_secs = wait.as_secs(), "waiting before next inspection");
        return Ok(Action::requeue(wait));
    }

    let images = pod_images(&pod);
    let timer = ResolveTimer::start();
    let attempt = async {
        let secrets = collect_pull_secrets(&pod, &ctx).await;
        ctx.resolver.intersect(&images, &secrets).await
    };

    // An elapsed deadline counts as a failed inspection
    let resolved = match tokio::time::timeout(ctx.resolve_timeout, attempt).await {
        Ok(resolved) => resolved,
        Err(_) => {
            warn!(timeout = ?ctx.resolve_timeout, "architecture resolution timed out");
            Err(Error::timeout("image architecture resolution", ctx.resolve_timeout))
        }
    };

    match resolved {
        Ok(architectures) => {
            timer.success();
            on_resolved(&ctx, &pod, updated, &architectures, &scoring).await
        }
        Err(e) => {
            timer.error();
            on_inspection_failed(&ctx, &pod, updated, failures.incremented(), &e, &scoring).await
        }
    }
}

async fn on_resolved(
    ctx: &Context,
    pod: &Pod,
    mut updated: Pod,
    architectures: &ArchitectureSet,
    scoring: &NodeAffinityScoring,
) -> Result<Action, Error> {
    let requirement = build_requirement(architectures);
    let required_set = apply_required(&mut updated, &requirement);
    apply_preferred(&mut updated, scoring);
    set_resolved_labels(&mut updated, architectures);
    ungate(&mut updated);

    ctx.pods.replace_pod(&updated).await?;
    info!(architectures = %architectures, required_set, "placement resolved, gate removed");
    metrics::record_ungated(UngateOutcome::Resolved, gated_seconds(pod));

    if architectures.is_empty() {
        publish(
            ctx,
            pod,
            EventType::Warning,
            reasons::NO_SUPPORTED_ARCHITECTURES,
            Some("the images of this pod share no architecture".to_string()),
        )
        .await;
    } else if required_set {
        publish(
            ctx,
            pod,
            EventType::Normal,
            reasons::AFFINITY_SET,
            Some(format!("node affinity set to {}", architectures)),
        )
        .await;
    }
    publish(ctx, pod, EventType::Normal, reasons::SCHEDULING_GATE_REMOVED, None).await;
    Ok(Action::await_change())
}

async fn on_inspection_failed(
    ctx: &Context,
    pod: &Pod,
    mut updated: Pod,
    failures: RetryCount,
    error: &Error,
    scoring: &NodeAffinityScoring,
) -> Result<Action, Error> {
    warn!(failures = %failures, error = %error, "image inspection failed");

    let meta = &mut updated.metadata;
    set_label(meta, IMAGE_INSPECT_ERROR_COUNT_LABEL, &failures.to_string());
    set_label(meta, IMAGE_INSPECT_ERROR_LABEL, MARKER_VALUE);
    set_annotation(meta, IMAGE_INSPECT_ERROR_ANNOTATION, &error.to_string());
    set_annotation(
        meta,
        IMAGE_INSPECT_LAST_ATTEMPT_ANNOTATION,
        &chrono::Utc::now().timestamp().to_string(),
    );

    let exhausted = failures.is_exhausted();
    if exhausted {
        apply_preferred(&mut updated, scoring);
        set_label(&mut updated.metadata, NODE_AFFINITY_LABEL, AFFINITY_NOT_SET);
        ungate(&mut updated);
    }

    ctx.pods.replace_pod(&updated).await?;
    publish(
        ctx,
        pod,
        EventType::Warning,
        reasons::IMAGE_INSPECTION_ERROR,
        Some(error.to_string()),
    )
    .await;

    if exhausted {
        info!(
            max = %MAX_RETRY_COUNT,
            "inspection retries exhausted, gate removed without architecture constraint"
        );
        metrics::record_ungated(UngateOutcome::Exhausted, gated_seconds(pod));
        publish(ctx, pod, EventType::Normal, reasons::SCHEDULING_GATE_REMOVED, None).await;
        return Ok(Action::await_change());
    }
    Ok(Action::requeue(retry_delay(failures)))
}

/// Handle reconcile errors
pub fn error_policy(pod: Arc<Pod>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        retryable = error.is_retryable(),
        pod = %pod.name_any(),
        "reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}

/// Remove the gate and record it on the pod
fn ungate(pod: &mut Pod) {
    remove_gate(pod);
    set_label(&mut pod.metadata, SCHEDULING_GATE_LABEL, SCHEDULING_GATE_REMOVED);
}

/// Architecture summary labels plus clearing of the last inspection error
///
/// The error counter is kept as history.
pub fn set_resolved_labels(pod: &mut Pod, architectures: &ArchitectureSet) {
    let meta = &mut pod.metadata;
    let summary = match architectures.len() {
        0 => NO_SUPPORTED_ARCH_LABEL,
        1 => SINGLE_ARCH_LABEL,
        _ => MULTI_ARCH_LABEL,
    };
    set_label(meta, summary, MARKER_VALUE);
    for arch in architectures.iter() {
        set_label(meta, &arch_label(arch), MARKER_VALUE);
    }
    remove_label(meta, IMAGE_INSPECT_ERROR_LABEL);
    remove_annotation(meta, IMAGE_INSPECT_ERROR_ANNOTATION);
    remove_annotation(meta, IMAGE_INSPECT_LAST_ATTEMPT_ANNOTATION);
}

/// Delay before the attempt following `failures` failed ones
fn retry_delay(failures: RetryCount) -> Duration {
    let exponent = failures.0.saturating_sub(1);
    let secs = std::cmp::min(
        RETRY_BASE_DELAY_SECS.saturating_mul(2u64.saturating_pow(exponent)),
        RETRY_MAX_DELAY_SECS,
    );
    Duration::from_secs(secs)
}

/// Time left before the next inspection may run, if any
///
/// Writing the failure onto the pod wakes the controller immediately, so the
/// backoff is enforced against the recorded attempt time.
fn backoff_remaining(pod: &Pod, failures: RetryCount) -> Option<Duration> {
    if failures.0 == 0 {
        return None;
    }
    let last: i64 = annotation(&pod.metadata, IMAGE_INSPECT_LAST_ATTEMPT_ANNOTATION)?
        .parse()
        .ok()?;
    let elapsed = u64::try_from(chrono::Utc::now().timestamp() - last).unwrap_or(0);
    let delay = retry_delay(failures).as_secs();
    (elapsed < delay).then(|| Duration::from_secs(delay - elapsed))
}

fn gated_seconds(pod: &Pod) -> Option<f64> {
    let created = pod.metadata.creation_timestamp.as_ref()?;
    let elapsed = chrono::Utc::now().signed_duration_since(created.0);
    Some(elapsed.num_milliseconds().max(0) as f64 / 1000.0)
}

/// Auth documents for the pod: the global pull secret, then the pod's own
///
/// Later documents win, so the pod's secrets override the global one per
/// registry. Missing or malformed secrets are skipped.
async fn collect_pull_secrets(pod: &Pod, ctx: &Context) -> Vec<Vec<u8>> {
    let mut secrets = Vec::new();
    if let Some(global) = ctx.pull_secret.get() {
        secrets.push(global.as_ref().clone());
    }

    let namespace = pod.namespace().unwrap_or_default();
    let references = pod
        .spec
        .as_ref()
        .and_then(|s| s.image_pull_secrets.as_ref())
        .into_iter()
        .flatten();
    for reference in references {
        match ctx.pods.get_secret(&namespace, &reference.name).await {
            Ok(Some(secret)) => match extract_auth_payload(&secret) {
                Ok(payload) => secrets.push(payload),
                Err(e) => warn!(secret = %reference.name, error = %e, "ignoring unusable pull secret"),
            },
            Ok(None) => debug!(secret = %reference.name, "pull secret not found"),
            Err(e) => warn!(secret = %reference.name, error = %e, "failed to read pull secret"),
        }
    }
    secrets
}

async fn publish(
    ctx: &Context,
    pod: &Pod,
    type_: EventType,
    reason: &str,
    note: Option<String>,
) {
    ctx.events
        .publish(&pod.object_ref(&()), type_, reason, actions::RECONCILE, note)
        .await;
}
