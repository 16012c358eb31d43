//! Multiarch placement operator - admission webhook and gated pod controller

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kube::{Client, CustomResourceExt};

use multiarch_common::crd::ClusterPodPlacementConfig;
use multiarch_common::events::{
    EventDispatcher, KubeEventPublisher, DEFAULT_EVENT_QUEUE, DEFAULT_EVENT_WORKERS,
};
use multiarch_common::store::{ConfigStore, PullSecretStore};
use multiarch_common::telemetry::{init_telemetry, TelemetryConfig};
use multiarch_common::{DEFAULT_OPERATOR_NAMESPACE, OPERATOR_NAME};
use multiarch_image::{
    ArchitectureResolver, ImageArchitectureCache, SkopeoInspector, DEFAULT_COMMAND_TIMEOUT,
    DEFAULT_SKOPEO_COMMAND,
};
use multiarch_operator::controller::{Context, KubePodClient};
use multiarch_operator::controller_runner::{
    build_pod_controller, build_store_watchers, BackgroundFuture, GlobalPullSecret,
    DEFAULT_RECONCILE_WORKERS,
};
use multiarch_operator::gate::GateSettings;
use multiarch_operator::webhook::{serve_webhook, WebhookServerConfig, WebhookState};

/// How long queued events get to drain on shutdown
const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Multiarch placement - pins pods to the CPU architectures their images support
#[derive(Parser, Debug)]
#[command(name = "multiarch-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    args: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run webhook, pod controller and store watchers (default mode)
    Controller,
}

#[derive(Args, Debug)]
struct ControllerArgs {
    /// Namespace the operator runs in; its pods are never gated
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = DEFAULT_OPERATOR_NAMESPACE)]
    operator_namespace: String,

    /// Namespace prefixes whose pods are never gated
    #[arg(
        long,
        env = "RESERVED_NAMESPACE_PREFIXES",
        value_delimiter = ',',
        default_values_t = GateSettings::default().reserved_prefixes
    )]
    reserved_namespace_prefixes: Vec<String>,

    /// Namespace of the cluster-wide pull secret
    #[arg(long, env = "GLOBAL_PULL_SECRET_NAMESPACE", requires = "global_pull_secret_name")]
    global_pull_secret_namespace: Option<String>,

    /// Name of the cluster-wide pull secret
    #[arg(long, env = "GLOBAL_PULL_SECRET_NAME", requires = "global_pull_secret_namespace")]
    global_pull_secret_name: Option<String>,

    /// Webhook listen address
    #[arg(long, env = "WEBHOOK_ADDR", default_value = "0.0.0.0:9443")]
    webhook_addr: SocketAddr,

    /// Webhook TLS certificate (PEM)
    #[arg(long, env = "WEBHOOK_TLS_CERT", default_value = "/etc/webhook/certs/tls.crt")]
    tls_cert: PathBuf,

    /// Webhook TLS private key (PEM)
    #[arg(long, env = "WEBHOOK_TLS_KEY", default_value = "/etc/webhook/certs/tls.key")]
    tls_key: PathBuf,

    /// Pods reconciled concurrently
    #[arg(long, env = "RECONCILE_WORKERS", default_value_t = DEFAULT_RECONCILE_WORKERS)]
    workers: u16,

    /// Upper bound in seconds on resolving one pod's images
    #[arg(long, env = "RESOLVE_TIMEOUT_SECS", default_value_t = 60)]
    resolve_timeout_secs: u64,

    /// Event publishing workers
    #[arg(long, env = "EVENT_WORKERS", default_value_t = DEFAULT_EVENT_WORKERS)]
    event_workers: usize,

    /// Image inspection command
    #[arg(long, env = "INSPECTOR_COMMAND", default_value = DEFAULT_SKOPEO_COMMAND)]
    inspector_command: String,

    /// Upper bound in seconds on a single inspection command
    #[arg(
        long,
        env = "INSPECTOR_TIMEOUT_SECS",
        default_value_t = DEFAULT_COMMAND_TIMEOUT.as_secs()
    )]
    inspector_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install rustls crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&ClusterPodPlacementConfig::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.args).await,
    }
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let telemetry = init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    tracing::info!(
        namespace = %args.operator_namespace,
        workers = args.workers,
        "Starting multiarch placement operator"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let settings = GateSettings {
        operator_namespace: args.operator_namespace.clone(),
        reserved_prefixes: args.reserved_namespace_prefixes.clone(),
    };
    let config = Arc::new(ConfigStore::new());
    let pull_secret = Arc::new(PullSecretStore::new());

    let inspector = Arc::new(SkopeoInspector::new(
        args.inspector_command.clone(),
        Duration::from_secs(args.inspector_timeout_secs),
    ));
    let resolver = ArchitectureResolver::new(Arc::new(ImageArchitectureCache::new(inspector)));
    let publisher = Arc::new(KubeEventPublisher::new(client.clone(), OPERATOR_NAME));
    let dispatcher = Arc::new(EventDispatcher::start(
        publisher.clone(),
        args.event_workers,
        DEFAULT_EVENT_QUEUE,
    ));

    let ctx = Arc::new(
        Context::builder(Arc::new(KubePodClient::new(client.clone())), resolver)
            .config(config.clone())
            .pull_secret(pull_secret.clone())
            .events(publisher)
            .settings(settings.clone())
            .resolve_timeout(Duration::from_secs(args.resolve_timeout_secs))
            .build(),
    );

    let global_pull_secret = match (
        args.global_pull_secret_namespace,
        args.global_pull_secret_name,
    ) {
        (Some(namespace), Some(name)) => Some(GlobalPullSecret { namespace, name }),
        _ => None,
    };

    tracing::info!("Starting background tasks:");
    let watchers: Vec<BackgroundFuture> = build_store_watchers(
        client.clone(),
        config.clone(),
        pull_secret,
        global_pull_secret,
        Some(telemetry.log_level()),
    );
    let controller = build_pod_controller(client, ctx, args.workers);

    let webhook_state = Arc::new(WebhookState {
        config,
        settings,
        events: dispatcher.clone(),
    });
    let webhook = serve_webhook(
        WebhookServerConfig {
            addr: args.webhook_addr,
            cert_path: args.tls_cert,
            key_path: args.tls_key,
        },
        webhook_state,
    );

    // The controller owns signal handling; the others run until it stops
    let result = tokio::select! {
        _ = controller => {
            tracing::info!("Pod controller stopped");
            Ok(())
        }
        _ = futures::future::join_all(watchers) => {
            Err(anyhow::anyhow!("Store watchers exited unexpectedly"))
        }
        result = webhook => {
            result.map_err(|e| anyhow::anyhow!("Admission webhook failed: {}", e))
        }
    };

    dispatcher.shutdown(EVENT_DRAIN_TIMEOUT).await;
    tracing::info!("Multiarch placement operator shut down");
    telemetry.shutdown();
    result
}
