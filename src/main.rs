use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::config::KubeConfigOptions;
use mesh_federation::config::{
    parse_label, Settings, DEFAULT_AUTO_EXPOSE_LABEL, DEFAULT_EXPOSE_AS_LABEL,
    DEFAULT_FED_CONFIG_LABEL, DEFAULT_PROXY_IMAGE,
};
use mesh_federation::controller::{self, Context};
use mesh_federation::crd::{MeshFedConfig, ServiceBinding, ServiceExposition};
use mesh_federation::discovery::{self, DiscoveryClient, DiscoveryServer, Supervisor, UpdateNotifier};
use mesh_federation::store::KubeStore;
use mesh_federation::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the federation controller
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Show federation objects in the cluster
    Info(InfoArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace discovered ServiceBindings are written to
    #[arg(long, env = "MESH_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Kubeconfig context to use instead of the in-cluster or current one
    #[arg(long, env = "KUBE_CONTEXT")]
    context: Option<String>,

    /// Listen address of the discovery server; disabled when unset
    #[arg(long, env = "GRPC_SERVER_ADDR")]
    grpc_server_addr: Option<SocketAddr>,

    /// Services carrying this `key:value` label are dialed as discovery peers
    #[arg(long, env = "DISCOVERY_LABEL")]
    discovery_label: Option<String>,

    /// Label (value "true") that exposes a Service under the default config
    #[arg(long, env = "AUTO_EXPOSE_LABEL", default_value = DEFAULT_AUTO_EXPOSE_LABEL)]
    auto_expose_label: String,

    /// Label whose value `fedConfig.alias` or `alias` exposes a Service
    #[arg(long, env = "EXPOSE_AS_LABEL", default_value = DEFAULT_EXPOSE_AS_LABEL)]
    expose_as_label: String,

    /// Label key generated ServiceExpositions select their MeshFedConfig by
    #[arg(long, env = "FED_CONFIG_LABEL", default_value = DEFAULT_FED_CONFIG_LABEL)]
    fed_config_label: String,

    #[arg(long, env = "DEFAULT_FED_CONFIG", default_value = "default")]
    default_fed_config: String,

    /// Name announced to partner meshes
    #[arg(long, env = "MESH_NAME", default_value = "mesh")]
    mesh_name: String,

    /// Image for gateway deployments the controller creates
    #[arg(long, env = "PROXY_IMAGE", default_value = DEFAULT_PROXY_IMAGE)]
    proxy_image: String,

    /// Listen address of the /health and /metrics endpoint
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Only reconcile while holding the leader lease
    #[arg(long, env = "ENABLE_LEADER_ELECTION")]
    enable_leader_election: bool,
}

impl RunArgs {
    fn settings(&self) -> Result<Settings, Error> {
        let discovery_label = self
            .discovery_label
            .as_deref()
            .map(parse_label)
            .transpose()?;

        Ok(Settings {
            namespace: self.namespace.clone(),
            mesh_name: self.mesh_name.clone(),
            grpc_server_addr: self.grpc_server_addr,
            discovery_label,
            auto_expose_label: self.auto_expose_label.clone(),
            expose_as_label: self.expose_as_label.clone(),
            fed_config_label: self.fed_config_label.clone(),
            default_fed_config: self.default_fed_config.clone(),
            proxy_image: self.proxy_image.clone(),
        })
    }
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Limit the listing to one namespace
    #[arg(long, env = "MESH_NAMESPACE")]
    namespace: Option<String>,

    #[arg(long, env = "KUBE_CONTEXT")]
    context: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("mesh-federation v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn kube_client(context: Option<String>) -> Result<kube::Client, Error> {
    let config = match context {
        Some(context) => kube::Config::from_kubeconfig(&KubeConfigOptions {
            context: Some(context),
            ..Default::default()
        })
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to load kubeconfig: {}", e)))?,
        None => kube::Config::infer()
            .await
            .map_err(|e| Error::ConfigError(format!("Failed to infer kube config: {}", e)))?,
    };
    kube::Client::try_from(config).map_err(Error::KubeError)
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube_client(args.context).await?;

    let (configs, expositions, bindings): (
        Api<MeshFedConfig>,
        Api<ServiceExposition>,
        Api<ServiceBinding>,
    ) = match args.namespace.as_deref() {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client, ns),
        ),
        None => (
            Api::all(client.clone()),
            Api::all(client.clone()),
            Api::all(client),
        ),
    };

    let configs = configs.list(&Default::default()).await?;
    let expositions = expositions.list(&Default::default()).await?;
    let bindings = bindings.list(&Default::default()).await?;
    let ready = expositions.items.iter().filter(|se| se.is_ready()).count();

    println!("MeshFedConfigs:     {}", configs.items.len());
    println!(
        "ServiceExpositions: {} ({} ready)",
        expositions.items.len(),
        ready
    );
    println!("ServiceBindings:    {}", bindings.items.len());
    Ok(())
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    // Initialize tracing with OpenTelemetry
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let fmt_layer = fmt::layer().with_target(true);

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    // Only enable OTEL if an endpoint is provided
    let otel_enabled = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok();

    if otel_enabled {
        match mesh_federation::telemetry::init_telemetry(&registry) {
            Ok(otel_layer) => {
                registry.with(otel_layer).init();
                info!("OpenTelemetry tracing initialized");
            }
            Err(e) => {
                registry.init();
                warn!("OpenTelemetry tracing disabled: {}", e);
            }
        }
    } else {
        registry.init();
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }

    info!("Starting mesh-federation v{}", env!("CARGO_PKG_VERSION"));

    let settings = Arc::new(args.settings()?);
    let client = kube_client(args.context.clone()).await?;
    info!("Connected to Kubernetes cluster");

    let cancel = CancellationToken::new();
    let is_leader = Arc::new(AtomicBool::new(!args.enable_leader_election));
    let leadership_lost = CancellationToken::new();

    if args.enable_leader_election {
        let lease_namespace =
            std::env::var("POD_NAMESPACE").unwrap_or_else(|_| args.namespace.clone());
        let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown-host".to_string())
        });
        info!("Leader election using holder ID: {}", holder_identity);

        let leases: Api<Lease> = Api::namespaced(client.clone(), &lease_namespace);
        let is_leader_bg = Arc::clone(&is_leader);
        let lost = leadership_lost.clone();
        tokio::spawn(async move {
            run_leader_election(leases, lease_namespace, holder_identity, is_leader_bg, lost).await;
        });

        while !is_leader.load(Ordering::Relaxed) {
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    #[cfg(feature = "rest-api")]
    {
        let api_state = Arc::new(mesh_federation::rest_api::ApiState {
            mesh_name: settings.mesh_name.clone(),
            is_leader: Arc::clone(&is_leader),
        });
        let metrics_addr = args.metrics_addr;
        let metrics_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) =
                mesh_federation::rest_api::run_server(metrics_addr, api_state, metrics_cancel).await
            {
                error!("Metrics server error: {:?}", e);
            }
        });
    }

    let store = Arc::new(KubeStore::new(client.clone()));
    let (updates, update_rx) = UpdateNotifier::channel();
    let (peers, peer_rx) = discovery::peer_channel();

    let server = match settings.grpc_server_addr {
        Some(addr) => {
            let server = DiscoveryServer::new(store.clone(), settings.mesh_name.clone());
            let server_cancel = cancel.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = server.serve(addr, update_rx, server_cancel).await {
                    error!("Discovery server error: {:?}", e);
                }
            }))
        }
        None => {
            info!("Discovery server disabled (--grpc-server-addr not set)");
            None
        }
    };

    let sessions = DiscoveryClient::new(
        store.clone(),
        settings.namespace.clone(),
        settings.mesh_name.clone(),
    );
    let supervisor = tokio::spawn(Supervisor::new(sessions).run(peer_rx, cancel.clone()));

    let ctx = Arc::new(Context::new(store, settings, updates, peers));

    // Run the controllers until shutdown or lost leadership
    let result = tokio::select! {
        result = controller::run_controllers(ctx, client) => result,
        _ = leadership_lost.cancelled() => {
            Err(Error::ConfigError("leader lease lost".to_string()))
        }
    };

    cancel.cancel();
    if let Err(e) = supervisor.await {
        warn!("Discovery supervisor ended abnormally: {}", e);
    }
    if let Some(server) = server {
        if let Err(e) = server.await {
            warn!("Discovery server ended abnormally: {}", e);
        }
    }

    // Flush any remaining traces
    mesh_federation::telemetry::shutdown_telemetry();

    result
}

const LEASE_NAME: &str = "mesh-federation-leader";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);
const RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// Acquire and renew the lease forever; fires `lost` when a held lease is lost
async fn run_leader_election(
    leases: Api<Lease>,
    namespace: String,
    identity: String,
    is_leader: Arc<AtomicBool>,
    lost: CancellationToken,
) {
    loop {
        let was_leader = is_leader.load(Ordering::Relaxed);
        match try_acquire_or_renew(&leases, &namespace, &identity).await {
            Ok(true) => {
                if !was_leader {
                    info!("Acquired leadership for lease {}", LEASE_NAME);
                }
                is_leader.store(true, Ordering::Relaxed);
                tokio::time::sleep(RENEW_INTERVAL).await;
                continue;
            }
            Ok(false) => {
                if was_leader {
                    warn!("Lost leadership for lease {}", LEASE_NAME);
                }
            }
            Err(e) => {
                warn!("Leader election error: {:?}", e);
            }
        }

        is_leader.store(false, Ordering::Relaxed);
        if was_leader {
            lost.cancel();
            return;
        }
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    match leases.get(LEASE_NAME).await {
        Ok(existing) => {
            let spec = existing.spec.as_ref();
            let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

            let resource_version = existing.metadata.resource_version.as_deref();

            if current_holder == Some(identity) {
                let patch = lease_patch(identity, now, resource_version, false);
                return patch_lease(leases, &patch).await;
            }

            let expired = spec
                .and_then(|s| s.renew_time.as_ref())
                .map(|renew| {
                    let duration = spec
                        .and_then(|s| s.lease_duration_seconds)
                        .unwrap_or(LEASE_DURATION_SECS);
                    let expiry = renew.0 + chrono::Duration::seconds(i64::from(duration));
                    now > expiry
                })
                .unwrap_or(true);

            if !expired {
                return Ok(false);
            }

            info!(
                "Lease held by {:?} has expired, taking over",
                current_holder
            );
            let patch = lease_patch(identity, now, resource_version, true);
            patch_lease(leases, &patch).await
        }
        Err(kube::Error::Api(err)) if err.code == 404 => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(LEASE_NAME.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(LEASE_DURATION_SECS),
                    ..Default::default()
                }),
            };
            match leases.create(&PostParams::default(), &lease).await {
                Ok(_) => {
                    info!("Created lease {} with holder {}", LEASE_NAME, identity);
                    Ok(true)
                }
                // another candidate created it first
                Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

/// Merge patch renewing or taking over the lease
///
/// The resource version read before deciding makes the API server reject
/// the write with a Conflict when another candidate wrote in between.
fn lease_patch(
    identity: &str,
    now: chrono::DateTime<Utc>,
    resource_version: Option<&str>,
    takeover: bool,
) -> serde_json::Value {
    let mut spec = serde_json::json!({
        "renewTime": MicroTime(now),
        "leaseDurationSeconds": LEASE_DURATION_SECS,
    });
    if takeover {
        spec["holderIdentity"] = serde_json::json!(identity);
        spec["acquireTime"] = serde_json::json!(MicroTime(now));
    }
    serde_json::json!({
        "metadata": { "resourceVersion": resource_version },
        "spec": spec,
    })
}

/// Apply a lease patch; losing the optimistic concurrency race is not an error
async fn patch_lease(leases: &Api<Lease>, patch: &serde_json::Value) -> Result<bool, kube::Error> {
    match leases
        .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(patch))
        .await
    {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(err)) if err.code == 409 => {
            debug!("Lease {} changed underneath us: {}", LEASE_NAME, err.message);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_takeover_patch_is_guarded_by_resource_version() {
        let now = Utc::now();
        let patch = lease_patch("operator-1", now, Some("4711"), true);
        assert_eq!(patch["metadata"]["resourceVersion"], "4711");
        assert_eq!(patch["spec"]["holderIdentity"], "operator-1");
        assert_eq!(patch["spec"]["leaseDurationSeconds"], LEASE_DURATION_SECS);
        assert!(patch["spec"]["acquireTime"].is_string());
    }

    #[test]
    fn test_renew_patch_keeps_holder() {
        let patch = lease_patch("operator-1", Utc::now(), Some("12"), false);
        assert_eq!(patch["metadata"]["resourceVersion"], "12");
        assert!(patch["spec"].get("holderIdentity").is_none());
        assert!(patch["spec"].get("acquireTime").is_none());
        assert!(patch["spec"]["renewTime"].is_string());
    }
}
