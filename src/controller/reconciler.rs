//! kube-runtime wiring for the four controllers
//!
//! MeshFedConfig, ServiceExposition and ServiceBinding run the shared
//! lifecycle; native Services run the discovery and auto-expose reconciler.
//! The se/sb controllers also watch MeshFedConfigs and requeue every object
//! whose selector the changed config satisfies.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServiceAccount};
use kube::{
    api::Api,
    client::Client,
    runtime::{
        controller::{Action, Controller},
        reflector::ObjectRef,
        watcher::Config,
    },
    ResourceExt,
};
use tracing::{error, info, instrument, warn};

use super::lifecycle::{reconcile_object, Federated};
use super::selector::{dependents, SelectsConfig};
use super::service::reconcile_service;
use super::Context;
use crate::crd::{MeshFedConfig, ServiceBinding, ServiceExposition};
use crate::error::{Error, Result};
use crate::store::KubeStore;

const SERVICE_CONTROLLER: &str = "service";

/// Run all controllers until a shutdown signal arrives
pub async fn run_controllers(ctx: Arc<Context<KubeStore>>, client: Client) -> Result<()> {
    let configs: Api<MeshFedConfig> = Api::all(client.clone());

    // Verify the CRDs exist before starting watches that would spin on 404s
    match configs.list(&Default::default()).await {
        Ok(_) => info!("MeshFedConfig CRD is available"),
        Err(e) => {
            error!(
                "MeshFedConfig CRD not found. Please install the CRDs first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "federation CRDs not installed".to_string(),
            ));
        }
    }

    info!("Starting federation controllers");

    let mesh_fed_configs = Controller::new(configs, Config::default())
        // Gateway workloads are owned by their config
        .owns::<Service>(Api::all(client.clone()), Config::default())
        .owns::<Deployment>(Api::all(client.clone()), Config::default())
        .owns::<ServiceAccount>(Api::all(client.clone()), Config::default())
        .shutdown_on_signal()
        .run(reconcile::<MeshFedConfig>, error_policy::<MeshFedConfig>, ctx.clone())
        .for_each(|res| log_result(MeshFedConfig::CONTROLLER, res));

    let expositions = dependent_controller::<ServiceExposition>(&client)
        .shutdown_on_signal()
        .run(reconcile::<ServiceExposition>, error_policy::<ServiceExposition>, ctx.clone())
        .for_each(|res| log_result(ServiceExposition::CONTROLLER, res));

    let bindings = dependent_controller::<ServiceBinding>(&client)
        .shutdown_on_signal()
        .run(reconcile::<ServiceBinding>, error_policy::<ServiceBinding>, ctx.clone())
        .for_each(|res| log_result(ServiceBinding::CONTROLLER, res));

    let services = Controller::new(Api::<Service>::all(client.clone()), Config::default())
        .shutdown_on_signal()
        .run(reconcile_native_service, service_error_policy, ctx)
        .for_each(|res| log_result(SERVICE_CONTROLLER, res));

    futures::join!(mesh_fed_configs, expositions, bindings, services);
    info!("Federation controllers stopped");
    Ok(())
}

/// Controller for a kind that selects its MeshFedConfig by label
fn dependent_controller<K>(client: &Client) -> Controller<K>
where
    K: Federated + SelectsConfig,
{
    let controller = Controller::new(Api::<K>::all(client.clone()), Config::default());
    let cache = controller.store();

    controller.watches(
        Api::<MeshFedConfig>::all(client.clone()),
        Config::default(),
        move |mfc| {
            let state = cache.state();
            dependents(&mfc, state.iter().map(|obj| obj.as_ref()))
                .into_iter()
                .map(ObjectRef::from_obj)
                .collect::<Vec<_>>()
        },
    )
}

async fn log_result<T: Debug, E: Debug>(controller: &str, res: std::result::Result<T, E>) {
    match res {
        Ok(obj) => info!("Reconciled {}: {:?}", controller, obj),
        Err(e) => error!("Reconcile error in {}: {:?}", controller, e),
    }
}

/// Lifecycle pass for one federation object
#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile<K: Federated>(obj: Arc<K>, ctx: Arc<Context<KubeStore>>) -> Result<Action> {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    let started = Instant::now();

    let result = reconcile_object::<K, KubeStore>(&ctx, &namespace, &name).await;

    #[cfg(feature = "metrics")]
    {
        super::metrics::observe_reconcile_duration_seconds(
            K::CONTROLLER,
            started.elapsed().as_secs_f64(),
        );
        if let Ok(outcome) = &result {
            super::metrics::inc_reconcile_outcome(K::CONTROLLER, outcome.as_str());
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = started;

    let outcome = result?;
    info!(
        "{} {}/{}: {}",
        K::CONTROLLER,
        namespace,
        name,
        outcome.as_str()
    );
    Ok(outcome.action())
}

#[instrument(skip(svc, ctx), fields(name = %svc.name_any(), namespace = svc.namespace()))]
async fn reconcile_native_service(
    svc: Arc<Service>,
    ctx: Arc<Context<KubeStore>>,
) -> Result<Action> {
    let namespace = svc.namespace().unwrap_or_default();
    reconcile_service(&ctx, &namespace, &svc.name_any()).await?;
    Ok(Action::await_change())
}

fn requeue_after(error: &Error) -> Duration {
    // Use shorter retry for retriable errors
    if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    }
}

fn error_policy<K: Federated>(obj: Arc<K>, error: &Error, _ctx: Arc<Context<KubeStore>>) -> Action {
    warn!(
        "Reconciliation error for {} {}: {}",
        K::CONTROLLER,
        obj.name_any(),
        error
    );
    #[cfg(feature = "metrics")]
    super::metrics::inc_reconcile_error(K::CONTROLLER, error.kind());

    Action::requeue(requeue_after(error))
}

fn service_error_policy(svc: Arc<Service>, error: &Error, _ctx: Arc<Context<KubeStore>>) -> Action {
    warn!("Reconciliation error for Service {}: {}", svc.name_any(), error);
    #[cfg(feature = "metrics")]
    super::metrics::inc_reconcile_error(SERVICE_CONTROLLER, error.kind());

    Action::requeue(requeue_after(error))
}
