//! Native Service reconciler
//!
//! Services are never modified. A Service carrying the discovery label is
//! published to the discovery supervisor as a peer. A Service carrying the
//! auto-expose or expose-as label gets a ServiceExposition of the same name,
//! owned by the Service.

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::Context;
use crate::crd::{Labels, ServiceExposition, ServiceExpositionSpec};
use crate::discovery::PeerEvent;
use crate::error::Result;
use crate::store::{delete_if_exists, upsert_with, ObjectStore};
use crate::style::resources::owner_reference;

/// What happened to the Service's auto-generated ServiceExposition
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Exposure {
    /// The Service does not ask to be exposed
    NotRequested,
    Upserted,
    Unchanged,
    /// The label was removed and the generated exposition deleted
    Withdrawn,
    /// A ServiceExposition of that name exists and belongs to someone else
    Foreign,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceOutcome {
    /// Event sent to the discovery supervisor
    pub peer: PeerEvent,
    pub exposure: Exposure,
}

/// Dial address of a discovery peer Service
///
/// The first load-balancer ingress wins, falling back to the cluster IP.
/// The port is the Service's first port.
pub fn peer_address(svc: &Service) -> Option<String> {
    let spec = svc.spec.as_ref()?;
    let port = spec.ports.as_ref()?.first()?.port;

    let external = svc
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| ingress.first())
        .and_then(|i| i.ip.clone().or_else(|| i.hostname.clone()));
    let host = external.or_else(|| {
        spec.cluster_ip
            .clone()
            .filter(|ip| !ip.is_empty() && ip != "None")
    })?;

    Some(format!("http://{}:{}", host, port))
}

#[instrument(skip(ctx))]
pub async fn reconcile_service<S: ObjectStore>(
    ctx: &Context<S>,
    namespace: &str,
    name: &str,
) -> Result<ServiceOutcome> {
    let store = ctx.store.as_ref();
    let peer = format!("{}/{}", namespace, name);

    let svc = store
        .get_opt::<Service>(namespace, name)
        .await?
        .filter(|svc| svc.metadata.deletion_timestamp.is_none());
    let Some(svc) = svc else {
        return Ok(ServiceOutcome {
            peer: publish(ctx, PeerEvent::Removed { peer }),
            exposure: Exposure::NotRequested,
        });
    };
    let labels = svc.labels().clone();

    let event = match peer_address(&svc).filter(|_| ctx.settings.is_discovery_peer(&labels)) {
        Some(address) => PeerEvent::Upsert { peer, address },
        None => PeerEvent::Removed { peer },
    };
    let peer = publish(ctx, event);

    let exposure = reconcile_exposure(ctx, &svc, &labels).await?;
    Ok(ServiceOutcome { peer, exposure })
}

fn publish<S>(ctx: &Context<S>, event: PeerEvent) -> PeerEvent {
    if ctx.peers.send(event.clone()).is_err() {
        debug!("Discovery supervisor is not running, dropping {:?}", event);
    }
    event
}

fn owned_by(se: &ServiceExposition, svc: &Service) -> bool {
    let Some(uid) = svc.uid() else {
        return false;
    };
    se.owner_references()
        .iter()
        .any(|o| o.kind == "Service" && o.uid == uid)
}

async fn reconcile_exposure<S: ObjectStore>(
    ctx: &Context<S>,
    svc: &Service,
    labels: &Labels,
) -> Result<Exposure> {
    let store = ctx.store.as_ref();
    let namespace = svc.namespace().unwrap_or_default();
    let name = svc.name_any();
    let existing: Option<ServiceExposition> = store.get_opt(&namespace, &name).await?;

    let Some((fed_config, alias)) = ctx.settings.exposure_request(labels) else {
        return match existing {
            Some(se) if owned_by(&se, svc) => {
                delete_if_exists::<S, ServiceExposition>(store, &namespace, &name).await?;
                info!("Withdrew ServiceExposition {}/{}", namespace, name);
                Ok(Exposure::Withdrawn)
            }
            _ => Ok(Exposure::NotRequested),
        };
    };

    let port = svc
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .and_then(|ports| ports.first())
        .and_then(|p| u16::try_from(p.port).ok());
    let Some(port) = port else {
        warn!(
            "Service {}/{} asks to be exposed but has no usable port",
            namespace, name
        );
        return Ok(Exposure::NotRequested);
    };

    let spec = ServiceExpositionSpec {
        name: name.clone(),
        alias,
        subset: None,
        port,
        mesh_fed_config_selector: ctx.settings.fed_config_selector(&fed_config),
        endpoints: Vec::new(),
    };

    if let Some(current) = &existing {
        if !owned_by(current, svc) {
            warn!(
                "ServiceExposition {}/{} exists and is not owned by the Service, leaving it alone",
                namespace, name
            );
            return Ok(Exposure::Foreign);
        }
        let unchanged = current.spec.alias == spec.alias
            && current.spec.port == spec.port
            && current.spec.mesh_fed_config_selector == spec.mesh_fed_config_selector;
        if unchanged {
            return Ok(Exposure::Unchanged);
        }
    }

    let mut se = ServiceExposition::new(&name, spec);
    se.metadata.namespace = Some(namespace.clone());
    se.metadata.owner_references = Some(vec![owner_reference(svc)]);

    upsert_with(store, &se, |current: &ServiceExposition, next| {
        next.spec.endpoints = current.spec.endpoints.clone();
        next.spec.subset = current.spec.subset.clone();
    })
    .await?;
    info!(
        "Upserted ServiceExposition {}/{} for MeshFedConfig {}",
        namespace, name, fed_config
    );
    Ok(Exposure::Upserted)
}
