//! Boundary Protection style
//!
//! Dedicated ingress and egress gateway workloads per MeshFedConfig, with
//! mutual TLS on every cross-mesh hop. Every object is written with an
//! idempotent upsert so a retried reconcile converges without rollback.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use super::resources::{self, BindingNames};
use super::{MeshFedConfigEffector, ServiceBinder, ServiceExposer, Style};
use crate::crd::istio::{DestinationRule, Gateway, VirtualService};
use crate::crd::{
    selector_string, Direction, MeshFedConfig, ServiceBinding, ServiceExposition,
    ServiceExpositionStatus,
};
use crate::error::{Error, Result};
use crate::store::{
    create_if_absent, delete_if_exists, prune, upsert, upsert_with, ObjectStore, StoreObject,
};

pub struct BoundaryProtection<S> {
    store: Arc<S>,
    proxy_image: String,
}

impl<S: ObjectStore> BoundaryProtection<S> {
    pub fn new(store: Arc<S>, proxy_image: String) -> Self {
        Self { store, proxy_image }
    }

    /// The single secret `tlsContextSelector` points at
    async fn tls_secret(&self, mfc: &MeshFedConfig) -> Result<String> {
        let namespace = mfc.namespace().unwrap_or_default();
        let selector = &mfc.spec.tls_context_selector;
        let secrets: Vec<Secret> = self.store.list(Some(&namespace), selector).await?;
        match secrets.as_slice() {
            [secret] => Ok(secret.name_any()),
            [] => Err(Error::NotReady(format!(
                "no secret in {} matches tlsContextSelector {}",
                namespace,
                selector_string(selector)
            ))),
            many => Err(Error::ConfigError(format!(
                "tlsContextSelector {} matches {} secrets in {}, expected exactly one",
                selector_string(selector),
                many.len(),
                namespace
            ))),
        }
    }

    async fn ensure_gateway(&self, mfc: &mut MeshFedConfig, direction: Direction) -> Result<()> {
        mfc.spec.default_gateway_selector(direction);
        let namespace = mfc.namespace().unwrap_or_default();

        upsert_with(
            self.store.as_ref(),
            &resources::gateway_service(mfc, direction),
            resources::keep_cluster_ip,
        )
        .await?;

        let selector = mfc.spec.gateway_selector(direction);
        let pods: Vec<Pod> = self.store.list(Some(&namespace), &selector).await?;
        if !pods.is_empty() {
            debug!(
                "{} {} gateway pod(s) already match {}, not deploying one",
                pods.len(),
                direction.as_str(),
                selector_string(&selector)
            );
            return Ok(());
        }

        let secret = self.tls_secret(mfc).await?;
        create_if_absent(
            self.store.as_ref(),
            &resources::gateway_service_account(mfc, direction),
        )
        .await?;
        let deployment =
            resources::gateway_deployment(mfc, direction, &self.proxy_image, &secret)?;
        if create_if_absent(self.store.as_ref(), &deployment).await? {
            info!(
                "Created {} gateway deployment {}/{}",
                direction.as_str(),
                namespace,
                deployment.name_any()
            );
        }
        Ok(())
    }

    /// `ip:port` partners dial to reach this mesh's ingress gateway
    async fn ingress_endpoint(&self, mfc: &MeshFedConfig) -> Result<String> {
        let namespace = mfc.namespace().unwrap_or_default();
        let name = resources::gateway_service_name(mfc, Direction::Ingress);
        let service: Option<Service> = self.store.get_opt(&namespace, &name).await?;
        let service =
            service.ok_or_else(|| Error::NotReady(format!("ingress service {} not found", name)))?;

        let address = service
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .and_then(|ingress| ingress.first())
            .and_then(|i| i.ip.clone().or_else(|| i.hostname.clone()))
            .ok_or_else(|| {
                Error::NotReady(format!(
                    "ingress service {}/{} has no load balancer address yet",
                    namespace, name
                ))
            })?;

        Ok(format!(
            "{}:{}",
            address,
            mfc.spec.gateway_port(Direction::Ingress)
        ))
    }

    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<()> {
        if delete_if_exists::<S, K>(self.store.as_ref(), namespace, name).await? {
            debug!("Deleted {} {}/{}", K::kind(&()), namespace, name);
        }
        Ok(())
    }

    /// Delete objects labelled for this binding under names it no longer
    /// uses, e.g. after an alias change or a move to another MeshFedConfig
    async fn prune_binding(&self, names: &BindingNames) -> Result<()> {
        let store = self.store.as_ref();
        let selector = names.selector();
        let remote = (names.mfc_namespace.as_str(), names.remote.as_str());
        let egress = (names.mfc_namespace.as_str(), names.egress.as_str());
        let local = (names.binding_namespace.as_str(), names.local.as_str());

        let stale = prune::<S, Service>(store, &selector, &[remote, egress, local]).await?
            + prune::<S, DestinationRule>(store, &selector, &[remote, egress]).await?
            + prune::<S, Gateway>(store, &selector, &[egress]).await?
            + prune::<S, VirtualService>(store, &selector, &[egress, local]).await?;
        if stale > 0 {
            info!(
                "Removed {} stale object(s) of ServiceBinding {}",
                stale, names.binding
            );
        }
        Ok(())
    }
}

/// Exactly one partner endpoint is supported per binding
pub(super) fn single_endpoint(sb: &ServiceBinding) -> Result<SocketAddr> {
    match sb.spec.endpoints.as_slice() {
        [endpoint] => resources::parse_endpoint(endpoint),
        [] => Err(Error::NotReady(format!(
            "ServiceBinding {} has no endpoints yet",
            sb.name_any()
        ))),
        many => Err(Error::ValidationError(format!(
            "ServiceBinding {} lists {} endpoints, exactly one is supported",
            sb.name_any(),
            many.len()
        ))),
    }
}

#[async_trait]
impl<S: ObjectStore> MeshFedConfigEffector for BoundaryProtection<S> {
    #[instrument(skip(self, mfc), fields(name = %mfc.name_any(), namespace = mfc.namespace()))]
    async fn effect_mesh_fed_config(&self, mfc: &mut MeshFedConfig) -> Result<()> {
        for direction in [Direction::Ingress, Direction::Egress] {
            if mfc.spec.uses_gateway(direction) {
                self.ensure_gateway(mfc, direction).await?;
            }
        }
        Ok(())
    }

    async fn remove_mesh_fed_config(&self, mfc: &MeshFedConfig) -> Result<()> {
        // gateway Services, ServiceAccounts and Deployments are owned by the config
        debug!(
            "Leaving gateway cleanup for {} to garbage collection",
            mfc.name_any()
        );
        Ok(())
    }
}

#[async_trait]
impl<S: ObjectStore> ServiceExposer for BoundaryProtection<S> {
    #[instrument(skip(self, se, mfc), fields(name = %se.name_any(), namespace = se.namespace()))]
    async fn effect_service_exposure(
        &self,
        se: &mut ServiceExposition,
        mfc: &MeshFedConfig,
    ) -> Result<()> {
        if !mfc.spec.use_ingress_gateway {
            return Err(Error::ConfigError(format!(
                "MeshFedConfig {} does not enable useIngressGateway, required to expose {}",
                mfc.name_any(),
                se.name_any()
            )));
        }

        upsert(self.store.as_ref(), &resources::exposure_gateway(mfc, se)).await?;
        upsert(
            self.store.as_ref(),
            &resources::exposure_virtual_service(mfc, se),
        )
        .await?;

        let endpoint = self.ingress_endpoint(mfc).await?;
        if se.spec.endpoints != [endpoint.clone()] {
            se.spec.endpoints = vec![endpoint];
            *se = self.store.update(se).await?;
        }

        if !se.is_ready() {
            se.status = Some(ServiceExpositionStatus { ready: true });
            *se = self.store.update_status(se).await?;
            info!(
                "ServiceExposition {}/{} ready at {:?}",
                se.namespace().unwrap_or_default(),
                se.name_any(),
                se.spec.endpoints
            );
        }
        Ok(())
    }

    async fn remove_service_exposure(
        &self,
        se: &ServiceExposition,
        mfc: &MeshFedConfig,
    ) -> Result<()> {
        let namespace = se.namespace().unwrap_or_default();
        let name = resources::exposure_name(mfc, se);
        self.delete::<VirtualService>(&namespace, &name).await?;
        self.delete::<Gateway>(&namespace, &name).await
    }
}

#[async_trait]
impl<S: ObjectStore> ServiceBinder for BoundaryProtection<S> {
    #[instrument(skip(self, sb, mfc), fields(name = %sb.name_any(), namespace = sb.namespace()))]
    async fn effect_service_binding(
        &self,
        sb: &mut ServiceBinding,
        mfc: &MeshFedConfig,
    ) -> Result<()> {
        if !mfc.spec.use_egress_gateway {
            return Err(Error::ConfigError(format!(
                "MeshFedConfig {} does not enable useEgressGateway, required to bind {}",
                mfc.name_any(),
                sb.name_any()
            )));
        }
        let remote = single_endpoint(sb)?;
        let names = BindingNames::new(mfc, sb);
        let store = self.store.as_ref();

        upsert_with(
            store,
            &resources::remote_ingress_service(mfc, &names, remote),
            resources::keep_cluster_ip,
        )
        .await?;
        upsert(store, &resources::remote_destination_rule(mfc, &names, remote)).await?;
        upsert_with(
            store,
            &resources::local_facade_service(mfc, &names, sb),
            resources::keep_cluster_ip,
        )
        .await?;
        upsert_with(
            store,
            &resources::local_egress_service(mfc, &names),
            resources::keep_cluster_ip,
        )
        .await?;
        upsert(store, &resources::egress_gateway(mfc, &names)).await?;
        upsert(store, &resources::egress_destination_rule(mfc, &names)).await?;
        upsert(store, &resources::egress_virtual_service(mfc, &names, remote)).await?;
        upsert(store, &resources::local_virtual_service(mfc, &names, sb)).await?;
        self.prune_binding(&names).await?;

        info!(
            "ServiceBinding {}/{} routed to {} through {}",
            names.binding_namespace, names.local, remote, names.egress
        );
        Ok(())
    }

    async fn remove_service_binding(&self, sb: &ServiceBinding, mfc: &MeshFedConfig) -> Result<()> {
        let names = BindingNames::new(mfc, sb);

        self.delete::<VirtualService>(&names.binding_namespace, &names.local)
            .await?;
        self.delete::<Service>(&names.binding_namespace, &names.local)
            .await?;
        self.delete::<VirtualService>(&names.mfc_namespace, &names.egress)
            .await?;
        self.delete::<DestinationRule>(&names.mfc_namespace, &names.egress)
            .await?;
        self.delete::<Gateway>(&names.mfc_namespace, &names.egress)
            .await?;
        self.delete::<Service>(&names.mfc_namespace, &names.egress)
            .await?;
        self.delete::<DestinationRule>(&names.mfc_namespace, &names.remote)
            .await?;
        self.delete::<Service>(&names.mfc_namespace, &names.remote)
            .await?;
        // objects left under earlier names
        self.prune_binding(&names).await
    }
}

impl<S: ObjectStore> Style for BoundaryProtection<S> {
    fn name(&self) -> &'static str {
        "boundary-protection"
    }
}
