//! Passthrough style
//!
//! No dedicated gateways: bindings resolve straight to the partner's ingress
//! and rely on the mesh's own mutual TLS.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use super::boundary::single_endpoint;
use super::resources;
use super::{MeshFedConfigEffector, ServiceBinder, ServiceExposer, Style};
use crate::crd::istio::{DestinationRule, ServiceEntry};
use crate::crd::{MeshFedConfig, ServiceBinding, ServiceExposition, ServiceExpositionStatus};
use crate::error::{Error, Result};
use crate::store::{delete_if_exists, prune, upsert, upsert_with, ObjectStore};

pub struct Passthrough<S> {
    store: Arc<S>,
}

impl<S: ObjectStore> Passthrough<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: ObjectStore> MeshFedConfigEffector for Passthrough<S> {
    async fn effect_mesh_fed_config(&self, mfc: &mut MeshFedConfig) -> Result<()> {
        if mfc.spec.use_ingress_gateway || mfc.spec.use_egress_gateway {
            return Err(Error::Unimplemented(format!(
                "MeshFedConfig {}: dedicated gateways are not supported in PASSTHROUGH mode",
                mfc.name_any()
            )));
        }
        Ok(())
    }

    async fn remove_mesh_fed_config(&self, _mfc: &MeshFedConfig) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<S: ObjectStore> ServiceExposer for Passthrough<S> {
    #[instrument(skip(self, se, mfc), fields(name = %se.name_any(), namespace = se.namespace()))]
    async fn effect_service_exposure(
        &self,
        se: &mut ServiceExposition,
        mfc: &MeshFedConfig,
    ) -> Result<()> {
        if mfc.spec.use_ingress_gateway {
            return Err(Error::Unimplemented(format!(
                "ServiceExposition {}: ingress gateways are not supported in PASSTHROUGH mode",
                se.name_any()
            )));
        }

        // the binding side does the work; endpoints stay as declared
        if !se.is_ready() {
            se.status = Some(ServiceExpositionStatus { ready: true });
            *se = self.store.update_status(se).await?;
            debug!("ServiceExposition {} ready", se.name_any());
        }
        Ok(())
    }

    async fn remove_service_exposure(
        &self,
        _se: &ServiceExposition,
        _mfc: &MeshFedConfig,
    ) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<S: ObjectStore> ServiceBinder for Passthrough<S> {
    #[instrument(skip(self, sb, mfc), fields(name = %sb.name_any(), namespace = sb.namespace()))]
    async fn effect_service_binding(
        &self,
        sb: &mut ServiceBinding,
        mfc: &MeshFedConfig,
    ) -> Result<()> {
        let remote = single_endpoint(sb)?;
        let store = self.store.as_ref();

        upsert(store, &resources::passthrough_service_entry(mfc, sb, remote)).await?;
        upsert(store, &resources::passthrough_destination_rule(mfc, sb)).await?;
        upsert_with(
            store,
            &resources::passthrough_service(mfc, sb),
            resources::keep_cluster_ip,
        )
        .await?;
        prune_binding(store, sb).await?;

        info!(
            "ServiceBinding {} resolves directly to {}",
            sb.spec.local_name(),
            remote
        );
        Ok(())
    }

    async fn remove_service_binding(&self, sb: &ServiceBinding, _mfc: &MeshFedConfig) -> Result<()> {
        let namespace = sb.namespace().unwrap_or_default();
        let name = sb.spec.local_name();
        let store = self.store.as_ref();

        delete_if_exists::<S, Service>(store, &namespace, name).await?;
        delete_if_exists::<S, DestinationRule>(store, &namespace, name).await?;
        delete_if_exists::<S, ServiceEntry>(store, &namespace, name).await?;
        prune_binding(store, sb).await
    }
}

/// Delete objects labelled for `sb` that are not named after its current local name
async fn prune_binding<S: ObjectStore>(store: &S, sb: &ServiceBinding) -> Result<()> {
    let selector = resources::binding_selector(sb);
    let namespace = sb.namespace().unwrap_or_default();
    let keep = [(namespace.as_str(), sb.spec.local_name())];

    let stale = prune::<S, Service>(store, &selector, &keep).await?
        + prune::<S, DestinationRule>(store, &selector, &keep).await?
        + prune::<S, ServiceEntry>(store, &selector, &keep).await?;
    if stale > 0 {
        debug!("Removed {} stale object(s) of ServiceBinding {}", stale, sb.name_any());
    }
    Ok(())
}

impl<S: ObjectStore> Style for Passthrough<S> {
    fn name(&self) -> &'static str {
        "passthrough"
    }
}
