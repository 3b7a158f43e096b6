//! Style strategies
//!
//! A style decides which concrete networking objects satisfy a
//! MeshFedConfig, a ServiceExposition or a ServiceBinding. The reconcilers
//! only see the capability traits; [`for_mode`] picks the implementation.

mod boundary;
mod passthrough;
pub mod resources;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Settings;
use crate::crd::{FederationMode, MeshFedConfig, ServiceBinding, ServiceExposition};
use crate::error::Result;
use crate::store::ObjectStore;

pub use boundary::BoundaryProtection;
pub use passthrough::Passthrough;

#[async_trait]
pub trait MeshFedConfigEffector: Send + Sync {
    /// Ensure the gateway surface the config asks for exists. May default
    /// fields of `mfc` in memory.
    async fn effect_mesh_fed_config(&self, mfc: &mut MeshFedConfig) -> Result<()>;

    async fn remove_mesh_fed_config(&self, mfc: &MeshFedConfig) -> Result<()>;
}

#[async_trait]
pub trait ServiceExposer: Send + Sync {
    /// Make `se` reachable from partner meshes and publish its endpoints
    async fn effect_service_exposure(
        &self,
        se: &mut ServiceExposition,
        mfc: &MeshFedConfig,
    ) -> Result<()>;

    async fn remove_service_exposure(
        &self,
        se: &ServiceExposition,
        mfc: &MeshFedConfig,
    ) -> Result<()>;
}

#[async_trait]
pub trait ServiceBinder: Send + Sync {
    /// Route local traffic for `sb` to the partner endpoint
    async fn effect_service_binding(&self, sb: &mut ServiceBinding, mfc: &MeshFedConfig)
        -> Result<()>;

    async fn remove_service_binding(&self, sb: &ServiceBinding, mfc: &MeshFedConfig)
        -> Result<()>;
}

/// Full capability set of a federation style
pub trait Style: MeshFedConfigEffector + ServiceExposer + ServiceBinder {
    fn name(&self) -> &'static str;
}

/// Build the style selected by a MeshFedConfig's mode
pub fn for_mode<S: ObjectStore>(
    mode: &FederationMode,
    store: Arc<S>,
    settings: &Settings,
) -> Box<dyn Style> {
    match mode {
        FederationMode::Boundary => {
            Box::new(BoundaryProtection::new(store, settings.proxy_image.clone()))
        }
        FederationMode::Passthrough => Box::new(Passthrough::new(store)),
    }
}
