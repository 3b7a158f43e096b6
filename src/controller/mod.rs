//! Controller module for the federation kinds
//!
//! Holds the generic finalizer-driven lifecycle shared by MeshFedConfig,
//! ServiceExposition and ServiceBinding, the native Service reconciler that
//! feeds discovery, and the kube-runtime wiring for all four.

mod finalizers;
mod lifecycle;
#[cfg(feature = "metrics")]
pub mod metrics;
mod reconciler;
pub mod selector;
mod service;

use std::sync::Arc;

use crate::config::Settings;
use crate::crd::MeshFedConfig;
use crate::discovery::{PeerSender, UpdateNotifier};
use crate::store::ObjectStore;
use crate::style::{self, Style};

pub use finalizers::{
    add_finalizer, has_finalizer, is_being_deleted, remove_finalizer, FEDERATION_FINALIZER,
};
pub use lifecycle::{reconcile_object, Federated, Outcome};
pub use reconciler::run_controllers;
pub use selector::{dependents, resolve_mesh_fed_config, Resolution};
pub use service::{peer_address, reconcile_service, Exposure, ServiceOutcome};

/// Shared state for every controller
pub struct Context<S> {
    pub store: Arc<S>,
    pub settings: Arc<Settings>,
    /// Wakes the discovery broadcaster
    pub updates: UpdateNotifier,
    /// Discovery peer changes, consumed by the supervisor
    pub peers: PeerSender,
}

impl<S: ObjectStore> Context<S> {
    pub fn new(
        store: Arc<S>,
        settings: Arc<Settings>,
        updates: UpdateNotifier,
        peers: PeerSender,
    ) -> Self {
        Self {
            store,
            settings,
            updates,
            peers,
        }
    }

    /// Style bound to the config's mode
    pub fn style_for(&self, mfc: &MeshFedConfig) -> Box<dyn Style> {
        style::for_mode(&mfc.spec.mode, self.store.clone(), &self.settings)
    }
}
