//! Finalizer-driven lifecycle shared by the three federation kinds
//!
//! Each pass fetches the object, resolves its MeshFedConfig and then takes
//! exactly one step:
//!
//! | deleting | finalizer | step |
//! |----------|-----------|------|
//! | no       | absent    | add the finalizer, nothing else |
//! | no       | present   | apply the style's effect |
//! | yes      | present   | remove through the style, then drop the finalizer |
//! | yes      | absent    | nothing |
//!
//! The finalizer is persisted one pass before any side effect, so a crash in
//! between still leaves the delete path armed.

use std::time::Duration;

use async_trait::async_trait;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::finalizers::{add_finalizer, has_finalizer, is_being_deleted, remove_finalizer};
use super::selector::{resolve_mesh_fed_config, Resolution};
use super::Context;
use crate::crd::{summarize, MeshFedConfig, ServiceBinding, ServiceExposition};
use crate::error::{Error, Result};
use crate::store::{ObjectStore, StoreObject};
use crate::style::Style;

/// Requeue while the owning MeshFedConfig cannot be resolved
pub const WAITING_REQUEUE: Duration = Duration::from_secs(10);
/// Periodic resync of applied objects
pub const APPLIED_REQUEUE: Duration = Duration::from_secs(300);

/// Kinds reconciled through [`reconcile_object`]
#[async_trait]
pub trait Federated: StoreObject {
    /// Controller name used in logs and metrics
    const CONTROLLER: &'static str;

    /// Whether a change to this kind alters what discovery announces
    const ANNOUNCES: bool;

    /// Find the MeshFedConfig governing this object
    async fn owning_config<S: ObjectStore>(&self, store: &S) -> Result<Resolution>;

    async fn effect(&mut self, style: &dyn Style, mfc: &MeshFedConfig) -> Result<()>;

    async fn remove(&self, style: &dyn Style, mfc: &MeshFedConfig) -> Result<()>;
}

#[async_trait]
impl Federated for MeshFedConfig {
    const CONTROLLER: &'static str = "meshfedconfig";
    const ANNOUNCES: bool = false;

    /// A config governs itself once its spec is valid
    async fn owning_config<S: ObjectStore>(&self, _store: &S) -> Result<Resolution> {
        self.spec.validate().map_err(|errors| {
            Error::ValidationError(format!(
                "MeshFedConfig {}: {}",
                self.name_any(),
                summarize(&errors)
            ))
        })?;
        Ok(Resolution::Resolved(self.clone()))
    }

    async fn effect(&mut self, style: &dyn Style, _mfc: &MeshFedConfig) -> Result<()> {
        style.effect_mesh_fed_config(self).await
    }

    async fn remove(&self, style: &dyn Style, _mfc: &MeshFedConfig) -> Result<()> {
        style.remove_mesh_fed_config(self).await
    }
}

#[async_trait]
impl Federated for ServiceExposition {
    const CONTROLLER: &'static str = "serviceexposition";
    const ANNOUNCES: bool = true;

    async fn owning_config<S: ObjectStore>(&self, store: &S) -> Result<Resolution> {
        resolve_mesh_fed_config(store, &self.spec.mesh_fed_config_selector).await
    }

    async fn effect(&mut self, style: &dyn Style, mfc: &MeshFedConfig) -> Result<()> {
        style.effect_service_exposure(self, mfc).await
    }

    async fn remove(&self, style: &dyn Style, mfc: &MeshFedConfig) -> Result<()> {
        style.remove_service_exposure(self, mfc).await
    }
}

#[async_trait]
impl Federated for ServiceBinding {
    const CONTROLLER: &'static str = "servicebinding";
    const ANNOUNCES: bool = true;

    async fn owning_config<S: ObjectStore>(&self, store: &S) -> Result<Resolution> {
        self.spec.validate().map_err(|errors| {
            Error::ValidationError(format!(
                "ServiceBinding {}: {}",
                self.name_any(),
                summarize(&errors)
            ))
        })?;
        resolve_mesh_fed_config(store, &self.spec.mesh_fed_config_selector).await
    }

    async fn effect(&mut self, style: &dyn Style, mfc: &MeshFedConfig) -> Result<()> {
        style.effect_service_binding(self, mfc).await
    }

    async fn remove(&self, style: &dyn Style, mfc: &MeshFedConfig) -> Result<()> {
        style.remove_service_binding(self, mfc).await
    }
}

/// What a single reconcile pass did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The object no longer exists
    Absent,
    /// The MeshFedConfig is missing or ambiguous; retry later
    Waiting,
    FinalizerAdded,
    /// The style's effect succeeded
    Applied,
    /// The style removed its objects and the finalizer was dropped
    Cleaned,
    /// Deleted without a resolvable config; the finalizer was dropped without cleanup
    Released,
    /// Nothing to do
    Idle,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Absent => "absent",
            Outcome::Waiting => "waiting",
            Outcome::FinalizerAdded => "finalizer_added",
            Outcome::Applied => "applied",
            Outcome::Cleaned => "cleaned",
            Outcome::Released => "released",
            Outcome::Idle => "idle",
        }
    }

    /// Requeue policy for the controller runtime
    pub fn action(&self) -> Action {
        match self {
            Outcome::Waiting => Action::requeue(WAITING_REQUEUE),
            Outcome::Applied => Action::requeue(APPLIED_REQUEUE),
            // the finalizer update itself triggers the next pass
            Outcome::FinalizerAdded
            | Outcome::Absent
            | Outcome::Cleaned
            | Outcome::Released
            | Outcome::Idle => Action::await_change(),
        }
    }
}

/// Run one lifecycle pass for `namespace/name`
#[instrument(skip(ctx), fields(controller = K::CONTROLLER))]
pub async fn reconcile_object<K, S>(ctx: &Context<S>, namespace: &str, name: &str) -> Result<Outcome>
where
    K: Federated,
    S: ObjectStore,
{
    let store = ctx.store.as_ref();

    let Some(obj) = store.get_opt::<K>(namespace, name).await? else {
        debug!("{} {}/{} is gone", K::kind(&()), namespace, name);
        return Ok(Outcome::Absent);
    };
    let deleting = is_being_deleted(&obj);
    let tracked = has_finalizer(&obj);

    let mfc = match obj.owning_config(store).await {
        Ok(Resolution::Resolved(mfc)) => mfc,
        Ok(unresolved) if deleting => {
            info!(
                "{} {}/{} deleted while its MeshFedConfig is unresolved ({}), releasing",
                K::kind(&()),
                namespace,
                name,
                unresolved.describe()
            );
            return release(store, &obj).await;
        }
        Err(e) if deleting => {
            warn!(
                "{} {}/{} deleted while its MeshFedConfig cannot be resolved ({}), releasing",
                K::kind(&()),
                namespace,
                name,
                e
            );
            return release(store, &obj).await;
        }
        Ok(unresolved) => {
            info!(
                "{} {}/{} waiting: {}",
                K::kind(&()),
                namespace,
                name,
                unresolved.describe()
            );
            return Ok(Outcome::Waiting);
        }
        Err(e) => return Err(e),
    };

    let style = ctx.style_for(&mfc);
    debug!(
        "{} {}/{} uses MeshFedConfig {} ({})",
        K::kind(&()),
        namespace,
        name,
        mfc.name_any(),
        style.name()
    );

    match (deleting, tracked) {
        (false, false) => {
            add_finalizer(store, &obj).await?;
            Ok(Outcome::FinalizerAdded)
        }
        (false, true) => {
            let mut obj = obj;
            obj.effect(style.as_ref(), &mfc).await?;
            if K::ANNOUNCES {
                ctx.updates.notify();
            }
            Ok(Outcome::Applied)
        }
        (true, true) => {
            obj.remove(style.as_ref(), &mfc).await?;
            remove_finalizer(store, &obj).await?;
            if K::ANNOUNCES {
                ctx.updates.notify();
            }
            info!("{} {}/{} cleaned up", K::kind(&()), namespace, name);
            Ok(Outcome::Cleaned)
        }
        (true, false) => Ok(Outcome::Idle),
    }
}

async fn release<K, S>(store: &S, obj: &K) -> Result<Outcome>
where
    K: StoreObject,
    S: ObjectStore,
{
    if has_finalizer(obj) {
        remove_finalizer(store, obj).await?;
        Ok(Outcome::Released)
    } else {
        Ok(Outcome::Idle)
    }
}
