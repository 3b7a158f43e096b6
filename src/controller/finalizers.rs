//! Finalizer handling for the federation kinds
//!
//! All three kinds carry the same finalizer while tracked, so the controller
//! observes a deletion before the object is purged and can tear down what it
//! created.

use kube::ResourceExt;
use tracing::info;

use crate::error::Result;
use crate::store::{ObjectStore, StoreObject};

/// Finalizer protecting MeshFedConfig, ServiceExposition and ServiceBinding
pub const FEDERATION_FINALIZER: &str = "mm.ibm.istio.io";

pub fn has_finalizer<K: StoreObject>(obj: &K) -> bool {
    obj.finalizers().iter().any(|f| f == FEDERATION_FINALIZER)
}

pub fn is_being_deleted<K: StoreObject>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Add the finalizer and persist; the returned object carries the new version
pub async fn add_finalizer<S, K>(store: &S, obj: &K) -> Result<K>
where
    S: ObjectStore,
    K: StoreObject,
{
    if has_finalizer(obj) {
        return Ok(obj.clone());
    }
    let mut updated = obj.clone();
    updated.finalizers_mut().push(FEDERATION_FINALIZER.to_string());
    let updated = store.update(&updated).await?;
    info!(
        "Added finalizer to {} {}/{}",
        K::kind(&()),
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    );
    Ok(updated)
}

/// Drop the finalizer and persist. Once it is gone the store may purge the
/// object, so nothing is returned.
pub async fn remove_finalizer<S, K>(store: &S, obj: &K) -> Result<()>
where
    S: ObjectStore,
    K: StoreObject,
{
    if !has_finalizer(obj) {
        return Ok(());
    }
    let mut updated = obj.clone();
    updated.finalizers_mut().retain(|f| f != FEDERATION_FINALIZER);
    store.update(&updated).await?;
    info!(
        "Removed finalizer from {} {}/{}",
        K::kind(&()),
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    );
    Ok(())
}
