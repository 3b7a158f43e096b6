//! Object store client
//!
//! Every read and write the reconcilers and styles perform goes through
//! [`ObjectStore`]. [`KubeStore`] talks to the API server; [`MemoryStore`]
//! keeps objects in process and is what the test suite runs against.

mod kube_store;
mod memory;

use std::fmt::Debug;

use async_trait::async_trait;
use kube::core::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::crd::Labels;
use crate::error::{Error, Result};

pub use kube_store::KubeStore;
pub use memory::MemoryStore;

/// Namespaced kinds the federation controller reads or writes
pub trait StoreObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> StoreObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Versioned, label-queryable object store
///
/// Failures are classified into [`Error::NotFound`], [`Error::AlreadyExists`]
/// and [`Error::Conflict`]; anything else is passed through.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<K>;

    /// Like [`ObjectStore::get`] with NotFound folded into `None`
    async fn get_opt<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        match self.get::<K>(namespace, name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// List objects whose labels are a superset of `selector`, across all
    /// namespaces when `namespace` is `None`
    async fn list<K: StoreObject>(&self, namespace: Option<&str>, selector: &Labels)
        -> Result<Vec<K>>;

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K>;

    /// Replace metadata and spec; the stored resource version must match
    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K>;

    /// Replace only the status
    async fn update_status<K: StoreObject>(&self, obj: &K) -> Result<K>;

    /// Request deletion; objects holding finalizers stay until they are released
    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Namespace and name of an object about to be written
pub(crate) fn identity<K: StoreObject>(obj: &K) -> Result<(String, String)> {
    let namespace = obj.namespace().ok_or_else(|| {
        Error::ConfigError(format!(
            "{} {} has no namespace",
            K::kind(&()),
            obj.name_any()
        ))
    })?;
    Ok((namespace, obj.name_any()))
}

/// Create `desired`, or overwrite the existing object with it
pub async fn upsert<S, K>(store: &S, desired: &K) -> Result<K>
where
    S: ObjectStore,
    K: StoreObject,
{
    upsert_with(store, desired, |_, _| {}).await
}

/// Create `desired`; on AlreadyExists re-fetch, let `merge` carry over
/// fields from the live object, and update against its resource version
///
/// Finalizers of the live object are always kept.
pub async fn upsert_with<S, K, F>(store: &S, desired: &K, merge: F) -> Result<K>
where
    S: ObjectStore,
    K: StoreObject,
    F: FnOnce(&K, &mut K) + Send,
{
    match store.create(desired).await {
        Ok(created) => Ok(created),
        Err(e) if e.is_already_exists() => {
            let (namespace, name) = identity(desired)?;
            let current: K = store.get(&namespace, &name).await?;
            let mut next = desired.clone();
            merge(&current, &mut next);
            let meta = next.meta_mut();
            meta.resource_version = current.meta().resource_version.clone();
            meta.uid = current.meta().uid.clone();
            meta.finalizers = current.meta().finalizers.clone();
            store.update(&next).await
        }
        Err(e) => Err(e),
    }
}

/// Create `obj` unless an object with its name already exists
///
/// Returns whether the object was created. An existing object is never
/// touched.
pub async fn create_if_absent<S, K>(store: &S, obj: &K) -> Result<bool>
where
    S: ObjectStore,
    K: StoreObject,
{
    match store.create(obj).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_already_exists() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Delete, treating NotFound as success. Returns whether anything was deleted.
pub async fn delete_if_exists<S, K>(store: &S, namespace: &str, name: &str) -> Result<bool>
where
    S: ObjectStore,
    K: StoreObject,
{
    match store.delete::<K>(namespace, name).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Delete every `K` labelled with `selector`, in any namespace, that is not
/// one of the `(namespace, name)` pairs in `keep`. Returns how many were
/// deleted. An empty selector matches nothing.
pub async fn prune<S, K>(store: &S, selector: &Labels, keep: &[(&str, &str)]) -> Result<usize>
where
    S: ObjectStore,
    K: StoreObject,
{
    if selector.is_empty() {
        return Ok(0);
    }
    let found: Vec<K> = store.list(None, selector).await?;
    let mut deleted = 0;
    for obj in found {
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let wanted = keep
            .iter()
            .any(|(ns, n)| *ns == namespace.as_str() && *n == name.as_str());
        if wanted || obj.meta().deletion_timestamp.is_some() {
            continue;
        }
        if delete_if_exists::<S, K>(store, &namespace, &name).await? {
            deleted += 1;
        }
    }
    Ok(deleted)
}
