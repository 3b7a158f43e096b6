//! Object store backed by the Kubernetes API server

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;

use super::{identity, ObjectStore, StoreObject};
use crate::crd::{selector_string, Labels};
use crate::error::Result;

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K: StoreObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<K> {
        Ok(self.api::<K>(namespace).get(name).await?)
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        selector: &Labels,
    ) -> Result<Vec<K>> {
        let api: Api<K> = match namespace {
            Some(ns) => self.api(ns),
            None => Api::all(self.client.clone()),
        };
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector_string(selector));
        }
        Ok(api.list(&params).await?.items)
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let (namespace, _) = identity(obj)?;
        Ok(self
            .api::<K>(&namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = identity(obj)?;
        Ok(self
            .api::<K>(&namespace)
            .replace(&name, &PostParams::default(), obj)
            .await?)
    }

    async fn update_status<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = identity(obj)?;
        let value = serde_json::to_value(obj)?;
        let patch = json!({ "status": value.get("status").cloned().unwrap_or_default() });
        Ok(self
            .api::<K>(&namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<()> {
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        tracing::debug!(
            "Requested deletion of {} {}/{}",
            K::kind(&()),
            namespace,
            name
        );
        Ok(())
    }
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}
