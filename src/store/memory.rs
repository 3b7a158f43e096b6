//! In-process object store
//!
//! Mirrors the API server behaviour the controller depends on: resource
//! versions with optimistic concurrency, label queries, finalizer-gated
//! deletion and owner-reference garbage collection.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use super::{identity, ObjectStore, StoreObject};
use crate::crd::{labels_match, Labels};
use crate::error::{Error, Result};

type Key = (String, String, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Value>,
    version: u64,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    /// Remove an object and garbage collect everything it owns
    fn purge(&mut self, key: &Key) {
        let mut pending = vec![key.clone()];
        while let Some(key) = pending.pop() {
            let Some(removed) = self.objects.remove(&key) else {
                continue;
            };
            let Some(uid) = removed
                .pointer("/metadata/uid")
                .and_then(Value::as_str)
                .map(str::to_string)
            else {
                continue;
            };

            let owned: Vec<Key> = self
                .objects
                .iter()
                .filter(|(_, obj)| owned_by(obj, &uid))
                .map(|(k, _)| k.clone())
                .collect();
            for dependent in owned {
                if has_finalizers(&self.objects[&dependent]) {
                    let rv = self.next_version();
                    if let Some(obj) = self.objects.get_mut(&dependent) {
                        mark_deleting(obj, rv);
                    }
                } else {
                    pending.push(dependent);
                }
            }
        }
    }
}

/// Thread-safe in-memory [`ObjectStore`]
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects of kind `K` in `namespace`
    pub async fn count<K: StoreObject>(&self, namespace: &str) -> usize {
        let kind = type_key::<K>();
        self.inner
            .lock()
            .await
            .objects
            .keys()
            .filter(|(k, ns, _)| *k == kind && ns == namespace)
            .count()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

fn type_key<K: StoreObject>() -> String {
    format!("{}/{}", K::api_version(&()), K::kind(&()))
}

fn key_of<K: StoreObject>(namespace: &str, name: &str) -> Key {
    (type_key::<K>(), namespace.to_string(), name.to_string())
}

fn not_found<K: StoreObject>(namespace: &str, name: &str) -> Error {
    Error::NotFound(format!("{} {}/{}", K::kind(&()), namespace, name))
}

fn resource_version(obj: &Value) -> Option<&str> {
    obj.pointer("/metadata/resourceVersion")
        .and_then(Value::as_str)
        .filter(|rv| !rv.is_empty())
}

fn has_finalizers(obj: &Value) -> bool {
    obj.pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .map(|f| !f.is_empty())
        .unwrap_or(false)
}

fn is_deleting(obj: &Value) -> bool {
    obj.pointer("/metadata/deletionTimestamp")
        .map(|ts| !ts.is_null())
        .unwrap_or(false)
}

fn owned_by(obj: &Value, uid: &str) -> bool {
    obj.pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .map(|refs| {
            refs.iter()
                .any(|r| r.get("uid").and_then(Value::as_str) == Some(uid))
        })
        .unwrap_or(false)
}

fn labels_of(obj: &Value) -> Option<Labels> {
    obj.pointer("/metadata/labels")
        .and_then(|l| serde_json::from_value(l.clone()).ok())
}

fn set_metadata(obj: &mut Value, field: &str, value: Value) {
    if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.insert(field.to_string(), value);
    }
}

fn mark_deleting(obj: &mut Value, rv: String) {
    if !is_deleting(obj) {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        set_metadata(obj, "deletionTimestamp", Value::String(now));
    }
    set_metadata(obj, "resourceVersion", Value::String(rv));
}

fn check_version<K: StoreObject>(incoming: &Value, stored: &Value, name: &str) -> Result<()> {
    match (resource_version(incoming), resource_version(stored)) {
        (Some(theirs), Some(ours)) if theirs != ours => Err(Error::Conflict(format!(
            "{} {} was modified: resourceVersion {} is stale, current is {}",
            K::kind(&()),
            name,
            theirs,
            ours
        ))),
        _ => Ok(()),
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<K> {
        let inner = self.inner.lock().await;
        let value = inner
            .objects
            .get(&key_of::<K>(namespace, name))
            .ok_or_else(|| not_found::<K>(namespace, name))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        selector: &Labels,
    ) -> Result<Vec<K>> {
        let kind = type_key::<K>();
        let inner = self.inner.lock().await;
        inner
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && namespace.map_or(true, |want| ns == want))
            .filter(|(_, obj)| labels_match(labels_of(obj).as_ref(), selector))
            .map(|(_, obj)| serde_json::from_value(obj.clone()).map_err(Error::from))
            .collect()
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = identity(obj)?;
        let key = key_of::<K>(&namespace, &name);
        let mut value = serde_json::to_value(obj)?;

        let mut inner = self.inner.lock().await;
        if inner.objects.contains_key(&key) {
            return Err(Error::AlreadyExists(format!(
                "{} {}/{}",
                K::kind(&()),
                namespace,
                name
            )));
        }

        let rv = inner.next_version();
        let uid = format!("uid-{}", rv);
        set_metadata(&mut value, "uid", Value::String(uid));
        set_metadata(&mut value, "resourceVersion", Value::String(rv));
        if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.remove("deletionTimestamp");
        }

        inner.objects.insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = identity(obj)?;
        let key = key_of::<K>(&namespace, &name);
        let mut value = serde_json::to_value(obj)?;

        let mut inner = self.inner.lock().await;
        let stored = inner
            .objects
            .get(&key)
            .ok_or_else(|| not_found::<K>(&namespace, &name))?;
        check_version::<K>(&value, stored, &name)?;

        // status, identity and deletion state belong to the server
        match stored.get("status") {
            Some(status) => value["status"] = status.clone(),
            None => {
                if let Some(map) = value.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        for field in ["uid", "deletionTimestamp"] {
            match stored.pointer(&format!("/metadata/{}", field)) {
                Some(v) => set_metadata(&mut value, field, v.clone()),
                None => {
                    if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
                        meta.remove(field);
                    }
                }
            }
        }

        let rv = inner.next_version();
        set_metadata(&mut value, "resourceVersion", Value::String(rv));

        let released = is_deleting(&value) && !has_finalizers(&value);
        inner.objects.insert(key.clone(), value.clone());
        if released {
            inner.purge(&key);
        }
        Ok(serde_json::from_value(value)?)
    }

    async fn update_status<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = identity(obj)?;
        let key = key_of::<K>(&namespace, &name);
        let incoming = serde_json::to_value(obj)?;

        let mut inner = self.inner.lock().await;
        let rv = {
            let stored = inner
                .objects
                .get(&key)
                .ok_or_else(|| not_found::<K>(&namespace, &name))?;
            check_version::<K>(&incoming, stored, &name)?;
            inner.version + 1
        };
        inner.version = rv;

        let stored = inner
            .objects
            .get_mut(&key)
            .ok_or_else(|| not_found::<K>(&namespace, &name))?;
        stored["status"] = incoming.get("status").cloned().unwrap_or(Value::Null);
        set_metadata(stored, "resourceVersion", Value::String(rv.to_string()));
        Ok(serde_json::from_value(stored.clone())?)
    }

    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<()> {
        let key = key_of::<K>(namespace, name);
        let mut inner = self.inner.lock().await;
        let gated = inner
            .objects
            .get(&key)
            .map(has_finalizers)
            .ok_or_else(|| not_found::<K>(namespace, name))?;

        if gated {
            let rv = inner.next_version();
            if let Some(obj) = inner.objects.get_mut(&key) {
                mark_deleting(obj, rv);
            }
        } else {
            inner.purge(&key);
        }
        Ok(())
    }
}
