//! Conversions between ServiceExpositions, wire snapshots and ServiceBindings

use std::collections::HashSet;

use kube::ResourceExt;
use tracing::{debug, warn};

use super::proto::{ExposedService, ServiceList};
use crate::crd::{is_dns_label, Labels, ServiceBinding, ServiceBindingSpec, ServiceExposition};
use crate::error::Result;
use crate::store::{upsert_with, ObjectStore};

/// Every ready ServiceExposition in the store, announced under its alias when set
///
/// Announced names are unique. When several namespaces expose the same name,
/// the first by namespace then object name wins and the rest are skipped
/// with a warning.
pub async fn snapshot<S: ObjectStore>(store: &S, mesh_name: &str) -> Result<ServiceList> {
    let exposures: Vec<ServiceExposition> = store.list(None, &Labels::new()).await?;

    let mut ready: Vec<(String, String, &ServiceExposition)> = exposures
        .iter()
        .filter(|se| se.is_ready())
        .map(|se| (se.namespace().unwrap_or_default(), se.name_any(), se))
        .collect();
    ready.sort_by(|a, b| {
        (a.2.spec.exposed_name(), &a.0, &a.1).cmp(&(b.2.spec.exposed_name(), &b.0, &b.1))
    });

    let mut exposed_services: Vec<ExposedService> = Vec::with_capacity(ready.len());
    for (namespace, name, se) in ready {
        let exposed_name = se.spec.exposed_name();
        if let Some(kept) = exposed_services.last().filter(|s| s.name == exposed_name) {
            warn!(
                "ServiceExposition {}/{} is not announced: {:?} is already exposed on port {}",
                namespace, name, exposed_name, kept.port
            );
            continue;
        }
        exposed_services.push(ExposedService {
            name: exposed_name.to_string(),
            port: u32::from(se.spec.port),
            mesh_fed_config_selector: se.spec.mesh_fed_config_selector.clone(),
            endpoints: se.spec.endpoints.clone(),
        });
    }

    Ok(ServiceList {
        name: mesh_name.to_string(),
        exposed_services,
    })
}

/// Upsert one ServiceBinding per announced service into `namespace`
///
/// A locally chosen alias survives the overwrite. Returns how many bindings
/// were written.
pub async fn apply_snapshot<S: ObjectStore>(
    store: &S,
    namespace: &str,
    list: &ServiceList,
) -> Result<usize> {
    let mut applied = 0;
    let mut seen = HashSet::new();
    for service in &list.exposed_services {
        if !seen.insert(service.name.as_str()) {
            warn!(
                "Ignoring duplicate announcement of {} by {}",
                service.name, list.name
            );
            continue;
        }
        if !is_dns_label(&service.name) {
            warn!(
                "Ignoring service {:?} announced by {}: not a valid DNS label",
                service.name, list.name
            );
            continue;
        }
        let Ok(port) = u16::try_from(service.port) else {
            warn!(
                "Ignoring service {} announced by {}: port {} out of range",
                service.name, list.name, service.port
            );
            continue;
        };

        let mut binding = ServiceBinding::new(
            &service.name,
            ServiceBindingSpec {
                name: service.name.clone(),
                alias: None,
                port,
                mesh_fed_config_selector: service.mesh_fed_config_selector.clone(),
                endpoints: service.endpoints.clone(),
            },
        );
        binding.metadata.namespace = Some(namespace.to_string());

        upsert_with(store, &binding, |current: &ServiceBinding, next| {
            next.spec.alias = current.spec.alias.clone();
            next.metadata.labels = current.metadata.labels.clone();
        })
        .await?;
        applied += 1;
    }

    debug!(
        "Applied {} binding(s) from {} into {}",
        applied, list.name, namespace
    );
    Ok(applied)
}
