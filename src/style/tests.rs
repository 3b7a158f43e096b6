//! Style behaviour against the in-memory store

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    LoadBalancerIngress, LoadBalancerStatus, Pod, Secret, Service, ServiceAccount, ServiceStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::resources::{gateway_service_name, BINDING_LABEL, EGRESS_TLS_PORT};
use super::{for_mode, Style};
use crate::config::Settings;
use crate::crd::istio::{DestinationRule, Gateway, ServiceEntry, VirtualService};
use crate::crd::{
    Direction, FederationMode, Labels, MeshFedConfig, MeshFedConfigSpec, ServiceBinding,
    ServiceBindingSpec, ServiceExposition, ServiceExpositionSpec,
};
use crate::error::Error;
use crate::store::{upsert, MemoryStore, ObjectStore};

const MESH_NS: &str = "mesh-system";
const APP_NS: &str = "bookinfo";

fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn meta(name: &str, namespace: &str, labels: Labels) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        ..Default::default()
    }
}

async fn boundary_config(store: &MemoryStore, ingress: bool, egress: bool) -> MeshFedConfig {
    let mut mfc = MeshFedConfig::new(
        "limited-trust",
        MeshFedConfigSpec {
            mode: FederationMode::Boundary,
            use_ingress_gateway: ingress,
            use_egress_gateway: egress,
            tls_context_selector: labels(&[("mesh-certs", "limited-trust")]),
            ..Default::default()
        },
    );
    mfc.metadata.namespace = Some(MESH_NS.to_string());
    mfc.metadata.labels = Some(labels(&[("fed-config", "limited-trust")]));
    store.create(&mfc).await.unwrap()
}

async fn tls_secret(store: &MemoryStore) {
    let secret = Secret {
        metadata: meta(
            "limited-trust-certs",
            MESH_NS,
            labels(&[("mesh-certs", "limited-trust")]),
        ),
        ..Default::default()
    };
    store.create(&secret).await.unwrap();
}

fn style(store: &Arc<MemoryStore>, mode: FederationMode) -> Box<dyn Style> {
    for_mode(&mode, store.clone(), &Settings::default())
}

async fn publish_load_balancer(store: &MemoryStore, mfc: &MeshFedConfig, ip: &str) {
    let name = gateway_service_name(mfc, Direction::Ingress);
    let mut service: Service = store.get(MESH_NS, &name).await.unwrap();
    service.status = Some(ServiceStatus {
        load_balancer: Some(LoadBalancerStatus {
            ingress: Some(vec![LoadBalancerIngress {
                ip: Some(ip.to_string()),
                ..Default::default()
            }]),
        }),
        ..Default::default()
    });
    store.update_status(&service).await.unwrap();
}

fn binding(endpoints: &[&str]) -> ServiceBinding {
    let mut sb = ServiceBinding::new(
        "reviews",
        ServiceBindingSpec {
            name: "reviews".to_string(),
            port: 9080,
            mesh_fed_config_selector: labels(&[("fed-config", "limited-trust")]),
            endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
            ..Default::default()
        },
    );
    sb.metadata.namespace = Some(APP_NS.to_string());
    sb
}

// ============================================================================
// Boundary Protection: gateways
// ============================================================================

#[tokio::test]
async fn test_boundary_defaults_selector_and_deploys_gateway_once() {
    let store = Arc::new(MemoryStore::new());
    tls_secret(&store).await;
    let mut mfc = boundary_config(&store, true, false).await;
    let style = style(&store, FederationMode::Boundary);

    style.effect_mesh_fed_config(&mut mfc).await.unwrap();

    assert_eq!(
        mfc.spec.ingress_gateway_selector,
        labels(&[("istio", "ingressgateway")])
    );
    assert_eq!(store.count::<Deployment>(MESH_NS).await, 1);
    assert_eq!(store.count::<ServiceAccount>(MESH_NS).await, 1);
    let service: Service = store
        .get(MESH_NS, "istio-limited-trust-ingress-15443")
        .await
        .unwrap();
    assert_eq!(
        service.spec.and_then(|s| s.type_).as_deref(),
        Some("LoadBalancer")
    );

    // the gateway pod is now running
    let pod = Pod {
        metadata: meta(
            "istio-limited-trust-ingress-abc12",
            MESH_NS,
            labels(&[("istio", "ingressgateway")]),
        ),
        ..Default::default()
    };
    store.create(&pod).await.unwrap();

    style.effect_mesh_fed_config(&mut mfc).await.unwrap();
    assert_eq!(store.count::<Deployment>(MESH_NS).await, 1);
}

#[tokio::test]
async fn test_boundary_skips_deployment_when_gateway_pods_exist() {
    let store = Arc::new(MemoryStore::new());
    let pod = Pod {
        metadata: meta(
            "istio-egressgateway-xyz",
            MESH_NS,
            labels(&[("istio", "egressgateway")]),
        ),
        ..Default::default()
    };
    store.create(&pod).await.unwrap();
    let mut mfc = boundary_config(&store, false, true).await;

    // no TLS secret needed when nothing is deployed
    style(&store, FederationMode::Boundary)
        .effect_mesh_fed_config(&mut mfc)
        .await
        .unwrap();

    assert_eq!(store.count::<Deployment>(MESH_NS).await, 0);
    assert_eq!(store.count::<Service>(MESH_NS).await, 1);
}

#[tokio::test]
async fn test_boundary_requires_tls_secret_to_deploy() {
    let store = Arc::new(MemoryStore::new());
    let mut mfc = boundary_config(&store, true, false).await;

    let err = style(&store, FederationMode::Boundary)
        .effect_mesh_fed_config(&mut mfc)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotReady(_)));
    assert_eq!(store.count::<Deployment>(MESH_NS).await, 0);
}

// ============================================================================
// Boundary Protection: exposure
// ============================================================================

#[tokio::test]
async fn test_boundary_exposure_publishes_ingress_endpoint() {
    let store = Arc::new(MemoryStore::new());
    tls_secret(&store).await;
    let mut mfc = boundary_config(&store, true, false).await;
    let style = style(&store, FederationMode::Boundary);
    style.effect_mesh_fed_config(&mut mfc).await.unwrap();

    let mut se = ServiceExposition::new(
        "helloworld",
        ServiceExpositionSpec {
            name: "helloworld".to_string(),
            port: 5000,
            mesh_fed_config_selector: labels(&[("fed-config", "limited-trust")]),
            ..Default::default()
        },
    );
    se.metadata.namespace = Some(APP_NS.to_string());
    let mut se = store.create(&se).await.unwrap();

    // no load balancer address yet
    let err = style.effect_service_exposure(&mut se, &mfc).await.unwrap_err();
    assert!(matches!(err, Error::NotReady(_)));

    publish_load_balancer(&store, &mfc, "9.9.9.9").await;
    style.effect_service_exposure(&mut se, &mfc).await.unwrap();

    let stored: ServiceExposition = store.get(APP_NS, "helloworld").await.unwrap();
    assert!(stored.is_ready());
    assert_eq!(stored.spec.endpoints, vec!["9.9.9.9:15443"]);
    assert_eq!(store.count::<Gateway>(APP_NS).await, 1);
    assert_eq!(store.count::<VirtualService>(APP_NS).await, 1);

    style.remove_service_exposure(&stored, &mfc).await.unwrap();
    assert_eq!(store.count::<Gateway>(APP_NS).await, 0);
    assert_eq!(store.count::<VirtualService>(APP_NS).await, 0);
}

#[tokio::test]
async fn test_boundary_exposure_needs_ingress_gateway() {
    let store = Arc::new(MemoryStore::new());
    let mfc = boundary_config(&store, false, true).await;
    let mut se = ServiceExposition::new(
        "helloworld",
        ServiceExpositionSpec {
            name: "helloworld".to_string(),
            port: 5000,
            ..Default::default()
        },
    );
    se.metadata.namespace = Some(APP_NS.to_string());

    let err = style(&store, FederationMode::Boundary)
        .effect_service_exposure(&mut se, &mfc)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConfigError(_)));
}

// ============================================================================
// Boundary Protection: binding
// ============================================================================

#[tokio::test]
async fn test_boundary_binding_creates_and_removes_routing_objects() {
    let store = Arc::new(MemoryStore::new());
    let mfc = boundary_config(&store, false, true).await;
    let mut sb = store.create(&binding(&["10.0.0.7:15443"])).await.unwrap();
    let style = style(&store, FederationMode::Boundary);

    style.effect_service_binding(&mut sb, &mfc).await.unwrap();
    // a second pass converges on the same objects
    style.effect_service_binding(&mut sb, &mfc).await.unwrap();

    assert_eq!(store.count::<Service>(MESH_NS).await, 2);
    assert_eq!(store.count::<DestinationRule>(MESH_NS).await, 2);
    assert_eq!(store.count::<Gateway>(MESH_NS).await, 1);
    assert_eq!(store.count::<VirtualService>(MESH_NS).await, 1);
    assert_eq!(store.count::<Service>(APP_NS).await, 1);
    assert_eq!(store.count::<VirtualService>(APP_NS).await, 1);

    let remote: Service = store
        .get(MESH_NS, "limited-trust-reviews-bookinfo-remote")
        .await
        .unwrap();
    let spec = remote.spec.unwrap();
    assert_eq!(spec.type_.as_deref(), Some("ExternalName"));
    assert_eq!(spec.external_name.as_deref(), Some("10.0.0.7"));

    let gateway: Gateway = store
        .get(MESH_NS, "limited-trust-reviews-bookinfo-egress")
        .await
        .unwrap();
    assert_eq!(gateway.spec.servers[0].port.number, EGRESS_TLS_PORT);

    style.remove_service_binding(&sb, &mfc).await.unwrap();
    assert_eq!(store.count::<Service>(MESH_NS).await, 0);
    assert_eq!(store.count::<DestinationRule>(MESH_NS).await, 0);
    assert_eq!(store.count::<Gateway>(MESH_NS).await, 0);
    assert_eq!(store.count::<VirtualService>(MESH_NS).await, 0);
    assert_eq!(store.count::<Service>(APP_NS).await, 0);
    assert_eq!(store.count::<VirtualService>(APP_NS).await, 0);
}

#[tokio::test]
async fn test_boundary_alias_change_replaces_routing_objects() {
    let store = Arc::new(MemoryStore::new());
    let mfc = boundary_config(&store, false, true).await;
    let mut sb = store.create(&binding(&["10.0.0.7:15443"])).await.unwrap();
    let style = style(&store, FederationMode::Boundary);
    style.effect_service_binding(&mut sb, &mfc).await.unwrap();

    sb.spec.alias = Some("remote-reviews".to_string());
    style.effect_service_binding(&mut sb, &mfc).await.unwrap();

    assert_eq!(store.count::<Service>(MESH_NS).await, 2);
    assert_eq!(store.count::<DestinationRule>(MESH_NS).await, 2);
    assert_eq!(store.count::<Gateway>(MESH_NS).await, 1);
    assert_eq!(store.count::<VirtualService>(MESH_NS).await, 1);
    assert_eq!(store.count::<Service>(APP_NS).await, 1);
    assert_eq!(store.count::<VirtualService>(APP_NS).await, 1);
    assert!(store
        .get_opt::<Service>(APP_NS, "reviews")
        .await
        .unwrap()
        .is_none());
    assert!(store
        .get_opt::<Gateway>(MESH_NS, "limited-trust-reviews-bookinfo-egress")
        .await
        .unwrap()
        .is_none());
    let facade: Service = store.get(APP_NS, "remote-reviews").await.unwrap();
    assert_eq!(
        facade.metadata.labels.unwrap()[BINDING_LABEL],
        "bookinfo.reviews"
    );

    // removal after the rename leaves nothing behind
    style.remove_service_binding(&sb, &mfc).await.unwrap();
    assert_eq!(store.count::<Service>(MESH_NS).await, 0);
    assert_eq!(store.count::<DestinationRule>(MESH_NS).await, 0);
    assert_eq!(store.count::<Gateway>(MESH_NS).await, 0);
    assert_eq!(store.count::<VirtualService>(MESH_NS).await, 0);
    assert_eq!(store.count::<Service>(APP_NS).await, 0);
    assert_eq!(store.count::<VirtualService>(APP_NS).await, 0);
}

#[tokio::test]
async fn test_remove_binding_cleans_objects_under_a_previous_alias() {
    let store = Arc::new(MemoryStore::new());
    let mfc = boundary_config(&store, false, true).await;
    let mut sb = store.create(&binding(&["10.0.0.7:15443"])).await.unwrap();
    let style = style(&store, FederationMode::Boundary);
    style.effect_service_binding(&mut sb, &mfc).await.unwrap();

    // the alias changed but the binding is deleted before it is re-applied
    sb.spec.alias = Some("remote-reviews".to_string());
    style.remove_service_binding(&sb, &mfc).await.unwrap();

    assert_eq!(store.count::<Service>(MESH_NS).await, 0);
    assert_eq!(store.count::<Gateway>(MESH_NS).await, 0);
    assert_eq!(store.count::<Service>(APP_NS).await, 0);
    assert_eq!(store.count::<VirtualService>(APP_NS).await, 0);
}

#[tokio::test]
async fn test_binding_endpoint_cardinality() {
    let store = Arc::new(MemoryStore::new());
    let mfc = boundary_config(&store, false, true).await;
    let style = style(&store, FederationMode::Boundary);

    let mut none = binding(&[]);
    let err = style.effect_service_binding(&mut none, &mfc).await.unwrap_err();
    assert!(matches!(err, Error::NotReady(_)));

    let mut two = binding(&["10.0.0.7:15443", "10.0.0.8:15443"]);
    let err = style.effect_service_binding(&mut two, &mfc).await.unwrap_err();
    assert!(matches!(err, Error::ValidationError(_)));

    let mut garbled = binding(&["not-an-endpoint"]);
    let err = style
        .effect_service_binding(&mut garbled, &mfc)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidEndpoint(_)));
}

// ============================================================================
// Passthrough
// ============================================================================

async fn passthrough_config(store: &MemoryStore, ingress: bool) -> MeshFedConfig {
    let mut mfc = MeshFedConfig::new(
        "direct",
        MeshFedConfigSpec {
            mode: FederationMode::Passthrough,
            use_ingress_gateway: ingress,
            ..Default::default()
        },
    );
    mfc.metadata.namespace = Some(MESH_NS.to_string());
    store.create(&mfc).await.unwrap()
}

#[tokio::test]
async fn test_passthrough_rejects_gateways() {
    let store = Arc::new(MemoryStore::new());
    let mut mfc = passthrough_config(&store, true).await;
    let style = style(&store, FederationMode::Passthrough);

    let err = style.effect_mesh_fed_config(&mut mfc).await.unwrap_err();
    assert!(matches!(err, Error::Unimplemented(_)));

    let mut se = ServiceExposition::new(
        "helloworld",
        ServiceExpositionSpec {
            name: "helloworld".to_string(),
            port: 5000,
            ..Default::default()
        },
    );
    se.metadata.namespace = Some(APP_NS.to_string());
    let err = style.effect_service_exposure(&mut se, &mfc).await.unwrap_err();
    assert!(matches!(err, Error::Unimplemented(_)));
}

#[tokio::test]
async fn test_passthrough_exposure_keeps_declared_endpoints() {
    let store = Arc::new(MemoryStore::new());
    let mut mfc = passthrough_config(&store, false).await;
    let style = style(&store, FederationMode::Passthrough);
    style.effect_mesh_fed_config(&mut mfc).await.unwrap();

    let mut se = ServiceExposition::new(
        "helloworld",
        ServiceExpositionSpec {
            name: "helloworld".to_string(),
            port: 5000,
            endpoints: vec!["203.0.113.10:443".to_string()],
            ..Default::default()
        },
    );
    se.metadata.namespace = Some(APP_NS.to_string());
    let mut se = store.create(&se).await.unwrap();

    style.effect_service_exposure(&mut se, &mfc).await.unwrap();
    let stored: ServiceExposition = store.get(APP_NS, "helloworld").await.unwrap();
    assert!(stored.is_ready());
    assert_eq!(stored.spec.endpoints, vec!["203.0.113.10:443"]);
}

#[tokio::test]
async fn test_passthrough_binding_objects() {
    let store = Arc::new(MemoryStore::new());
    let mfc = passthrough_config(&store, false).await;
    let mut sb = store.create(&binding(&["10.0.0.7:15443"])).await.unwrap();
    let style = style(&store, FederationMode::Passthrough);

    style.effect_service_binding(&mut sb, &mfc).await.unwrap();

    let entry: ServiceEntry = store.get(APP_NS, "reviews").await.unwrap();
    assert_eq!(entry.spec.resolution, "STATIC");
    let rule: DestinationRule = store.get(APP_NS, "reviews").await.unwrap();
    let tls = rule.spec.traffic_policy.and_then(|p| p.tls).unwrap();
    assert_eq!(tls.mode, "MUTUAL");
    assert_eq!(tls.sni.as_deref(), Some("reviews.bookinfo.svc.cluster.local"));
    assert_eq!(store.count::<Service>(APP_NS).await, 1);

    style.remove_service_binding(&sb, &mfc).await.unwrap();
    assert_eq!(store.count::<ServiceEntry>(APP_NS).await, 0);
    assert_eq!(store.count::<DestinationRule>(APP_NS).await, 0);
    assert_eq!(store.count::<Service>(APP_NS).await, 0);
}

#[tokio::test]
async fn test_passthrough_alias_change_replaces_objects() {
    let store = Arc::new(MemoryStore::new());
    let mfc = passthrough_config(&store, false).await;
    let mut sb = store.create(&binding(&["10.0.0.7:15443"])).await.unwrap();
    let style = style(&store, FederationMode::Passthrough);
    style.effect_service_binding(&mut sb, &mfc).await.unwrap();

    sb.spec.alias = Some("remote-reviews".to_string());
    style.effect_service_binding(&mut sb, &mfc).await.unwrap();

    assert_eq!(store.count::<ServiceEntry>(APP_NS).await, 1);
    assert_eq!(store.count::<DestinationRule>(APP_NS).await, 1);
    assert_eq!(store.count::<Service>(APP_NS).await, 1);
    let entry: ServiceEntry = store.get(APP_NS, "remote-reviews").await.unwrap();
    assert_eq!(
        entry.spec.hosts,
        vec!["remote-reviews.bookinfo.svc.cluster.local"]
    );
}

// ============================================================================
// Upsert
// ============================================================================

#[tokio::test]
async fn test_upsert_twice_is_idempotent() {
    let store = MemoryStore::new();
    let mut gateway = Gateway::new("public", Default::default());
    gateway.metadata.namespace = Some(APP_NS.to_string());
    gateway.spec.selector = labels(&[("istio", "ingressgateway")]);

    store.create(&gateway).await.unwrap();
    let second = upsert(&store, &gateway).await.unwrap();

    assert_eq!(second.spec, gateway.spec);
    let stored: Gateway = store.get(APP_NS, "public").await.unwrap();
    assert_eq!(stored.spec, gateway.spec);
    assert_eq!(store.count::<Gateway>(APP_NS).await, 1);
}
