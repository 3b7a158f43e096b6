//! End-to-end federation flow between two meshes, each backed by its own
//! in-memory store

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    LoadBalancerIngress, LoadBalancerStatus, Secret, Service, ServiceStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use mesh_federation::config::Settings;
use mesh_federation::controller::{reconcile_object, Context, Federated, Outcome};
use mesh_federation::crd::istio::{DestinationRule, Gateway, VirtualService};
use mesh_federation::crd::{
    Labels, MeshFedConfig, MeshFedConfigSpec, ServiceBinding, ServiceExposition,
    ServiceExpositionSpec,
};
use mesh_federation::discovery::{apply_snapshot, peer_channel, snapshot, PeerReceiver, UpdateNotifier};
use mesh_federation::store::{MemoryStore, ObjectStore, StoreObject};
use tokio::sync::mpsc;

const MESH_NS: &str = "istio-system";
const APP_NS: &str = "bookinfo";
const CONFIG: &str = "limited-trust";

struct Mesh {
    ctx: Context<MemoryStore>,
    updates: mpsc::Receiver<()>,
    _peers: PeerReceiver,
}

impl Mesh {
    fn new(name: &str) -> Self {
        let (notifier, updates) = UpdateNotifier::channel();
        let (peers_tx, peers) = peer_channel();
        let settings = Settings {
            mesh_name: name.to_string(),
            namespace: APP_NS.to_string(),
            ..Default::default()
        };
        Self {
            ctx: Context::new(
                Arc::new(MemoryStore::new()),
                Arc::new(settings),
                notifier,
                peers_tx,
            ),
            updates,
            _peers: peers,
        }
    }

    fn store(&self) -> &MemoryStore {
        self.ctx.store.as_ref()
    }

    /// Reconcile until the object settles on an applied or terminal outcome
    async fn settle<K: Federated>(&self, namespace: &str, name: &str) -> Outcome {
        let mut outcome = Outcome::Idle;
        for _ in 0..3 {
            outcome = reconcile_object::<K, _>(&self.ctx, namespace, name)
                .await
                .unwrap();
            if outcome != Outcome::FinalizerAdded {
                break;
            }
        }
        outcome
    }

    async fn count<K: StoreObject>(&self, namespace: &str) -> usize {
        self.store().count::<K>(namespace).await
    }
}

fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn install_boundary_config(mesh: &Mesh, ingress: bool, egress: bool) {
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some("limited-trust-certs".to_string()),
            namespace: Some(MESH_NS.to_string()),
            labels: Some(labels(&[("mesh-certs", CONFIG)])),
            ..Default::default()
        },
        ..Default::default()
    };
    mesh.store().create(&secret).await.unwrap();

    let mut mfc = MeshFedConfig::new(
        CONFIG,
        MeshFedConfigSpec {
            use_ingress_gateway: ingress,
            use_egress_gateway: egress,
            tls_context_selector: labels(&[("mesh-certs", CONFIG)]),
            ..Default::default()
        },
    );
    mfc.metadata.namespace = Some(MESH_NS.to_string());
    mfc.metadata.labels = Some(labels(&[("fed-config", CONFIG)]));
    mesh.store().create(&mfc).await.unwrap();

    assert_eq!(
        mesh.settle::<MeshFedConfig>(MESH_NS, CONFIG).await,
        Outcome::Applied
    );
}

async fn publish_ingress_address(mesh: &Mesh, ip: &str) {
    let mut gateway: Service = mesh
        .store()
        .get(MESH_NS, "istio-limited-trust-ingress-15443")
        .await
        .unwrap();
    gateway.status = Some(ServiceStatus {
        load_balancer: Some(LoadBalancerStatus {
            ingress: Some(vec![LoadBalancerIngress {
                ip: Some(ip.to_string()),
                ..Default::default()
            }]),
        }),
        ..Default::default()
    });
    mesh.store().update_status(&gateway).await.unwrap();
}

async fn expose_reviews(mesh: &Mesh) {
    let mut se = ServiceExposition::new(
        "reviews",
        ServiceExpositionSpec {
            name: "reviews".to_string(),
            alias: Some("public-reviews".to_string()),
            port: 9080,
            mesh_fed_config_selector: labels(&[("fed-config", CONFIG)]),
            ..Default::default()
        },
    );
    se.metadata.namespace = Some(APP_NS.to_string());
    mesh.store().create(&se).await.unwrap();
}

#[tokio::test]
async fn test_exposure_is_announced_and_bound_in_partner_mesh() {
    // Mesh A exposes reviews behind its ingress gateway
    let mut mesh_a = Mesh::new("mesh-a");
    install_boundary_config(&mesh_a, true, false).await;
    publish_ingress_address(&mesh_a, "9.9.9.9").await;
    expose_reviews(&mesh_a).await;

    assert_eq!(
        mesh_a.settle::<ServiceExposition>(APP_NS, "reviews").await,
        Outcome::Applied
    );
    assert!(mesh_a.updates.try_recv().is_ok());

    let se: ServiceExposition = mesh_a.store().get(APP_NS, "reviews").await.unwrap();
    assert!(se.is_ready());
    assert_eq!(se.spec.endpoints, vec!["9.9.9.9:15443"]);

    let announced = snapshot(mesh_a.store(), "mesh-a").await.unwrap();
    assert_eq!(announced.exposed_services.len(), 1);
    assert_eq!(announced.exposed_services[0].name, "public-reviews");

    // Mesh B binds it through its egress gateway
    let mesh_b = Mesh::new("mesh-b");
    install_boundary_config(&mesh_b, false, true).await;
    assert_eq!(
        apply_snapshot(mesh_b.store(), APP_NS, &announced).await.unwrap(),
        1
    );

    assert_eq!(
        mesh_b.settle::<ServiceBinding>(APP_NS, "public-reviews").await,
        Outcome::Applied
    );
    let remote: Service = mesh_b
        .store()
        .get(MESH_NS, "limited-trust-public-reviews-bookinfo-remote")
        .await
        .unwrap();
    assert_eq!(
        remote.spec.and_then(|s| s.external_name).as_deref(),
        Some("9.9.9.9")
    );
    assert_eq!(mesh_b.count::<Gateway>(MESH_NS).await, 1);
    assert_eq!(mesh_b.count::<DestinationRule>(MESH_NS).await, 2);
    assert_eq!(mesh_b.count::<VirtualService>(MESH_NS).await, 1);
    assert_eq!(mesh_b.count::<VirtualService>(APP_NS).await, 1);
    // the local facade clients call
    assert!(mesh_b
        .store()
        .get_opt::<Service>(APP_NS, "public-reviews")
        .await
        .unwrap()
        .is_some());

    // Deleting the binding tears everything down before it is purged
    mesh_b
        .store()
        .delete::<ServiceBinding>(APP_NS, "public-reviews")
        .await
        .unwrap();
    assert_eq!(
        mesh_b.settle::<ServiceBinding>(APP_NS, "public-reviews").await,
        Outcome::Cleaned
    );
    assert_eq!(mesh_b.count::<ServiceBinding>(APP_NS).await, 0);
    assert_eq!(mesh_b.count::<Gateway>(MESH_NS).await, 0);
    assert_eq!(mesh_b.count::<DestinationRule>(MESH_NS).await, 0);
    assert_eq!(mesh_b.count::<VirtualService>(MESH_NS).await, 0);
    assert_eq!(mesh_b.count::<VirtualService>(APP_NS).await, 0);
    assert_eq!(mesh_b.count::<Service>(APP_NS).await, 0);
}

#[tokio::test]
async fn test_exposure_waits_for_load_balancer_address() {
    let mesh = Mesh::new("mesh-a");
    install_boundary_config(&mesh, true, false).await;
    expose_reviews(&mesh).await;

    assert_eq!(
        reconcile_object::<ServiceExposition, _>(&mesh.ctx, APP_NS, "reviews")
            .await
            .unwrap(),
        Outcome::FinalizerAdded
    );
    let err = reconcile_object::<ServiceExposition, _>(&mesh.ctx, APP_NS, "reviews")
        .await
        .unwrap_err();
    assert!(err.is_retriable());

    publish_ingress_address(&mesh, "9.9.9.9").await;
    assert_eq!(
        reconcile_object::<ServiceExposition, _>(&mesh.ctx, APP_NS, "reviews")
            .await
            .unwrap(),
        Outcome::Applied
    );
}

#[tokio::test]
async fn test_exposure_created_before_its_config_converges() {
    let mesh = Mesh::new("mesh-a");
    expose_reviews(&mesh).await;

    assert_eq!(
        mesh.settle::<ServiceExposition>(APP_NS, "reviews").await,
        Outcome::Waiting
    );

    install_boundary_config(&mesh, true, false).await;
    publish_ingress_address(&mesh, "9.9.9.9").await;
    assert_eq!(
        mesh.settle::<ServiceExposition>(APP_NS, "reviews").await,
        Outcome::Applied
    );
}

#[tokio::test]
async fn test_deleting_config_cascades_to_gateway_workload() {
    let mesh = Mesh::new("mesh-a");
    install_boundary_config(&mesh, true, false).await;
    assert_eq!(mesh.count::<Deployment>(MESH_NS).await, 1);

    mesh.store()
        .delete::<MeshFedConfig>(MESH_NS, CONFIG)
        .await
        .unwrap();
    assert_eq!(
        mesh.settle::<MeshFedConfig>(MESH_NS, CONFIG).await,
        Outcome::Cleaned
    );

    assert_eq!(mesh.count::<MeshFedConfig>(MESH_NS).await, 0);
    assert_eq!(mesh.count::<Deployment>(MESH_NS).await, 0);
    assert!(mesh
        .store()
        .get_opt::<Service>(MESH_NS, "istio-limited-trust-ingress-15443")
        .await
        .unwrap()
        .is_none());
}
