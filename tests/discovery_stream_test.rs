//! Discovery bridge over a loopback gRPC connection

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mesh_federation::crd::{
    Labels, ServiceBinding, ServiceExposition, ServiceExpositionSpec, ServiceExpositionStatus,
};
use mesh_federation::discovery::proto::service_discovery_client::ServiceDiscoveryClient;
use mesh_federation::discovery::proto::DiscoveryRequest;
use mesh_federation::discovery::{
    peer_channel, Backoff, DiscoveryClient, DiscoveryServer, PeerEvent, Supervisor,
    UpdateNotifier,
};
use mesh_federation::store::{MemoryStore, ObjectStore};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;

const APP_NS: &str = "bookinfo";

fn selector() -> Labels {
    Labels::from([("fed-config".to_string(), "limited-trust".to_string())])
}

async fn ready_exposition(store: &MemoryStore, name: &str, alias: Option<&str>) {
    let mut se = ServiceExposition::new(
        name,
        ServiceExpositionSpec {
            name: name.to_string(),
            alias: alias.map(str::to_string),
            port: 9080,
            mesh_fed_config_selector: selector(),
            endpoints: vec!["9.9.9.9:15443".to_string()],
            ..Default::default()
        },
    );
    se.metadata.namespace = Some(APP_NS.to_string());
    let mut se = store.create(&se).await.unwrap();
    se.status = Some(ServiceExpositionStatus { ready: true });
    store.update_status(&se).await.unwrap();
}

/// Poll until `store` holds `count` bindings or ten seconds pass
async fn wait_for_bindings(store: &MemoryStore, count: usize) {
    for _ in 0..200 {
        if store.count::<ServiceBinding>(APP_NS).await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {} binding(s)", count);
}

async fn wait_for_sessions(server: &DiscoveryServer<MemoryStore>, count: usize) {
    for _ in 0..200 {
        if server.session_count().await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {} session(s)", count);
}

struct Exposer {
    store: Arc<MemoryStore>,
    server: DiscoveryServer<MemoryStore>,
    notifier: UpdateNotifier,
    address: String,
    cancel: CancellationToken,
}

async fn start_exposer() -> Exposer {
    let store = Arc::new(MemoryStore::new());
    let server = DiscoveryServer::new(store.clone(), "mesh-a");
    let (notifier, updates): (UpdateNotifier, mpsc::Receiver<()>) = UpdateNotifier::channel();
    let cancel = CancellationToken::new();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(server.clone().serve_with_incoming(
        TcpListenerStream::new(listener),
        updates,
        cancel.clone(),
    ));

    Exposer {
        store,
        server,
        notifier,
        address: format!("http://{}", addr),
        cancel,
    }
}

fn fast_backoff() -> Backoff {
    Backoff {
        initial: Duration::from_millis(50),
        max: Duration::from_millis(200),
    }
}

#[tokio::test]
async fn test_client_binds_announced_services_and_follows_broadcasts() {
    let exposer = start_exposer().await;
    ready_exposition(&exposer.store, "reviews", Some("public-reviews")).await;

    let binder = Arc::new(MemoryStore::new());
    let client = DiscoveryClient::new(binder.clone(), APP_NS, "mesh-b").with_backoff(fast_backoff());
    let session_cancel = CancellationToken::new();
    let session = tokio::spawn(client.run(
        "istio-system/mesh-a".to_string(),
        exposer.address.clone(),
        session_cancel.clone(),
    ));

    wait_for_bindings(&binder, 1).await;
    let sb: ServiceBinding = binder.get(APP_NS, "public-reviews").await.unwrap();
    assert_eq!(sb.spec.name, "public-reviews");
    assert_eq!(sb.spec.port, 9080);
    assert_eq!(sb.spec.mesh_fed_config_selector, selector());
    assert_eq!(sb.spec.endpoints, vec!["9.9.9.9:15443"]);
    assert_eq!(exposer.server.session_count().await, 1);

    // a new exposure is pushed without the client asking
    ready_exposition(&exposer.store, "ratings", None).await;
    exposer.notifier.notify();
    wait_for_bindings(&binder, 2).await;

    session_cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), session)
        .await
        .expect("session stops when cancelled")
        .unwrap();
    wait_for_sessions(&exposer.server, 0).await;

    exposer.cancel.cancel();
}

#[tokio::test]
async fn test_unready_exposures_are_not_announced() {
    let exposer = start_exposer().await;
    ready_exposition(&exposer.store, "reviews", None).await;
    let mut pending = ServiceExposition::new(
        "details",
        ServiceExpositionSpec {
            name: "details".to_string(),
            port: 9080,
            mesh_fed_config_selector: selector(),
            ..Default::default()
        },
    );
    pending.metadata.namespace = Some(APP_NS.to_string());
    exposer.store.create(&pending).await.unwrap();

    let binder = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();
    tokio::spawn(
        DiscoveryClient::new(binder.clone(), APP_NS, "mesh-b")
            .with_backoff(fast_backoff())
            .run("peer".to_string(), exposer.address.clone(), cancel.clone()),
    );

    wait_for_bindings(&binder, 1).await;
    assert!(binder
        .get_opt::<ServiceBinding>(APP_NS, "details")
        .await
        .unwrap()
        .is_none());

    cancel.cancel();
    exposer.cancel.cancel();
}

#[tokio::test]
async fn test_client_retries_until_server_appears() {
    // reserve a port, then release it so the first dials are refused
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let binder = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();
    tokio::spawn(
        DiscoveryClient::new(binder.clone(), APP_NS, "mesh-b")
            .with_backoff(fast_backoff())
            .run("peer".to_string(), format!("http://{}", addr), cancel.clone()),
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    let store = Arc::new(MemoryStore::new());
    ready_exposition(&store, "reviews", None).await;
    let (_notifier, updates) = UpdateNotifier::channel();
    let server_cancel = CancellationToken::new();
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(DiscoveryServer::new(store, "mesh-a").serve_with_incoming(
        TcpListenerStream::new(listener),
        updates,
        server_cancel.clone(),
    ));

    wait_for_bindings(&binder, 1).await;

    cancel.cancel();
    server_cancel.cancel();
}

#[tokio::test]
async fn test_supervisor_drives_sessions_from_peer_events() {
    let exposer = start_exposer().await;
    ready_exposition(&exposer.store, "reviews", Some("public-reviews")).await;

    let binder = Arc::new(MemoryStore::new());
    let sessions = DiscoveryClient::new(binder.clone(), APP_NS, "mesh-b").with_backoff(fast_backoff());
    let (peers, peer_rx) = peer_channel();
    let cancel = CancellationToken::new();
    let supervisor = tokio::spawn(Supervisor::new(sessions).run(peer_rx, cancel.clone()));

    peers
        .send(PeerEvent::Upsert {
            peer: "istio-system/mesh-a".to_string(),
            address: exposer.address.clone(),
        })
        .unwrap();
    wait_for_bindings(&binder, 1).await;
    wait_for_sessions(&exposer.server, 1).await;

    peers
        .send(PeerEvent::Removed {
            peer: "istio-system/mesh-a".to_string(),
        })
        .unwrap();
    wait_for_sessions(&exposer.server, 0).await;

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), supervisor)
        .await
        .expect("supervisor stops when cancelled")
        .unwrap();
    exposer.cancel.cancel();
}

#[tokio::test]
async fn test_peer_that_stops_reading_has_its_stream_closed() {
    let exposer = start_exposer().await;
    ready_exposition(&exposer.store, "reviews", None).await;

    let channel = tonic::transport::Endpoint::from_shared(exposer.address.clone())
        .unwrap()
        .connect()
        .await
        .unwrap();
    let (hello_tx, hello_rx) = mpsc::channel(1);
    hello_tx
        .send(DiscoveryRequest {
            name: "mesh-b".to_string(),
        })
        .await
        .unwrap();
    let mut inbound = ServiceDiscoveryClient::new(channel)
        .discover(ReceiverStream::new(hello_rx))
        .await
        .unwrap()
        .into_inner();
    wait_for_sessions(&exposer.server, 1).await;

    // nothing is read, so the per-peer buffer fills and the session is dropped
    for _ in 0..500 {
        if exposer.server.session_count().await == 0 {
            break;
        }
        exposer.server.broadcast().await.unwrap();
    }
    assert_eq!(exposer.server.session_count().await, 0);

    // the dropped peer must see its stream end so it can redial
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Ok(Some(_)) = inbound.message().await {}
    })
    .await
    .expect("stream of a dropped session ends");

    drop(hello_tx);
    exposer.cancel.cancel();
}
