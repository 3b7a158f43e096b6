//! Exposing side of the discovery bridge

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Connected;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use super::proto::service_discovery_server::{ServiceDiscovery, ServiceDiscoveryServer};
use super::proto::{DiscoveryRequest, ServiceList};
use super::snapshot::snapshot;
use crate::error::Result;
use crate::store::ObjectStore;

/// Outbound buffer per peer; a peer that falls this far behind is dropped
const SESSION_BUFFER: usize = 16;

type SessionSender = mpsc::Sender<Result<ServiceList, Status>>;

/// A connected peer: its outbound queue and the signal that ends its stream
struct Session {
    tx: SessionSender,
    close: CancellationToken,
}

/// gRPC service streaming ServiceExposition snapshots to partner meshes
///
/// Every inbound request is answered with a fresh snapshot on that peer's
/// stream. Every wake-up on the update channel sends one snapshot to all
/// connected peers.
pub struct DiscoveryServer<S> {
    store: Arc<S>,
    mesh_name: String,
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    next_anonymous: Arc<AtomicU64>,
}

impl<S> Clone for DiscoveryServer<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            mesh_name: self.mesh_name.clone(),
            sessions: self.sessions.clone(),
            next_anonymous: self.next_anonymous.clone(),
        }
    }
}

impl<S: ObjectStore> DiscoveryServer<S> {
    pub fn new(store: Arc<S>, mesh_name: impl Into<String>) -> Self {
        Self {
            store,
            mesh_name: mesh_name.into(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_anonymous: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Send one snapshot to every connected peer. Returns how many peers got it.
    pub async fn broadcast(&self) -> Result<usize> {
        let list = snapshot(self.store.as_ref(), &self.mesh_name).await?;

        let mut sessions = self.sessions.lock().await;
        let mut delivered = 0;
        sessions.retain(|peer, session| match session.tx.try_send(Ok(list.clone())) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Discovery peer {} is not keeping up, closing its stream", peer);
                session.close.cancel();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                session.close.cancel();
                false
            }
        });

        debug!(
            "Broadcast {} exposed service(s) to {} peer(s)",
            list.exposed_services.len(),
            delivered
        );
        Ok(delivered)
    }

    /// Run [`DiscoveryServer::broadcast`] on every update wake-up until cancelled
    pub fn spawn_broadcaster(
        &self,
        mut updates: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    update = updates.recv() => {
                        if update.is_none() {
                            break;
                        }
                        if let Err(e) = server.broadcast().await {
                            warn!("Discovery broadcast failed: {}", e);
                        }
                    }
                }
            }
            debug!("Discovery broadcaster stopped");
        })
    }

    /// Serve on `addr` until `cancel` fires, broadcasting on `updates`
    pub async fn serve(
        self,
        addr: SocketAddr,
        updates: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let broadcaster = self.spawn_broadcaster(updates, cancel.clone());
        info!("Discovery server listening on {}", addr);

        let served = tonic::transport::Server::builder()
            .add_service(ServiceDiscoveryServer::new(self))
            .serve_with_shutdown(addr, cancel.cancelled_owned())
            .await;

        broadcaster.abort();
        served?;
        info!("Discovery server stopped");
        Ok(())
    }

    /// Like [`DiscoveryServer::serve`] over an already bound listener
    pub async fn serve_with_incoming<I, IO, IE>(
        self,
        incoming: I,
        updates: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        I: futures::Stream<Item = std::result::Result<IO, IE>>,
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Connected + Unpin + Send + 'static,
        IO::ConnectInfo: Clone + Send + Sync + 'static,
        IE: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let broadcaster = self.spawn_broadcaster(updates, cancel.clone());

        let served = tonic::transport::Server::builder()
            .add_service(ServiceDiscoveryServer::new(self))
            .serve_with_incoming_shutdown(incoming, cancel.cancelled_owned())
            .await;

        broadcaster.abort();
        served?;
        Ok(())
    }

    fn peer_key<T>(&self, request: &Request<T>) -> String {
        match request.remote_addr() {
            Some(addr) => addr.to_string(),
            None => format!(
                "anonymous-{}",
                self.next_anonymous.fetch_add(1, Ordering::Relaxed)
            ),
        }
    }
}

#[tonic::async_trait]
impl<S: ObjectStore> ServiceDiscovery for DiscoveryServer<S> {
    type DiscoverStream = Pin<Box<dyn Stream<Item = Result<ServiceList, Status>> + Send>>;

    async fn discover(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::DiscoverStream>, Status> {
        let peer = self.peer_key(&request);
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        let close = CancellationToken::new();

        let replaced = self.sessions.lock().await.insert(
            peer.clone(),
            Session {
                tx: tx.clone(),
                close: close.clone(),
            },
        );
        if let Some(previous) = replaced {
            previous.close.cancel();
        }
        #[cfg(feature = "metrics")]
        crate::controller::metrics::add_discovery_sessions("server", 1);
        info!("Discovery peer {} connected", peer);

        let server = self.clone();
        let session_close = close.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = session_close.cancelled() => break,
                    message = inbound.next() => message,
                };
                match message {
                    Some(Ok(hello)) => {
                        debug!("Discovery request from {} ({})", peer, hello.name);
                        let reply = snapshot(server.store.as_ref(), &server.mesh_name)
                            .await
                            .map_err(|e| Status::unavailable(e.to_string()));
                        let sent = tokio::select! {
                            _ = session_close.cancelled() => false,
                            sent = tx.send(reply) => sent.is_ok(),
                        };
                        if !sent {
                            break;
                        }
                    }
                    Some(Err(status)) => {
                        debug!("Discovery peer {} stream ended: {}", peer, status);
                        break;
                    }
                    None => break,
                }
            }

            // ends the outbound stream so the peer sees the close and redials
            session_close.cancel();
            let mut sessions = server.sessions.lock().await;
            if sessions
                .get(&peer)
                .is_some_and(|current| current.tx.same_channel(&tx))
            {
                sessions.remove(&peer);
            }
            drop(sessions);
            #[cfg(feature = "metrics")]
            crate::controller::metrics::add_discovery_sessions("server", -1);
            info!("Discovery peer {} disconnected", peer);
        });

        let outbound: Self::DiscoverStream =
            Box::pin(ReceiverStream::new(rx).take_until(close.cancelled_owned()));
        Ok(Response::new(outbound))
    }
}
