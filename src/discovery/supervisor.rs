//! One discovery session per peer, replaced when the peer's address changes

use std::collections::HashMap;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::client::DiscoveryClient;
use super::{PeerEvent, PeerReceiver};
use crate::store::ObjectStore;

/// Starts the task backing a session. The task must return soon after
/// `cancel` fires.
pub trait SessionSpawner: Send + Sync + 'static {
    fn spawn(&self, peer: &str, address: &str, cancel: CancellationToken) -> JoinHandle<()>;
}

impl<S: ObjectStore> SessionSpawner for DiscoveryClient<S> {
    fn spawn(&self, peer: &str, address: &str, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(
            self.clone()
                .run(peer.to_string(), address.to_string(), cancel),
        )
    }
}

struct Session {
    address: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Session {
    /// Cancel and wait for the task to finish
    async fn stop(self, peer: &str) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Discovery session for {} ended abnormally: {}", peer, e);
        }
    }
}

/// Consumes [`PeerEvent`]s and keeps at most one live session per peer
///
/// Events are handled one at a time, so an old session has fully stopped
/// before its replacement is started.
pub struct Supervisor<P> {
    spawner: P,
    sessions: HashMap<String, Session>,
}

impl<P: SessionSpawner> Supervisor<P> {
    pub fn new(spawner: P) -> Self {
        Self {
            spawner,
            sessions: HashMap::new(),
        }
    }

    /// Address of the live session for `peer`
    pub fn address_of(&self, peer: &str) -> Option<&str> {
        self.sessions.get(peer).map(|s| s.address.as_str())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub async fn handle(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Upsert { peer, address } => {
                if let Some(current) = self.sessions.get(&peer) {
                    if current.address == address && !current.handle.is_finished() {
                        return;
                    }
                }
                if let Some(old) = self.sessions.remove(&peer) {
                    info!(
                        "Discovery peer {} moved from {} to {}",
                        peer, old.address, address
                    );
                    old.stop(&peer).await;
                }
                self.start(peer, address);
            }
            PeerEvent::Removed { peer } => {
                if let Some(old) = self.sessions.remove(&peer) {
                    info!("Discovery peer {} removed", peer);
                    old.stop(&peer).await;
                }
            }
        }
    }

    fn start(&mut self, peer: String, address: String) {
        info!("Starting discovery session to {} at {}", peer, address);
        let cancel = CancellationToken::new();
        let handle = self.spawner.spawn(&peer, &address, cancel.clone());
        self.sessions.insert(
            peer,
            Session {
                address,
                cancel,
                handle,
            },
        );
    }

    /// Stop every session
    pub async fn shutdown(&mut self) {
        for (peer, session) in self.sessions.drain() {
            session.stop(&peer).await;
        }
    }

    /// Handle events until the channel closes or `cancel` fires
    pub async fn run(mut self, mut events: PeerReceiver, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }
        self.shutdown().await;
        info!("Discovery supervisor stopped");
    }
}
