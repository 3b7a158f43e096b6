//! Inter-mesh discovery bridge
//!
//! An exposing mesh runs a [`DiscoveryServer`] that streams its ready
//! ServiceExpositions to every connected peer. A binding mesh runs one
//! [`DiscoveryClient`] session per discovery-labelled Service, managed by the
//! [`Supervisor`], and turns every snapshot into ServiceBindings.
//!
//! The channels tying the bridge to the reconcilers are created by the
//! composition root and passed down explicitly.

pub mod client;
pub mod proto;
pub mod server;
mod snapshot;
pub mod supervisor;

use tokio::sync::mpsc;

pub use client::{Backoff, DiscoveryClient};
pub use server::DiscoveryServer;
pub use snapshot::{apply_snapshot, snapshot};
pub use supervisor::{SessionSpawner, Supervisor};

/// Address change of a discovery peer, published by the Service reconciler
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    /// Start a session, or restart it when the address changed
    Upsert { peer: String, address: String },
    /// Stop the session if one is running
    Removed { peer: String },
}

pub type PeerSender = mpsc::UnboundedSender<PeerEvent>;
pub type PeerReceiver = mpsc::UnboundedReceiver<PeerEvent>;

/// Unbounded so the Service reconciler never blocks on a slow supervisor
pub fn peer_channel() -> (PeerSender, PeerReceiver) {
    mpsc::unbounded_channel()
}

/// Wakes the server broadcaster after an exposure or binding changed
///
/// Backed by a capacity-1 channel: while a wake-up is pending further
/// notifications coalesce into it, and `notify` never blocks.
#[derive(Clone, Debug)]
pub struct UpdateNotifier {
    tx: mpsc::Sender<()>,
}

impl UpdateNotifier {
    pub fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    pub fn notify(&self) {
        // Full means a wake-up is already pending; closed means no server runs
        let _ = self.tx.try_send(());
    }
}
