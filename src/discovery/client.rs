//! Binding side of the discovery bridge

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Endpoint;
use tracing::{debug, info, warn};

use super::proto::service_discovery_client::ServiceDiscoveryClient;
use super::proto::DiscoveryRequest;
use super::snapshot::apply_snapshot;
use crate::error::{Error, Result};
use crate::store::ObjectStore;

/// Bound on establishing the transport to a peer
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnect delay policy
#[derive(Clone, Debug)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    /// Exponential delay for `attempt` (0-indexed), capped at `max`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.min(16));
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// [`Backoff::delay`] scaled by a random factor in 0.5..1.5
    pub fn jittered(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(self.delay(attempt).as_secs_f64() * jitter)
    }
}

/// How a session ended when it did not fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionEnd {
    Cancelled,
    /// The server closed the stream after at least one snapshot
    Closed,
}

/// Dials a partner's discovery server and writes what it announces as
/// ServiceBindings into the local namespace
pub struct DiscoveryClient<S> {
    store: Arc<S>,
    namespace: String,
    mesh_name: String,
    backoff: Backoff,
}

impl<S> Clone for DiscoveryClient<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            namespace: self.namespace.clone(),
            mesh_name: self.mesh_name.clone(),
            backoff: self.backoff.clone(),
        }
    }
}

impl<S: ObjectStore> DiscoveryClient<S> {
    pub fn new(store: Arc<S>, namespace: impl Into<String>, mesh_name: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            mesh_name: mesh_name.into(),
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Keep a session to `address` alive until `cancel` fires
    ///
    /// A failed dial or a broken stream is retried after a jittered
    /// exponential delay. A stream the server closed cleanly resets the delay.
    pub async fn run(self, peer: String, address: String, cancel: CancellationToken) {
        let mut attempt = 0u32;
        loop {
            match self.session(&address, &cancel).await {
                Ok(SessionEnd::Cancelled) => break,
                Ok(SessionEnd::Closed) => {
                    info!("Discovery peer {} at {} closed the stream", peer, address);
                    attempt = 0;
                }
                Err(e) => {
                    warn!(
                        "Discovery session to {} at {} failed: {}",
                        peer, address, e
                    );
                }
            }

            let delay = self.backoff.jittered(attempt);
            attempt = attempt.saturating_add(1);
            debug!(
                "Reconnecting to discovery peer {} in {}ms",
                peer,
                delay.as_millis()
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("Discovery session to {} stopped", peer);
    }

    /// One dial, hello and snapshot loop
    async fn session(&self, address: &str, cancel: &CancellationToken) -> Result<SessionEnd> {
        let endpoint = Endpoint::from_shared(address.to_string())
            .map_err(|_| Error::InvalidEndpoint(address.to_string()))?
            .connect_timeout(DIAL_TIMEOUT);

        let channel = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            channel = endpoint.connect() => channel?,
        };
        let mut client = ServiceDiscoveryClient::new(channel);

        // The sender must outlive the loop or the server sees end of stream
        let (hello_tx, hello_rx) = mpsc::channel(1);
        hello_tx
            .send(DiscoveryRequest {
                name: self.mesh_name.clone(),
            })
            .await
            .map_err(|_| Error::Stream("request stream closed before hello".to_string()))?;

        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            response = client.discover(ReceiverStream::new(hello_rx)) => response?,
        };
        let mut inbound = response.into_inner();
        info!("Discovery session to {} established", address);

        #[cfg(feature = "metrics")]
        crate::controller::metrics::add_discovery_sessions("client", 1);
        let end = self.receive(&mut inbound, cancel).await;
        #[cfg(feature = "metrics")]
        crate::controller::metrics::add_discovery_sessions("client", -1);

        drop(hello_tx);
        end
    }

    async fn receive(
        &self,
        inbound: &mut tonic::Streaming<super::proto::ServiceList>,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd> {
        let mut received = false;
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                message = inbound.message() => message?,
            };
            let Some(list) = message else {
                return if received {
                    Ok(SessionEnd::Closed)
                } else {
                    Err(Error::Stream("stream closed before first snapshot".to_string()))
                };
            };
            received = true;

            match apply_snapshot(self.store.as_ref(), &self.namespace, &list).await {
                Ok(count) => debug!("Applied snapshot from {} ({} services)", list.name, count),
                Err(e) => warn!("Failed to apply snapshot from {}: {}", list.name, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = Backoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        };
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(4), Duration::from_secs(16));
        // capped
        assert_eq!(backoff.delay(5), Duration::from_secs(30));
        assert_eq!(backoff.delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_half_and_one_and_a_half() {
        let backoff = Backoff::default();
        for _ in 0..100 {
            let delay = backoff.jittered(2);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(6));
        }
    }

    #[tokio::test]
    async fn test_invalid_address_is_rejected() {
        let client = DiscoveryClient::new(
            Arc::new(crate::store::MemoryStore::new()),
            "bookinfo",
            "mesh-b",
        );
        let cancel = CancellationToken::new();
        let err = client.session("not a uri", &cancel).await.unwrap_err();
        assert!(matches!(err, Error::InvalidEndpoint(_)));
    }

    #[tokio::test]
    async fn test_cancelled_run_returns() {
        let client = DiscoveryClient::new(
            Arc::new(crate::store::MemoryStore::new()),
            "bookinfo",
            "mesh-b",
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(
            Duration::from_secs(5),
            client.run("peer".to_string(), "http://127.0.0.1:1".to_string(), cancel),
        )
        .await
        .expect("run returns once cancelled");
    }
}
