use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::warn;

use crate::error::TransportError;
use crate::{Envelope, Inbound, Transport, SEND_TIMEOUT};

/// Bound on one peer's inbound queue. A slow or stuck peer backs up here
/// rather than blocking the sender indefinitely; `send` still respects
/// `SEND_TIMEOUT` on top of this.
const PEER_QUEUE_CAPACITY: usize = 256;

/// Shared registry of in-process peer inboxes, keyed by the same address
/// strings used in `ShardConfig::replica_nodes`. One `LocalNetwork` is
/// shared by every `LocalTransport` in a test or single-process deployment.
#[derive(Default)]
pub struct LocalNetwork {
    inboxes: DashMap<String, mpsc::Sender<Envelope>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        LocalNetwork {
            inboxes: DashMap::new(),
        }
    }

    /// Register `address` as a reachable peer and return the receiving end
    /// of its inbox. Call once per node at startup; the returned receiver
    /// is normally driven by `run_inbound_loop`.
    pub fn register(&self, address: impl Into<String>) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
        self.inboxes.insert(address.into(), tx);
        rx
    }

    fn sender_for(&self, peer: &str) -> Option<mpsc::Sender<Envelope>> {
        self.inboxes.get(peer).map(|e| e.value().clone())
    }
}

/// A `Transport` backed by a shared in-process `LocalNetwork`. Every send
/// goes through an owned clone of the target's channel sender; there is no
/// real dial step, so `DIAL_TIMEOUT` never applies here.
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    self_address: String,
    health: DashMap<String, bool>,
}

impl LocalTransport {
    pub fn new(network: Arc<LocalNetwork>, self_address: impl Into<String>) -> Self {
        LocalTransport {
            network,
            self_address: self_address.into(),
            health: DashMap::new(),
        }
    }

    pub fn self_address(&self) -> &str {
        &self.self_address
    }

    fn mark(&self, peer: &str, healthy: bool) {
        self.health.insert(peer.to_string(), healthy);
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, peer: &str, envelope: Envelope) -> Result<(), TransportError> {
        let Some(sender) = self.network.sender_for(peer) else {
            self.mark(peer, false);
            return Err(TransportError::UnknownPeer(peer.to_string()));
        };

        match timeout(SEND_TIMEOUT, sender.send(envelope)).await {
            Ok(Ok(())) => {
                self.mark(peer, true);
                Ok(())
            }
            Ok(Err(_)) => {
                self.mark(peer, false);
                Err(TransportError::PeerGone(peer.to_string()))
            }
            Err(_) => {
                warn!(peer, "send timed out");
                self.mark(peer, false);
                Err(TransportError::SendTimeout {
                    peer: peer.to_string(),
                    millis: SEND_TIMEOUT.as_millis() as u64,
                })
            }
        }
    }

    fn is_healthy(&self, peer: &str) -> bool {
        self.health.get(peer).map(|v| *v).unwrap_or(true)
    }
}

/// Drain `rx` forever, forwarding every envelope to `inbound.step`. Run as
/// a background task per registered peer; exits when the sender side
/// (the `LocalNetwork` registration) is dropped.
pub async fn run_inbound_loop(mut rx: mpsc::Receiver<Envelope>, inbound: Arc<dyn Inbound>) {
    while let Some(envelope) = rx.recv().await {
        inbound.step(envelope).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depshard_core::ShardId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn envelope(from: &str) -> Envelope {
        Envelope {
            shard_id: ShardId::new("alpha"),
            from: from.to_string(),
            payload: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn send_delivers_to_registered_peer() {
        let network = Arc::new(LocalNetwork::new());
        let mut rx_b = network.register("b");
        let transport_a = LocalTransport::new(network.clone(), "a");

        transport_a.send("b", envelope("a")).await.unwrap();
        let received = rx_b.recv().await.unwrap();
        assert_eq!(received.from, "a");
        assert!(transport_a.is_healthy("b"));
    }

    #[tokio::test]
    async fn send_to_unknown_peer_marks_unhealthy() {
        let network = Arc::new(LocalNetwork::new());
        let transport_a = LocalTransport::new(network, "a");

        let err = transport_a.send("ghost", envelope("a")).await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownPeer(_)));
        assert!(!transport_a.is_healthy("ghost"));
    }

    #[tokio::test]
    async fn send_after_receiver_dropped_marks_unhealthy() {
        let network = Arc::new(LocalNetwork::new());
        let rx_b = network.register("b");
        drop(rx_b);
        let transport_a = LocalTransport::new(network, "a");

        let err = transport_a.send("b", envelope("a")).await.unwrap_err();
        assert!(matches!(err, TransportError::PeerGone(_)));
        assert!(!transport_a.is_healthy("b"));
    }

    #[tokio::test]
    async fn is_healthy_defaults_true_before_any_send() {
        let network = Arc::new(LocalNetwork::new());
        let transport_a = LocalTransport::new(network, "a");
        assert!(transport_a.is_healthy("never-contacted"));
    }

    struct CountingInbound {
        count: AtomicUsize,
    }

    #[async_trait]
    impl Inbound for CountingInbound {
        async fn step(&self, _envelope: Envelope) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn run_inbound_loop_forwards_every_envelope() {
        let network = Arc::new(LocalNetwork::new());
        let rx_b = network.register("b");
        let transport_a = LocalTransport::new(network, "a");
        let inbound = Arc::new(CountingInbound {
            count: AtomicUsize::new(0),
        });

        let handle = tokio::spawn(run_inbound_loop(rx_b, inbound.clone()));
        transport_a.send("b", envelope("a")).await.unwrap();
        transport_a.send("b", envelope("a")).await.unwrap();

        // give the spawned loop a turn to drain both sends
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(inbound.count.load(Ordering::SeqCst), 2);
        handle.abort();
    }
}
