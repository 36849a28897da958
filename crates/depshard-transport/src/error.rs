use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is not registered in this transport's network")]
    UnknownPeer(String),

    #[error("send to peer {peer} timed out after {millis} ms")]
    SendTimeout { peer: String, millis: u64 },

    #[error("peer {0}'s inbound queue is closed")]
    PeerGone(String),
}
