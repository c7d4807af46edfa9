//! The peer-network boundary the sync layer drives.

use emberd_consensus::Hash256;

pub type NodeId = u64;

/// Outbound messages the sync layer can queue for a peer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NetMessage {
    GetHeaders {
        locator: Vec<Hash256>,
        stop: Hash256,
    },
    GetData(Vec<Hash256>),
    Inv(Hash256),
}

pub trait PeerNet {
    fn push_message(&self, peer: NodeId, message: NetMessage);
    fn for_each_peer(&self, f: &mut dyn FnMut(NodeId));
    fn disconnect(&self, peer: NodeId);
    /// Charge misbehavior score; the connection manager bans past its
    /// threshold.
    fn misbehaving(&self, peer: NodeId, score: u32, reason: &str);
}
