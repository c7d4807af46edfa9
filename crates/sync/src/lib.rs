//! Block download coordination and header sync over the peer network.

pub mod download;
pub mod headers;
pub mod net;

pub use download::{DownloadCoordinator, PeerSyncState};
pub use headers::HeaderProcessor;
pub use net::{NetMessage, NodeId, PeerNet};
