//! Call client for the huddle relay.
//!
//! [`MeshManager`] negotiates one [`PeerLink`](link::PeerLink) per remote
//! member over a [`SignalingTransport`], keeps the full mesh consistent
//! with room membership, and surfaces everything the embedding
//! application needs as [`CallEvent`]s.

pub mod error;
pub mod link;
pub mod manager;
pub mod media;
pub mod monitor;
pub mod signaling;
pub mod transport;

pub use error::ClientError;
pub use link::{LinkEvent, PeerLink};
pub use manager::{CallEvent, LinkState, MeshManager};
pub use media::LocalMedia;
pub use monitor::SpeechDetector;
pub use signaling::WsSignaling;
pub use transport::SignalingTransport;
