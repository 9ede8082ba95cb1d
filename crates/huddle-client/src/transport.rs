use anyhow::Result;
use async_trait::async_trait;
use huddle_protocol::ClientMessage;

/// Outbound half of the signaling channel.
///
/// The mesh manager only ever sends [`ClientMessage`]s; inbound
/// [`ServerMessage`](huddle_protocol::ServerMessage)s reach it through the
/// receiver handed to [`MeshManager::run`](crate::manager::MeshManager::run).
/// Splitting the two lets tests wire managers together without a relay
/// process.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, message: ClientMessage) -> Result<()>;
}
