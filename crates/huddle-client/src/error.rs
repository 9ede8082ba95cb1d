use thiserror::Error;

/// Client-side failures that callers may want to match on.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("signaling channel error: {0}")]
    Signaling(String),

    #[error("not connected")]
    NotConnected,

    #[error("screen share already active")]
    ScreenShareActive,

    #[error("webrtc error: {0}")]
    Webrtc(#[from] webrtc::Error),
}
