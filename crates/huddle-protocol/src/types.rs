use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Microphone / camera / speaker toggles for one member.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceState {
    pub mic: bool,
    pub cam: bool,
    pub speaker: bool,
}

impl DeviceState {
    pub fn set(&mut self, kind: DeviceKind, value: bool) {
        match kind {
            DeviceKind::Mic => self.mic = value,
            DeviceKind::Cam => self.cam = value,
            DeviceKind::Speaker => self.speaker = value,
        }
    }
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            mic: true,
            cam: true,
            speaker: true,
        }
    }
}

/// Which device a state-change message refers to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Mic,
    Cam,
    Speaker,
}

/// Identity descriptor supplied by the (external) identity provider.
///
/// `identity_id` persists across reconnects and is the key used to
/// correlate device-state updates; the connection ID does not survive
/// a reconnect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub identity_id: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// One connected participant of a room, as tracked by the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    /// Transport-session identifier, unique per physical connection.
    pub connection_id: Uuid,
    #[serde(flatten)]
    pub identity: Identity,
    pub device_state: DeviceState,
}

/// Stream identifiers a sender advertises alongside an offer or answer.
///
/// A single peer connection multiplexes up to two logically distinct
/// streams (camera+mic and screen share); the receiver classifies an
/// incoming stream by matching its ID against these, learned out of band.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamIds {
    pub camera: Option<String>,
    pub screen: Option<String>,
}

impl StreamIds {
    pub fn is_camera(&self, stream_id: &str) -> bool {
        self.camera.as_deref() == Some(stream_id)
    }

    pub fn is_screen(&self, stream_id: &str) -> bool {
        self.screen.as_deref() == Some(stream_id)
    }
}

/// ICE server entry handed to clients by the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}
