//! Local media tracks shared across all peer links.
//!
//! One camera pair (Opus audio + VP8 video) lives for the whole call and
//! is attached to every link; a screen track comes and goes with screen
//! sharing. Stream IDs are minted per call so receivers can classify
//! inbound streams against the [`StreamIds`] advertised in offers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use huddle_protocol::{DeviceKind, DeviceState, StreamIds};
use tokio::sync::RwLock;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

struct ScreenShare {
    stream_id: String,
    track: Arc<TrackLocalStaticSample>,
}

/// Owns the local outbound tracks and the mute flags gating them.
///
/// Mute flags are the single mutation point for outbound media: a
/// disabled device drops frames here instead of tearing tracks down,
/// so no renegotiation is needed for mic or camera toggles.
pub struct LocalMedia {
    camera_stream_id: String,
    audio_track: Arc<TrackLocalStaticSample>,
    video_track: Arc<TrackLocalStaticSample>,
    screen: RwLock<Option<ScreenShare>>,
    mic_enabled: AtomicBool,
    cam_enabled: AtomicBool,
    speaker_enabled: AtomicBool,
}

impl LocalMedia {
    pub fn new(device_state: DeviceState) -> Self {
        let camera_stream_id = format!("camera-{}", Uuid::new_v4());

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            camera_stream_id.clone(),
        ));

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video".to_owned(),
            camera_stream_id.clone(),
        ));

        Self {
            camera_stream_id,
            audio_track,
            video_track,
            screen: RwLock::new(None),
            mic_enabled: AtomicBool::new(device_state.mic),
            cam_enabled: AtomicBool::new(device_state.cam),
            speaker_enabled: AtomicBool::new(device_state.speaker),
        }
    }

    /// Stream IDs to advertise in the next offer or answer.
    pub async fn stream_ids(&self) -> StreamIds {
        StreamIds {
            camera: Some(self.camera_stream_id.clone()),
            screen: self
                .screen
                .read()
                .await
                .as_ref()
                .map(|s| s.stream_id.clone()),
        }
    }

    pub fn device_state(&self) -> DeviceState {
        DeviceState {
            mic: self.mic_enabled.load(Ordering::SeqCst),
            cam: self.cam_enabled.load(Ordering::SeqCst),
            speaker: self.speaker_enabled.load(Ordering::SeqCst),
        }
    }

    pub fn set_device(&self, kind: DeviceKind, value: bool) {
        let flag = match kind {
            DeviceKind::Mic => &self.mic_enabled,
            DeviceKind::Cam => &self.cam_enabled,
            DeviceKind::Speaker => &self.speaker_enabled,
        };
        flag.store(value, Ordering::SeqCst);
    }

    /// Every track that should be attached to a newly created link.
    pub async fn call_tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        let mut tracks: Vec<Arc<dyn TrackLocal + Send + Sync>> =
            vec![self.audio_track.clone(), self.video_track.clone()];
        if let Some(screen) = self.screen.read().await.as_ref() {
            tracks.push(screen.track.clone());
        }
        tracks
    }

    /// Create the screen track. Fails if a share is already active.
    pub async fn start_screen_share(&self) -> Result<Arc<TrackLocalStaticSample>> {
        let mut screen = self.screen.write().await;
        if screen.is_some() {
            anyhow::bail!("screen share already active");
        }

        let stream_id = format!("screen-{}", Uuid::new_v4());
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            "screen".to_owned(),
            stream_id.clone(),
        ));

        *screen = Some(ScreenShare {
            stream_id,
            track: track.clone(),
        });
        Ok(track)
    }

    /// Drop the screen track, returning its stream ID for sender removal.
    pub async fn stop_screen_share(&self) -> Option<String> {
        self.screen.write().await.take().map(|s| s.stream_id)
    }

    pub async fn is_screen_sharing(&self) -> bool {
        self.screen.read().await.is_some()
    }

    /// Feed one encoded audio frame to every link. Dropped while muted.
    pub async fn write_audio_frame(&self, sample: &Sample) -> Result<()> {
        if !self.mic_enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.audio_track.write_sample(sample).await?;
        Ok(())
    }

    /// Feed one encoded camera frame to every link. Dropped while disabled.
    pub async fn write_camera_frame(&self, sample: &Sample) -> Result<()> {
        if !self.cam_enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.video_track.write_sample(sample).await?;
        Ok(())
    }

    /// Feed one encoded screen frame. No-op when no share is active.
    pub async fn write_screen_frame(&self, sample: &Sample) -> Result<()> {
        if let Some(screen) = self.screen.read().await.as_ref() {
            screen.track.write_sample(sample).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_ids_track_screen_lifecycle() {
        let media = LocalMedia::new(DeviceState::default());

        let ids = media.stream_ids().await;
        assert!(ids.camera.is_some());
        assert!(ids.screen.is_none());

        media.start_screen_share().await.unwrap();
        let ids = media.stream_ids().await;
        let screen_id = ids.screen.clone().unwrap();
        assert_ne!(Some(&screen_id), ids.camera.as_ref());
        assert_eq!(media.call_tracks().await.len(), 3);

        let removed = media.stop_screen_share().await.unwrap();
        assert_eq!(removed, screen_id);
        assert!(media.stream_ids().await.screen.is_none());
        assert_eq!(media.call_tracks().await.len(), 2);
    }

    #[tokio::test]
    async fn second_screen_share_is_rejected() {
        let media = LocalMedia::new(DeviceState::default());
        media.start_screen_share().await.unwrap();
        assert!(media.start_screen_share().await.is_err());
    }

    #[tokio::test]
    async fn device_toggles_round_trip() {
        let media = LocalMedia::new(DeviceState {
            mic: false,
            cam: true,
            speaker: true,
        });
        assert!(!media.device_state().mic);

        media.set_device(DeviceKind::Mic, true);
        media.set_device(DeviceKind::Speaker, false);
        let state = media.device_state();
        assert!(state.mic);
        assert!(!state.speaker);
    }
}
