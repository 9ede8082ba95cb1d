//! Speaking detection from inbound audio throughput.
//!
//! There is no audio-level signal on a relayed Opus track, so the
//! monitor samples the link's RTP stats once a second and treats a
//! rising `bytes_received` on the audio stream as speech. A short
//! holdover keeps the flag from flickering between words.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::stats::StatsReportType;

use crate::link::PeerLink;
use crate::manager::CallEvent;

pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Minimum audio bytes per sample interval that counts as speech.
/// Comfort noise and keepalives stay well under this.
pub const SPEAKING_THRESHOLD_BYTES: u64 = 2000;

/// Intervals the flag stays raised after throughput drops.
pub const HOLDOVER_TICKS: u32 = 1;

/// Threshold-plus-holdover hysteresis over periodic byte counters.
///
/// The first observation only establishes a baseline; a missing
/// counter (link gone quiet or stats unavailable) reads as silence.
pub struct SpeechDetector {
    threshold: u64,
    holdover_ticks: u32,
    last_total: Option<u64>,
    holdover: u32,
    speaking: bool,
}

impl SpeechDetector {
    pub fn new(threshold: u64, holdover_ticks: u32) -> Self {
        Self {
            threshold,
            holdover_ticks,
            last_total: None,
            holdover: 0,
            speaking: false,
        }
    }

    /// Feed one cumulative byte counter; returns the current speaking state.
    pub fn observe(&mut self, total_bytes: u64) -> bool {
        let delta = match self.last_total {
            // Counter reset (link renegotiated) reads as silence.
            Some(last) => total_bytes.saturating_sub(last),
            None => {
                self.last_total = Some(total_bytes);
                return self.speaking;
            }
        };
        self.last_total = Some(total_bytes);

        if delta >= self.threshold {
            self.holdover = self.holdover_ticks;
            self.speaking = true;
        } else if self.holdover > 0 {
            self.holdover -= 1;
        } else {
            self.speaking = false;
        }
        self.speaking
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }
}

/// Spawn the per-link sampling loop. The task ends when the link closes;
/// transitions are reported as [`CallEvent::SpeakingChanged`].
pub fn spawn(
    link: Arc<PeerLink>,
    events: mpsc::UnboundedSender<CallEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let peer_id = link.peer_id();
        let mut detector = SpeechDetector::new(SPEAKING_THRESHOLD_BYTES, HOLDOVER_TICKS);
        let mut interval = tokio::time::interval(SAMPLE_INTERVAL);

        loop {
            interval.tick().await;
            if link.is_closed() {
                break;
            }

            let total = inbound_audio_bytes(&link).await;
            let was_speaking = detector.is_speaking();
            let speaking = detector.observe(total);
            if speaking != was_speaking
                && events
                    .send(CallEvent::SpeakingChanged { peer_id, speaking })
                    .is_err()
            {
                break;
            }
        }
    })
}

async fn inbound_audio_bytes(link: &PeerLink) -> u64 {
    let stats = link.stats().await;
    let mut total = 0u64;
    for stat in stats.reports.values() {
        if let StatsReportType::InboundRTP(inbound) = stat {
            if inbound.kind == "audio" {
                total += inbound.bytes_received;
            }
        }
    }
    total
}
