//! One WebRTC peer connection to one remote member.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use huddle_protocol::IceServerConfig;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReport;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Events a link surfaces to the mesh manager.
pub enum LinkEvent {
    /// Trickle candidate to forward to the remote side.
    IceCandidate {
        peer_id: Uuid,
        candidate: RTCIceCandidateInit,
    },
    /// The local track set changed while the link was negotiated.
    NegotiationNeeded { peer_id: Uuid },
    /// An inbound stream arrived; classification happens in the manager.
    TrackReceived {
        peer_id: Uuid,
        stream_id: String,
        track: Arc<TrackRemote>,
    },
    /// Underlying transport state changed.
    StateChanged {
        peer_id: Uuid,
        state: RTCPeerConnectionState,
    },
}

/// Wraps one [`RTCPeerConnection`] and forwards its callbacks as
/// [`LinkEvent`]s. Negotiation sequencing lives in the manager; this
/// type only exposes the SDP and candidate primitives.
pub struct PeerLink {
    peer_id: Uuid,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
    closed: AtomicBool,
}

impl PeerLink {
    pub async fn new(
        peer_id: Uuid,
        ice_servers: &[IceServerConfig],
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);

        let ice_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = ice_tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = tx.send(LinkEvent::IceCandidate {
                                peer_id,
                                candidate: init,
                            });
                        }
                        Err(e) => {
                            tracing::warn!("Failed to serialize ICE candidate: {}", e);
                        }
                    }
                }
            })
        }));

        let negotiation_tx = events.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let tx = negotiation_tx.clone();
            Box::pin(async move {
                let _ = tx.send(LinkEvent::NegotiationNeeded { peer_id });
            })
        }));

        let track_tx = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = track_tx.clone();
            let stream_id = track.stream_id().to_string();
            Box::pin(async move {
                tracing::debug!(
                    "Inbound track from {}: id={} stream={}",
                    peer_id,
                    track.id(),
                    stream_id
                );
                let _ = tx.send(LinkEvent::TrackReceived {
                    peer_id,
                    stream_id,
                    track,
                });
            })
        }));

        let state_tx = events;
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let tx = state_tx.clone();
            Box::pin(async move {
                tracing::debug!("Link to {} is now {:?}", peer_id, state);
                let _ = tx.send(LinkEvent::StateChanged { peer_id, state });
            })
        }));

        Ok(Self {
            peer_id,
            pc,
            senders: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Attach a local track; its RTP sender is remembered so the track
    /// can later be removed by stream ID.
    pub async fn add_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<()> {
        let sender = self.pc.add_track(track).await?;
        self.senders.lock().await.push(sender);
        Ok(())
    }

    /// Detach every local track belonging to `stream_id`.
    pub async fn remove_stream(&self, stream_id: &str) -> Result<()> {
        let mut senders = self.senders.lock().await;
        let mut kept = Vec::with_capacity(senders.len());
        for sender in senders.drain(..) {
            let matches = match sender.track().await {
                Some(track) => track.stream_id() == stream_id,
                None => false,
            };
            if matches {
                self.pc.remove_track(&sender).await?;
            } else {
                kept.push(sender);
            }
        }
        *senders = kept;
        Ok(())
    }

    pub async fn create_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(offer.sdp)
    }

    pub async fn set_remote_offer(&self, sdp: String) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp)?;
        self.pc.set_remote_description(offer).await?;
        Ok(())
    }

    pub async fn create_answer(&self) -> Result<String> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(answer.sdp)
    }

    pub async fn set_remote_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp)?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.pc.add_ice_candidate(candidate).await?;
        Ok(())
    }

    pub async fn stats(&self) -> StatsReport {
        self.pc.get_stats().await
    }

    /// Close the underlying connection. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Error closing link to {}: {}", self.peer_id, e);
        }
    }
}
