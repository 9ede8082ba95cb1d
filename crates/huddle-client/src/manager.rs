//! Full-mesh negotiation manager.
//!
//! Owns one [`PeerLink`] per remote member and sequences every
//! offer/answer/candidate exchange through a single event loop, so the
//! per-link state machine never sees interleaved transitions. The
//! initiator rule is asymmetric: the member already in the room offers
//! to the newcomer, the newcomer only answers, so no pair can produce
//! glare.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use huddle_protocol::{
    ClientMessage, DeviceKind, DeviceState, Identity, IceServerConfig, Member, ServerMessage,
    StreamIds,
};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtp::packet::Packet;
use webrtc::track::track_remote::TrackRemote;

use crate::link::{LinkEvent, PeerLink};
use crate::media::LocalMedia;
use crate::monitor;
use crate::transport::SignalingTransport;

/// Negotiation state of one link.
///
/// Offerer path: `Idle -> OfferSent -> AnswerReceived -> Connected`.
/// Answerer path: `Idle -> OfferReceived -> AnswerSent -> Connected`.
/// Renegotiation re-enters `OfferSent` from `Connected`. `Closed` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Connected,
    Closed,
}

/// Call-level events surfaced to the embedding application.
pub enum CallEvent {
    /// The room's member list changed.
    MembershipChanged { members: Vec<Member> },
    /// A link finished its first negotiation.
    LinkConnected { peer_id: Uuid },
    /// A member left and its link was torn down.
    PeerLeft { peer_id: Uuid },
    /// Inbound camera/mic stream for a peer.
    CameraTrack {
        peer_id: Uuid,
        track: Arc<TrackRemote>,
    },
    /// A peer started sharing its screen. The manager's watcher is the
    /// sole reader of the track and forwards every RTP packet here;
    /// `ScreenEnded` follows once the track ends.
    ScreenStarted {
        peer_id: Uuid,
        packets: mpsc::UnboundedReceiver<Packet>,
    },
    /// A peer's screen share ended.
    ScreenEnded { peer_id: Uuid },
    /// A member toggled a device.
    DeviceStateChanged {
        identity_id: String,
        kind: DeviceKind,
        value: bool,
    },
    /// A peer started or stopped speaking.
    SpeakingChanged { peer_id: Uuid, speaking: bool },
}

enum StreamKind {
    Camera,
    Screen,
    Unknown,
}

fn classify(binding: &StreamIds, stream_id: &str) -> StreamKind {
    if binding.is_camera(stream_id) {
        StreamKind::Camera
    } else if binding.is_screen(stream_id) {
        StreamKind::Screen
    } else {
        StreamKind::Unknown
    }
}

struct PeerEntry {
    member: Member,
    link: Arc<PeerLink>,
    state: LinkState,
    /// Remote stream IDs, refreshed from every offer and answer.
    binding: StreamIds,
    /// Screen stream currently live on this link, if any.
    screen_stream: Option<String>,
    monitor: Option<JoinHandle<()>>,
}

struct Inner {
    room_id: Uuid,
    group_code: String,
    identity: Identity,
    ice_servers: Vec<IceServerConfig>,
    media: Arc<LocalMedia>,
    transport: Arc<dyn SignalingTransport>,
    connection_id: RwLock<Option<Uuid>>,
    peers: RwLock<HashMap<Uuid, PeerEntry>>,
    /// Members learned from our join snapshot. They are older than us,
    /// so they offer to us; we must never offer to them.
    expected_offerers: RwLock<HashSet<Uuid>>,
    roster: RwLock<Vec<Member>>,
    link_events_tx: mpsc::UnboundedSender<LinkEvent>,
    link_events_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
    events: mpsc::UnboundedSender<CallEvent>,
}

/// Drives the full mesh for one call.
#[derive(Clone)]
pub struct MeshManager {
    inner: Arc<Inner>,
}

impl MeshManager {
    pub fn new(
        room_id: Uuid,
        group_code: String,
        identity: Identity,
        device_state: DeviceState,
        ice_servers: Vec<IceServerConfig>,
        transport: Arc<dyn SignalingTransport>,
    ) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (link_events_tx, link_events_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let manager = Self {
            inner: Arc::new(Inner {
                room_id,
                group_code,
                identity,
                ice_servers,
                media: Arc::new(LocalMedia::new(device_state)),
                transport,
                connection_id: RwLock::new(None),
                peers: RwLock::new(HashMap::new()),
                expected_offerers: RwLock::new(HashSet::new()),
                roster: RwLock::new(Vec::new()),
                link_events_tx,
                link_events_rx: Mutex::new(Some(link_events_rx)),
                events: events_tx,
            }),
        };
        (manager, events_rx)
    }

    pub fn media(&self) -> Arc<LocalMedia> {
        self.inner.media.clone()
    }

    pub async fn connection_id(&self) -> Option<Uuid> {
        *self.inner.connection_id.read().await
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.peers.read().await.len()
    }

    pub async fn link_state(&self, peer_id: Uuid) -> Option<LinkState> {
        self.inner.peers.read().await.get(&peer_id).map(|e| e.state)
    }

    pub async fn binding_of(&self, peer_id: Uuid) -> Option<StreamIds> {
        self.inner
            .peers
            .read()
            .await
            .get(&peer_id)
            .map(|e| e.binding.clone())
    }

    pub async fn members(&self) -> Vec<Member> {
        self.inner.roster.read().await.clone()
    }

    /// Consume signaling and link events until the signaling channel
    /// closes. Call once, from its own task.
    pub async fn run(&self, mut server_rx: mpsc::UnboundedReceiver<ServerMessage>) {
        let Some(mut link_rx) = self.inner.link_events_rx.lock().await.take() else {
            tracing::error!("Mesh event loop started twice");
            return;
        };

        loop {
            tokio::select! {
                msg = server_rx.recv() => match msg {
                    Some(msg) => self.handle_server_message(msg).await,
                    None => break,
                },
                event = link_rx.recv() => match event {
                    Some(event) => self.handle_link_event(event).await,
                    None => break,
                },
            }
        }

        self.teardown_all().await;
    }

    /// Enter the call.
    pub async fn join(&self) -> Result<()> {
        self.inner
            .transport
            .send(ClientMessage::Join {
                room_id: self.inner.room_id,
                group_code: self.inner.group_code.clone(),
                identity: self.inner.identity.clone(),
                device_state: self.inner.media.device_state(),
            })
            .await
    }

    /// Leave the call and tear down every link.
    pub async fn leave(&self) -> Result<()> {
        let result = self.inner.transport.send(ClientMessage::Leave).await;
        self.teardown_all().await;
        result
    }

    /// Toggle a local device and announce the change to the room.
    pub async fn set_device(&self, kind: DeviceKind, value: bool) -> Result<()> {
        self.inner.media.set_device(kind, value);
        self.inner
            .transport
            .send(ClientMessage::SetDeviceState {
                room_id: self.inner.room_id,
                identity_id: self.inner.identity.identity_id.clone(),
                kind,
                value,
            })
            .await
    }

    /// Add a screen track to every link. Each connected link renegotiates
    /// on its own negotiation-needed signal.
    pub async fn start_screen_share(&self) -> Result<()> {
        let track = self.inner.media.start_screen_share().await?;
        let links: Vec<Arc<PeerLink>> = {
            let peers = self.inner.peers.read().await;
            peers.values().map(|e| e.link.clone()).collect()
        };
        for link in links {
            if let Err(e) = link.add_track(track.clone()).await {
                tracing::warn!("Failed to add screen track to {}: {}", link.peer_id(), e);
            }
        }
        Ok(())
    }

    /// Remove the screen track from every link. Remote sides observe the
    /// end of the stream on the track itself, not via signaling.
    pub async fn stop_screen_share(&self) -> Result<()> {
        let Some(stream_id) = self.inner.media.stop_screen_share().await else {
            return Ok(());
        };
        let links: Vec<Arc<PeerLink>> = {
            let peers = self.inner.peers.read().await;
            peers.values().map(|e| e.link.clone()).collect()
        };
        for link in links {
            if let Err(e) = link.remove_stream(&stream_id).await {
                tracing::warn!(
                    "Failed to remove screen track from {}: {}",
                    link.peer_id(),
                    e
                );
            }
        }
        Ok(())
    }

    pub async fn handle_server_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::Welcome { connection_id } => {
                tracing::info!("Connected as {}", connection_id);
                *self.inner.connection_id.write().await = Some(connection_id);
            }
            ServerMessage::MembershipSnapshot { members, .. } => {
                {
                    let mut expected = self.inner.expected_offerers.write().await;
                    expected.extend(members.iter().map(|m| m.connection_id));
                }
                *self.inner.roster.write().await = members.clone();
                let _ = self.inner.events.send(CallEvent::MembershipChanged { members });
            }
            ServerMessage::MembershipUpdate { members, .. } => {
                self.handle_membership_update(members).await;
            }
            ServerMessage::Offer {
                sender_id,
                sdp,
                stream_ids,
                identity,
                device_state,
            } => {
                self.handle_remote_offer(sender_id, sdp, stream_ids, identity, device_state)
                    .await;
            }
            ServerMessage::Answer {
                sender_id,
                sdp,
                stream_ids,
            } => {
                self.handle_remote_answer(sender_id, sdp, stream_ids).await;
            }
            ServerMessage::Candidate {
                sender_id,
                candidate,
            } => {
                self.handle_remote_candidate(sender_id, candidate).await;
            }
            ServerMessage::DeviceStateChanged {
                identity_id,
                kind,
                value,
                ..
            } => {
                self.handle_device_state_changed(identity_id, kind, value)
                    .await;
            }
            ServerMessage::PeerLeft { connection_id, .. } => {
                self.remove_peer(connection_id).await;
            }
            ServerMessage::Pong => {}
            ServerMessage::Error { message } => {
                tracing::error!("Relay error: {}", message);
            }
        }
    }

    async fn handle_membership_update(&self, members: Vec<Member>) {
        let my_id = *self.inner.connection_id.read().await;

        {
            let mut peers = self.inner.peers.write().await;
            for member in &members {
                if let Some(entry) = peers.get_mut(&member.connection_id) {
                    entry.member = member.clone();
                }
            }
        }
        *self.inner.roster.write().await = members.clone();
        let _ = self.inner.events.send(CallEvent::MembershipChanged {
            members: members.clone(),
        });

        // Offer to every member we neither have a link to nor expect an
        // offer from. Those are newcomers that joined after us.
        for member in members {
            if Some(member.connection_id) == my_id {
                continue;
            }
            if self
                .inner
                .expected_offerers
                .read()
                .await
                .contains(&member.connection_id)
            {
                continue;
            }
            if self
                .inner
                .peers
                .read()
                .await
                .contains_key(&member.connection_id)
            {
                continue;
            }
            self.initiate_offer(member).await;
        }
    }

    async fn initiate_offer(&self, member: Member) {
        let peer_id = member.connection_id;
        tracing::info!("Offering to new member {}", peer_id);

        let Some(link) = self.create_link(peer_id).await else {
            return;
        };
        self.inner.peers.write().await.insert(
            peer_id,
            PeerEntry {
                member,
                link: link.clone(),
                state: LinkState::Idle,
                binding: StreamIds::default(),
                screen_stream: None,
                monitor: None,
            },
        );

        let sdp = match link.create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                tracing::warn!("Abandoning offer to {}: {}", peer_id, e);
                return;
            }
        };

        let message = ClientMessage::Offer {
            receiver_id: peer_id,
            sdp,
            stream_ids: self.inner.media.stream_ids().await,
            identity: self.inner.identity.clone(),
            device_state: self.inner.media.device_state(),
        };
        match self.inner.transport.send(message).await {
            Ok(()) => self.set_state(peer_id, LinkState::OfferSent).await,
            Err(e) => tracing::warn!("Failed to send offer to {}: {}", peer_id, e),
        }
    }

    async fn handle_remote_offer(
        &self,
        sender_id: Uuid,
        sdp: String,
        stream_ids: StreamIds,
        identity: Identity,
        device_state: DeviceState,
    ) {
        let existing = self
            .inner
            .peers
            .read()
            .await
            .get(&sender_id)
            .map(|e| (e.link.clone(), e.state));

        let (link, prev_state) = match existing {
            Some((_, LinkState::Closed)) => {
                tracing::debug!("Discarding offer on closed link from {}", sender_id);
                return;
            }
            Some((link, state)) => (link, state),
            None => {
                // First contact: the offer carries the sender's identity
                // so the link can exist before any membership broadcast.
                let Some(link) = self.create_link(sender_id).await else {
                    return;
                };
                self.inner.peers.write().await.insert(
                    sender_id,
                    PeerEntry {
                        member: Member {
                            connection_id: sender_id,
                            identity,
                            device_state,
                        },
                        link: link.clone(),
                        state: LinkState::Idle,
                        binding: StreamIds::default(),
                        screen_stream: None,
                        monitor: None,
                    },
                );
                (link, LinkState::Idle)
            }
        };

        self.set_binding(sender_id, stream_ids).await;
        self.set_state(sender_id, LinkState::OfferReceived).await;

        if let Err(e) = link.set_remote_offer(sdp).await {
            tracing::warn!("Failed to apply offer from {}: {}", sender_id, e);
            self.set_state(sender_id, prev_state).await;
            return;
        }
        let answer_sdp = match link.create_answer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                tracing::warn!("Failed to answer {}: {}", sender_id, e);
                self.set_state(sender_id, prev_state).await;
                return;
            }
        };
        self.set_state(sender_id, LinkState::AnswerSent).await;

        let message = ClientMessage::Answer {
            receiver_id: sender_id,
            sdp: answer_sdp,
            stream_ids: self.inner.media.stream_ids().await,
        };
        if let Err(e) = self.inner.transport.send(message).await {
            tracing::warn!("Failed to send answer to {}: {}", sender_id, e);
            return;
        }

        self.mark_connected(sender_id).await;
    }

    async fn handle_remote_answer(&self, sender_id: Uuid, sdp: String, stream_ids: StreamIds) {
        let Some((link, prev_state)) = self
            .inner
            .peers
            .read()
            .await
            .get(&sender_id)
            .map(|e| (e.link.clone(), e.state))
        else {
            tracing::debug!("Discarding answer from unknown peer {}", sender_id);
            return;
        };
        if prev_state == LinkState::Closed {
            return;
        }

        self.set_binding(sender_id, stream_ids).await;
        self.set_state(sender_id, LinkState::AnswerReceived).await;

        if let Err(e) = link.set_remote_answer(sdp).await {
            tracing::warn!("Failed to apply answer from {}: {}", sender_id, e);
            self.set_state(sender_id, prev_state).await;
            return;
        }

        self.mark_connected(sender_id).await;
    }

    async fn handle_remote_candidate(&self, sender_id: Uuid, candidate: String) {
        let Some(link) = self
            .inner
            .peers
            .read()
            .await
            .get(&sender_id)
            .filter(|e| e.state != LinkState::Closed)
            .map(|e| e.link.clone())
        else {
            // Candidates race against teardown. Valid discard, not an error.
            tracing::debug!("Discarding candidate from unknown peer {}", sender_id);
            return;
        };

        let init: RTCIceCandidateInit = match serde_json::from_str(&candidate) {
            Ok(init) => init,
            Err(e) => {
                tracing::warn!("Malformed candidate from {}: {}", sender_id, e);
                return;
            }
        };
        if let Err(e) = link.add_ice_candidate(init).await {
            tracing::warn!("Failed to add candidate from {}: {}", sender_id, e);
        }
    }

    async fn handle_device_state_changed(&self, identity_id: String, kind: DeviceKind, value: bool) {
        {
            let mut peers = self.inner.peers.write().await;
            for entry in peers.values_mut() {
                if entry.member.identity.identity_id == identity_id {
                    entry.member.device_state.set(kind, value);
                }
            }
        }
        {
            let mut roster = self.inner.roster.write().await;
            for member in roster.iter_mut() {
                if member.identity.identity_id == identity_id {
                    member.device_state.set(kind, value);
                }
            }
        }
        let _ = self.inner.events.send(CallEvent::DeviceStateChanged {
            identity_id,
            kind,
            value,
        });
    }

    pub async fn handle_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::IceCandidate { peer_id, candidate } => {
                let json = match serde_json::to_string(&candidate) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!("Failed to serialize candidate for {}: {}", peer_id, e);
                        return;
                    }
                };
                if let Err(e) = self
                    .inner
                    .transport
                    .send(ClientMessage::Candidate {
                        receiver_id: peer_id,
                        candidate: json,
                    })
                    .await
                {
                    tracing::warn!("Failed to send candidate to {}: {}", peer_id, e);
                }
            }
            LinkEvent::NegotiationNeeded { peer_id } => {
                self.renegotiate(peer_id).await;
            }
            LinkEvent::TrackReceived {
                peer_id,
                stream_id,
                track,
            } => {
                self.handle_inbound_track(peer_id, stream_id, track).await;
            }
            LinkEvent::StateChanged { peer_id, state } => {
                if state == RTCPeerConnectionState::Failed {
                    tracing::warn!("Link to {} failed, tearing it down", peer_id);
                    self.remove_peer(peer_id).await;
                }
            }
        }
    }

    /// Initial offers are driven by membership, so negotiation-needed is
    /// only acted on for links that already completed a negotiation.
    async fn renegotiate(&self, peer_id: Uuid) {
        let Some((link, state)) = self
            .inner
            .peers
            .read()
            .await
            .get(&peer_id)
            .map(|e| (e.link.clone(), e.state))
        else {
            return;
        };
        if state != LinkState::Connected {
            tracing::debug!(
                "Ignoring negotiation-needed for {} in state {:?}",
                peer_id,
                state
            );
            return;
        }

        let sdp = match link.create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                tracing::warn!("Renegotiation offer to {} failed: {}", peer_id, e);
                return;
            }
        };

        let message = ClientMessage::Offer {
            receiver_id: peer_id,
            sdp,
            stream_ids: self.inner.media.stream_ids().await,
            identity: self.inner.identity.clone(),
            device_state: self.inner.media.device_state(),
        };
        match self.inner.transport.send(message).await {
            Ok(()) => self.set_state(peer_id, LinkState::OfferSent).await,
            Err(e) => {
                tracing::warn!("Failed to send renegotiation offer to {}: {}", peer_id, e);
            }
        }
    }

    async fn handle_inbound_track(&self, peer_id: Uuid, stream_id: String, track: Arc<TrackRemote>) {
        let kind = match self.inner.peers.read().await.get(&peer_id) {
            Some(entry) => classify(&entry.binding, &stream_id),
            None => return,
        };

        match kind {
            StreamKind::Camera => {
                let _ = self
                    .inner
                    .events
                    .send(CallEvent::CameraTrack { peer_id, track });
            }
            StreamKind::Screen => {
                if let Some(entry) = self.inner.peers.write().await.get_mut(&peer_id) {
                    entry.screen_stream = Some(stream_id);
                }
                let (packets_tx, packets_rx) = mpsc::unbounded_channel();
                let _ = self.inner.events.send(CallEvent::ScreenStarted {
                    peer_id,
                    packets: packets_rx,
                });
                self.spawn_screen_watcher(peer_id, track, packets_tx);
            }
            StreamKind::Unknown => {
                tracing::warn!("Unclassified stream {} from {}", stream_id, peer_id);
            }
        }
    }

    /// Read the inbound screen track until the sender removes it or the
    /// link closes. Share end is a track-level signal, not a message.
    /// `read_rtp` hands each packet to a single caller, so this task is
    /// the track's only reader and the application consumes the
    /// forwarded packets instead. Reading continues after the receiver
    /// is dropped so the end of the track is still observed.
    fn spawn_screen_watcher(
        &self,
        peer_id: Uuid,
        track: Arc<TrackRemote>,
        packets: mpsc::UnboundedSender<Packet>,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Ok((packet, _attributes)) = track.read_rtp().await {
                let _ = packets.send(packet);
            }
            manager.screen_track_ended(peer_id).await;
        });
    }

    async fn screen_track_ended(&self, peer_id: Uuid) {
        let ended = match self.inner.peers.write().await.get_mut(&peer_id) {
            Some(entry) => entry.screen_stream.take().is_some(),
            None => false,
        };
        if ended {
            tracing::info!("Screen share from {} ended", peer_id);
            let _ = self.inner.events.send(CallEvent::ScreenEnded { peer_id });
        }
    }

    async fn create_link(&self, peer_id: Uuid) -> Option<Arc<PeerLink>> {
        let link = match PeerLink::new(
            peer_id,
            &self.inner.ice_servers,
            self.inner.link_events_tx.clone(),
        )
        .await
        {
            Ok(link) => Arc::new(link),
            Err(e) => {
                tracing::error!("Failed to create link to {}: {}", peer_id, e);
                return None;
            }
        };

        for track in self.inner.media.call_tracks().await {
            if let Err(e) = link.add_track(track).await {
                tracing::error!("Failed to attach local track for {}: {}", peer_id, e);
                link.close().await;
                return None;
            }
        }
        Some(link)
    }

    async fn set_state(&self, peer_id: Uuid, state: LinkState) {
        if let Some(entry) = self.inner.peers.write().await.get_mut(&peer_id) {
            entry.state = state;
        }
    }

    async fn set_binding(&self, peer_id: Uuid, binding: StreamIds) {
        if let Some(entry) = self.inner.peers.write().await.get_mut(&peer_id) {
            entry.binding = binding;
        }
    }

    /// First completed negotiation connects the link and starts its
    /// activity monitor; renegotiations just return to `Connected`.
    async fn mark_connected(&self, peer_id: Uuid) {
        let mut peers = self.inner.peers.write().await;
        let Some(entry) = peers.get_mut(&peer_id) else {
            return;
        };
        entry.state = LinkState::Connected;
        if entry.monitor.is_none() {
            entry.monitor = Some(monitor::spawn(
                entry.link.clone(),
                self.inner.events.clone(),
            ));
            let _ = self.inner.events.send(CallEvent::LinkConnected { peer_id });
        }
    }

    async fn remove_peer(&self, peer_id: Uuid) {
        let entry = self.inner.peers.write().await.remove(&peer_id);
        self.inner.expected_offerers.write().await.remove(&peer_id);
        let Some(mut entry) = entry else {
            return;
        };

        entry.state = LinkState::Closed;
        if let Some(monitor) = entry.monitor.take() {
            monitor.abort();
        }
        entry.link.close().await;
        self.inner
            .roster
            .write()
            .await
            .retain(|m| m.connection_id != peer_id);
        let _ = self.inner.events.send(CallEvent::PeerLeft { peer_id });
    }

    async fn teardown_all(&self) {
        let entries: Vec<PeerEntry> = self.inner.peers.write().await.drain().map(|(_, e)| e).collect();
        self.inner.expected_offerers.write().await.clear();
        self.inner.roster.write().await.clear();
        for mut entry in entries {
            if let Some(monitor) = entry.monitor.take() {
                monitor.abort();
            }
            entry.link.close().await;
        }
    }
}
