//! Full-mesh negotiation tests.
//!
//! Managers are wired to an in-memory relay that mirrors the server's
//! routing semantics, so negotiation runs against real peer connections
//! without a network.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use huddle_client::{CallEvent, LinkState, MeshManager, SignalingTransport};
use huddle_protocol::{ClientMessage, DeviceKind, DeviceState, Identity, Member, ServerMessage};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

enum RelayCmd {
    Attach {
        conn_id: Uuid,
        sink: mpsc::UnboundedSender<ServerMessage>,
    },
    Message {
        conn_id: Uuid,
        message: ClientMessage,
    },
}

/// Minimal single-room relay with the same routing rules as the server:
/// snapshot unicast to the joiner, membership broadcast to everyone,
/// directed forwarding for offers, answers, and candidates.
struct Relay {
    tx: mpsc::UnboundedSender<RelayCmd>,
}

impl Relay {
    fn start() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RelayCmd>();
        tokio::spawn(async move {
            let mut clients: HashMap<Uuid, mpsc::UnboundedSender<ServerMessage>> = HashMap::new();
            let mut members: Vec<Member> = Vec::new();
            let mut room_id = Uuid::new_v4();

            while let Some(cmd) = rx.recv().await {
                match cmd {
                    RelayCmd::Attach { conn_id, sink } => {
                        let _ = sink.send(ServerMessage::Welcome {
                            connection_id: conn_id,
                        });
                        clients.insert(conn_id, sink);
                    }
                    RelayCmd::Message { conn_id, message } => match message {
                        ClientMessage::Join {
                            room_id: id,
                            identity,
                            device_state,
                            ..
                        } => {
                            room_id = id;
                            let snapshot = members.clone();
                            members.push(Member {
                                connection_id: conn_id,
                                identity,
                                device_state,
                            });
                            if let Some(sink) = clients.get(&conn_id) {
                                let _ = sink.send(ServerMessage::MembershipSnapshot {
                                    room_id,
                                    members: snapshot,
                                });
                            }
                            for sink in clients.values() {
                                let _ = sink.send(ServerMessage::MembershipUpdate {
                                    room_id,
                                    members: members.clone(),
                                });
                            }
                        }
                        ClientMessage::Offer {
                            receiver_id,
                            sdp,
                            stream_ids,
                            identity,
                            device_state,
                        } => {
                            if let Some(sink) = clients.get(&receiver_id) {
                                let _ = sink.send(ServerMessage::Offer {
                                    sender_id: conn_id,
                                    sdp,
                                    stream_ids,
                                    identity,
                                    device_state,
                                });
                            }
                        }
                        ClientMessage::Answer {
                            receiver_id,
                            sdp,
                            stream_ids,
                        } => {
                            if let Some(sink) = clients.get(&receiver_id) {
                                let _ = sink.send(ServerMessage::Answer {
                                    sender_id: conn_id,
                                    sdp,
                                    stream_ids,
                                });
                            }
                        }
                        ClientMessage::Candidate {
                            receiver_id,
                            candidate,
                        } => {
                            if let Some(sink) = clients.get(&receiver_id) {
                                let _ = sink.send(ServerMessage::Candidate {
                                    sender_id: conn_id,
                                    candidate,
                                });
                            }
                        }
                        ClientMessage::SetDeviceState {
                            identity_id,
                            kind,
                            value,
                            ..
                        } => {
                            for member in members.iter_mut() {
                                if member.identity.identity_id == identity_id {
                                    member.device_state.set(kind, value);
                                }
                            }
                            for sink in clients.values() {
                                let _ = sink.send(ServerMessage::DeviceStateChanged {
                                    room_id,
                                    identity_id: identity_id.clone(),
                                    kind,
                                    value,
                                });
                            }
                        }
                        ClientMessage::Leave => {
                            members.retain(|m| m.connection_id != conn_id);
                            for (id, sink) in &clients {
                                let _ = sink.send(ServerMessage::MembershipUpdate {
                                    room_id,
                                    members: members.clone(),
                                });
                                if *id != conn_id {
                                    let _ = sink.send(ServerMessage::PeerLeft {
                                        room_id,
                                        connection_id: conn_id,
                                    });
                                }
                            }
                        }
                        ClientMessage::Ping => {
                            if let Some(sink) = clients.get(&conn_id) {
                                let _ = sink.send(ServerMessage::Pong);
                            }
                        }
                        ClientMessage::SubscribeGroup { .. }
                        | ClientMessage::UnsubscribeGroup { .. } => {}
                    },
                }
            }
        });
        Self { tx }
    }
}

struct ChannelTransport {
    conn_id: Uuid,
    tx: mpsc::UnboundedSender<RelayCmd>,
}

#[async_trait]
impl SignalingTransport for ChannelTransport {
    async fn send(&self, message: ClientMessage) -> Result<()> {
        self.tx
            .send(RelayCmd::Message {
                conn_id: self.conn_id,
                message,
            })
            .map_err(|_| anyhow::anyhow!("relay gone"))
    }
}

struct TestClient {
    manager: MeshManager,
    events: mpsc::UnboundedReceiver<CallEvent>,
    conn_id: Uuid,
}

fn identity(name: &str) -> Identity {
    Identity {
        identity_id: name.to_string(),
        display_name: name.to_string(),
        avatar_url: None,
    }
}

async fn spawn_client(relay: &Relay, name: &str, room_id: Uuid) -> TestClient {
    let conn_id = Uuid::new_v4();
    let (sink, server_rx) = mpsc::unbounded_channel();
    relay
        .tx
        .send(RelayCmd::Attach { conn_id, sink })
        .expect("relay running");

    let transport = Arc::new(ChannelTransport {
        conn_id,
        tx: relay.tx.clone(),
    });
    let (manager, events) = MeshManager::new(
        room_id,
        "group-1".to_string(),
        identity(name),
        DeviceState::default(),
        Vec::new(),
        transport,
    );
    let runner = manager.clone();
    tokio::spawn(async move { runner.run(server_rx).await });

    manager.join().await.expect("join sent");
    TestClient {
        manager,
        events,
        conn_id,
    }
}

async fn wait_for_state(manager: &MeshManager, peer: Uuid, state: LinkState) {
    timeout(Duration::from_secs(5), async {
        loop {
            if manager.link_state(peer).await == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("link to {peer} never reached {state:?}"));
}

async fn wait_for_peer_count(manager: &MeshManager, count: usize) {
    timeout(Duration::from_secs(5), async {
        loop {
            if manager.peer_count().await == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("peer count never reached {count}"));
}

async fn wait_for_screen_binding(manager: &MeshManager, peer: Uuid, sharing: bool) {
    timeout(Duration::from_secs(5), async {
        loop {
            let screen = manager
                .binding_of(peer)
                .await
                .and_then(|binding| binding.screen);
            if screen.is_some() == sharing {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("screen binding for {peer} never became {sharing}"));
}

async fn expect_event<F>(events: &mut mpsc::UnboundedReceiver<CallEvent>, mut pred: F)
where
    F: FnMut(&CallEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if pred(&event) {
                return;
            }
        }
        panic!("event channel closed");
    })
    .await
    .expect("expected event within 5s");
}

#[tokio::test]
async fn existing_member_offers_and_both_sides_connect() {
    let relay = Relay::start();
    let room_id = Uuid::new_v4();

    let mut alice = spawn_client(&relay, "alice", room_id).await;
    let mut bob = spawn_client(&relay, "bob", room_id).await;

    wait_for_state(&alice.manager, bob.conn_id, LinkState::Connected).await;
    wait_for_state(&bob.manager, alice.conn_id, LinkState::Connected).await;

    assert_eq!(alice.manager.peer_count().await, 1);
    assert_eq!(bob.manager.peer_count().await, 1);

    // Stream IDs travel on the offer one way and the answer the other.
    let binding = bob.manager.binding_of(alice.conn_id).await.unwrap();
    assert!(binding.camera.is_some());
    assert!(binding.screen.is_none());
    let binding = alice.manager.binding_of(bob.conn_id).await.unwrap();
    assert!(binding.camera.is_some());

    let bob_id = bob.conn_id;
    expect_event(&mut alice.events, |e| {
        matches!(e, CallEvent::LinkConnected { peer_id } if *peer_id == bob_id)
    })
    .await;
    let alice_id = alice.conn_id;
    expect_event(&mut bob.events, |e| {
        matches!(e, CallEvent::LinkConnected { peer_id } if *peer_id == alice_id)
    })
    .await;
}

#[tokio::test]
async fn mesh_grows_and_shrinks_with_membership() {
    let relay = Relay::start();
    let room_id = Uuid::new_v4();

    let mut alice = spawn_client(&relay, "alice", room_id).await;
    let bob = spawn_client(&relay, "bob", room_id).await;
    let carol = spawn_client(&relay, "carol", room_id).await;

    for (manager, peers) in [
        (&alice.manager, [bob.conn_id, carol.conn_id]),
        (&bob.manager, [alice.conn_id, carol.conn_id]),
        (&carol.manager, [alice.conn_id, bob.conn_id]),
    ] {
        for peer in peers {
            wait_for_state(manager, peer, LinkState::Connected).await;
        }
        assert_eq!(manager.peer_count().await, 2);
    }

    carol.manager.leave().await.unwrap();

    wait_for_peer_count(&alice.manager, 1).await;
    wait_for_peer_count(&bob.manager, 1).await;
    assert_eq!(alice.manager.link_state(carol.conn_id).await, None);
    assert_eq!(
        alice.manager.link_state(bob.conn_id).await,
        Some(LinkState::Connected)
    );
    assert_eq!(carol.manager.peer_count().await, 0);

    let carol_id = carol.conn_id;
    expect_event(&mut alice.events, |e| {
        matches!(e, CallEvent::PeerLeft { peer_id } if *peer_id == carol_id)
    })
    .await;
}

#[tokio::test]
async fn relisted_member_does_not_restart_negotiation() {
    let relay = Relay::start();
    let room_id = Uuid::new_v4();

    let alice = spawn_client(&relay, "alice", room_id).await;
    let bob = spawn_client(&relay, "bob", room_id).await;

    wait_for_state(&alice.manager, bob.conn_id, LinkState::Connected).await;
    wait_for_state(&bob.manager, alice.conn_id, LinkState::Connected).await;

    // A broadcast re-listing both members, as every unrelated membership
    // change produces, must leave the established links untouched.
    let members = vec![
        Member {
            connection_id: alice.conn_id,
            identity: identity("alice"),
            device_state: DeviceState::default(),
        },
        Member {
            connection_id: bob.conn_id,
            identity: identity("bob"),
            device_state: DeviceState::default(),
        },
    ];
    for client in [&alice, &bob] {
        client
            .manager
            .handle_server_message(ServerMessage::MembershipUpdate {
                room_id,
                members: members.clone(),
            })
            .await;
    }

    // handle_server_message runs to completion before returning, so a
    // spurious re-offer would be visible as OfferSent here.
    assert_eq!(
        alice.manager.link_state(bob.conn_id).await,
        Some(LinkState::Connected)
    );
    assert_eq!(
        bob.manager.link_state(alice.conn_id).await,
        Some(LinkState::Connected)
    );
    assert_eq!(alice.manager.peer_count().await, 1);
    assert_eq!(bob.manager.peer_count().await, 1);
}

#[tokio::test]
async fn screen_share_renegotiates_the_connected_links() {
    let relay = Relay::start();
    let room_id = Uuid::new_v4();

    let alice = spawn_client(&relay, "alice", room_id).await;
    let bob = spawn_client(&relay, "bob", room_id).await;

    wait_for_state(&alice.manager, bob.conn_id, LinkState::Connected).await;
    wait_for_state(&bob.manager, alice.conn_id, LinkState::Connected).await;

    alice.manager.start_screen_share().await.unwrap();
    wait_for_screen_binding(&bob.manager, alice.conn_id, true).await;
    wait_for_state(&alice.manager, bob.conn_id, LinkState::Connected).await;

    // The second share attempt must fail while one is active.
    assert!(alice.manager.start_screen_share().await.is_err());

    alice.manager.stop_screen_share().await.unwrap();
    wait_for_screen_binding(&bob.manager, alice.conn_id, false).await;
    wait_for_state(&alice.manager, bob.conn_id, LinkState::Connected).await;
}

#[tokio::test]
async fn device_toggle_reaches_every_member() {
    let relay = Relay::start();
    let room_id = Uuid::new_v4();

    let alice = spawn_client(&relay, "alice", room_id).await;
    let mut bob = spawn_client(&relay, "bob", room_id).await;

    wait_for_state(&bob.manager, alice.conn_id, LinkState::Connected).await;

    alice
        .manager
        .set_device(DeviceKind::Mic, false)
        .await
        .unwrap();

    expect_event(&mut bob.events, |e| {
        matches!(
            e,
            CallEvent::DeviceStateChanged { identity_id, kind: DeviceKind::Mic, value: false }
                if identity_id.as_str() == "alice"
        )
    })
    .await;

    timeout(Duration::from_secs(5), async {
        loop {
            let muted = bob
                .manager
                .members()
                .await
                .iter()
                .any(|m| m.identity.identity_id == "alice" && !m.device_state.mic);
            if muted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("roster never recorded the mute");
}

#[tokio::test]
async fn stale_signaling_for_unknown_peers_is_dropped() {
    let relay = Relay::start();
    let (manager, _events) = MeshManager::new(
        Uuid::new_v4(),
        "group-1".to_string(),
        identity("alice"),
        DeviceState::default(),
        Vec::new(),
        Arc::new(ChannelTransport {
            conn_id: Uuid::new_v4(),
            tx: relay.tx.clone(),
        }),
    );

    let stranger = Uuid::new_v4();
    manager
        .handle_server_message(ServerMessage::Candidate {
            sender_id: stranger,
            candidate: "{\"candidate\":\"\"}".to_string(),
        })
        .await;
    manager
        .handle_server_message(ServerMessage::Answer {
            sender_id: stranger,
            sdp: "v=0".to_string(),
            stream_ids: Default::default(),
        })
        .await;
    manager
        .handle_server_message(ServerMessage::PeerLeft {
            room_id: Uuid::new_v4(),
            connection_id: stranger,
        })
        .await;

    assert_eq!(manager.peer_count().await, 0);
}
