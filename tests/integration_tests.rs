//! End-to-end tests wiring real clients against a real server session.
//!
//! No sockets are involved: the harness moves bytes between the client and
//! server outboxes exactly the way the network layers would, one simulated
//! update interval per pump. Everything here exercises the actual wire
//! format on both sides.

use client::network::{Client, ClientConfig, Phase};
use server::session::{ServerConfig, Session};
use server::world::EntityKind;
use shared::packets::{MTU, UPDATE_INTERVAL_MS};
use shared::protocol::{EventPayload, VoteBody};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

fn test_config() -> ServerConfig {
    ServerConfig {
        banlist_path: PathBuf::from("/nonexistent/banlist.json"),
        permissions_path: PathBuf::from("/nonexistent/permissions.json"),
        ..ServerConfig::default()
    }
}

/// A server session plus any number of clients, exchanging packets in
/// lockstep at the update rate.
struct Harness {
    session: Session,
    clients: Vec<(SocketAddr, Client)>,
    now: Instant,
    password: Option<String>,
}

impl Harness {
    fn new(config: ServerConfig) -> Self {
        let password = config.password.clone();
        Harness {
            session: Session::with_seed(config, 1),
            clients: Vec::new(),
            now: Instant::now(),
            password,
        }
    }

    /// One update interval: client packets in, server tick, server packets
    /// out, clients queue their next updates.
    fn pump(&mut self) {
        self.now += Duration::from_millis(UPDATE_INTERVAL_MS);
        let now = self.now;
        let dt = UPDATE_INTERVAL_MS as f32 / 1000.0;

        for (addr, client) in self.clients.iter_mut() {
            for bytes in client.take_outbox() {
                self.session.handle_packet(*addr, &bytes, now);
            }
        }

        self.session.tick(now, dt);
        self.session.write_clients(now);

        for (addr, bytes) in self.session.take_outbox() {
            if let Some((_, client)) = self.clients.iter_mut().find(|(a, _)| *a == addr) {
                client.handle_packet(&bytes, now);
            }
        }

        for (_, client) in self.clients.iter_mut() {
            client.write_update(now);
        }
    }

    fn pump_n(&mut self, n: usize) {
        for _ in 0..n {
            self.pump();
        }
    }

    /// Connects a new client and runs the join handshake to completion.
    fn join(&mut self, name: &str) -> usize {
        let addr: SocketAddr = format!("127.0.0.1:{}", 40000 + self.clients.len())
            .parse()
            .unwrap();
        let mut client = Client::new(ClientConfig {
            name: name.to_string(),
            password: self.password.clone(),
            spectate_only: false,
            job_preferences: Vec::new(),
        });
        client.connect();
        self.clients.push((addr, client));
        self.pump_n(4);
        self.clients.len() - 1
    }

    fn client(&self, index: usize) -> &Client {
        &self.clients[index].1
    }

    fn client_mut(&mut self, index: usize) -> &mut Client {
        &mut self.clients[index].1
    }

    /// Launches the round and pumps until every client is in the game.
    fn start_round(&mut self) {
        assert!(self.session.start_game(self.now));
        self.pump_n(6);
        assert_eq!(
            self.session.lifecycle.state,
            server::lifecycle::RoundState::InRound
        );
    }

    /// Server-side ID of a harness client.
    fn server_id(&self, index: usize) -> u8 {
        self.client(index).game.my_id
    }
}

#[test]
fn three_clients_see_the_same_round() {
    let mut harness = Harness::new(test_config());
    harness.join("alice");
    harness.join("bob");
    harness.join("carol");
    assert_eq!(harness.session.clients.len(), 3);
    for i in 0..3 {
        assert_eq!(harness.client(i).phase(), Phase::Lobby);
    }

    harness.start_round();
    harness.pump_n(4);

    // every client mirrors all three spawned characters and knows its own
    for i in 0..3 {
        let game = &harness.client(i).game;
        assert!(game.round_running);
        assert_eq!(game.entity_count(), 3);
        let my_character = game.my_character.expect("character assigned");
        assert!(game.entity(my_character).unwrap().alive);
    }

    // the join announcements reached everyone over chat
    let chat = &harness.client(0).game.chat_log;
    assert!(chat.iter().any(|m| m.text.contains("carol has joined")));
}

#[test]
fn departure_mid_round_parks_the_character() {
    let mut harness = Harness::new(test_config());
    harness.join("alice");
    harness.join("bob");
    harness.start_round();
    harness.pump_n(2);

    harness.client_mut(1).disconnect("quit");
    harness.pump_n(2);

    assert_eq!(harness.session.clients.len(), 1);
    // the character survives on a reconnect grace timer instead of dying
    assert_eq!(harness.session.clients.disconnected.len(), 1);
    let parked = harness.session.clients.disconnected[0].character.unwrap();
    assert!(harness
        .session
        .world
        .get(parked)
        .unwrap()
        .is_alive_character());

    let chat = &harness.client(0).game.chat_log;
    assert!(chat.iter().any(|m| m.text.contains("bob has left")));
}

#[test]
fn reconnect_reclaims_the_parked_character() {
    let mut harness = Harness::new(test_config());
    harness.join("alice");
    harness.join("bob");
    harness.start_round();
    harness.pump_n(2);

    let bob_id = harness.server_id(1);
    let parked = harness
        .session
        .clients
        .get(bob_id)
        .unwrap()
        .character
        .unwrap();
    harness.client_mut(1).disconnect("quit");
    harness.pump_n(2);
    assert_eq!(harness.session.clients.disconnected.len(), 1);

    // the same name joining again gets the character back instead of a
    // grace-expiry death
    let rejoined = harness.join("bob");
    harness.pump_n(4);

    assert!(harness.session.clients.disconnected.is_empty());
    let new_id = harness.server_id(rejoined);
    assert_eq!(
        harness.session.clients.get(new_id).unwrap().character,
        Some(parked)
    );
    assert!(harness
        .session
        .world
        .get(parked)
        .unwrap()
        .is_alive_character());
}

#[test]
fn joiner_during_the_countdown_is_taken_along() {
    let mut harness = Harness::new(test_config());
    harness.join("alice");
    assert!(harness.session.start_game(harness.now));

    // bob arrives between the launch and the first confirmation
    let late = harness.join("bob");
    harness.pump_n(6);
    assert_eq!(
        harness.session.lifecycle.state,
        server::lifecycle::RoundState::InRound
    );
    assert_eq!(harness.client(late).phase(), Phase::InGame);
    harness.pump_n(4);

    let bob_id = harness.server_id(late);
    let bob = harness.session.clients.get(bob_id).unwrap();
    assert!(bob.character.is_some());
    assert!(!bob.needs_mid_round_sync);
    assert!(harness.client(late).game.my_character.is_some());
}

#[test]
fn mid_round_joiner_backfills_event_history() {
    let mut harness = Harness::new(test_config());
    harness.join("alice");
    harness.start_round();
    harness.pump_n(2);

    // build up a history the late joiner has never seen
    let alice_id = harness.server_id(0);
    let character = harness
        .session
        .clients
        .get(alice_id)
        .unwrap()
        .character
        .unwrap();
    for i in 0..50u8 {
        let payload =
            bincode::serialize(&EventPayload::State { data: vec![1, i] }).unwrap();
        harness
            .session
            .events
            .create_event(&harness.session.world, character, payload);
    }
    harness.pump_n(4);

    let late = harness.join("bob");
    assert_eq!(harness.client(late).phase(), Phase::InGame);
    harness.pump_n(10);

    // the whole backlog arrived in order and the sync flag cleared
    let expected = harness.session.events.last_event_id();
    assert_eq!(
        harness.client(late).events.last_recv_server_event,
        expected
    );
    let bob_id = harness.server_id(late);
    assert!(!harness
        .session
        .clients
        .get(bob_id)
        .unwrap()
        .needs_mid_round_sync);

    let game = &harness.client(late).game;
    let mirrored = game.entity(character).expect("historical spawn applied");
    assert_eq!(mirrored.last_state, vec![1, 49]);
}

#[test]
fn position_floods_are_spread_over_packets() {
    let mut harness = Harness::new(test_config());
    harness.join("alice");
    harness.start_round();
    harness.pump_n(2);

    // far more moving entities than fit in a single datagram
    let ids: Vec<u16> = (0..200)
        .map(|i| {
            harness
                .session
                .world
                .spawn(EntityKind::Item, i as f32, 0.0, false)
        })
        .collect();
    for &id in &ids {
        harness.session.world.get_mut(id).unwrap().needs_position_update = true;
    }

    harness.session.write_clients(harness.now);
    let first_batch = harness.session.take_outbox();
    assert!(!first_batch.is_empty());
    for (_, bytes) in &first_batch {
        assert!(bytes.len() <= MTU, "packet of {} bytes over MTU", bytes.len());
    }

    let alice_id = harness.server_id(0);
    let backlog = harness
        .session
        .clients
        .get(alice_id)
        .unwrap()
        .pending_position_updates
        .len();
    assert!(backlog > 0, "everything fit in one packet, flood too small");

    // the leftovers drain over the following updates without new movement
    for _ in 0..5 {
        harness.session.write_clients(harness.now);
        for (_, bytes) in harness.session.take_outbox() {
            assert!(bytes.len() <= MTU);
        }
    }
    assert!(harness
        .session
        .clients
        .get(alice_id)
        .unwrap()
        .pending_position_updates
        .is_empty());
}

#[test]
fn kick_vote_threshold_tracks_departures() {
    let mut harness = Harness::new(test_config());
    harness.join("alice");
    harness.join("bob");
    harness.join("carol");
    harness.join("dave");

    // two of four votes is under the 60% bar
    let dave = harness.server_id(3);
    harness.client_mut(0).send_vote(VoteBody::Kick(dave));
    harness.client_mut(1).send_vote(VoteBody::Kick(dave));
    harness.pump_n(2);
    assert_eq!(harness.session.clients.len(), 4);

    // a non-voter leaving makes it two of three
    harness.client_mut(2).disconnect("quit");
    harness.pump_n(3);

    assert!(harness.session.clients.get(dave).is_none());
    assert_eq!(harness.client(3).phase(), Phase::Disconnected);
    assert!(harness
        .client(3)
        .disconnect_reason()
        .unwrap()
        .starts_with("Kicked"));
}

#[test]
fn wrong_password_is_refused() {
    let mut config = test_config();
    config.password = Some("hunter2".to_string());
    let mut harness = Harness::new(config);
    harness.password = None;

    harness.join("alice");
    assert_eq!(harness.client(0).phase(), Phase::Disconnected);
    assert_eq!(harness.client(0).disconnect_reason(), Some("wrong password"));
    assert!(harness.session.clients.is_empty());
}

#[test]
fn chat_crosses_the_wire_both_ways() {
    let mut harness = Harness::new(test_config());
    harness.join("alice");
    harness.join("bob");

    harness.client_mut(0).send_chat("ready when you are");
    harness.pump_n(3);

    let received = &harness.client(1).game.chat_log;
    let line = received
        .iter()
        .find(|m| m.text == "ready when you are")
        .expect("chat delivered");
    assert_eq!(line.sender, "alice");

    // the sender sees their own line echoed back too
    assert!(harness
        .client(0)
        .game
        .chat_log
        .iter()
        .any(|m| m.text == "ready when you are"));
}
