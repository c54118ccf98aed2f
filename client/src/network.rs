//! Connection state machine and UDP runner.
//!
//! [`Client`] is socket-free: inbound packets go through
//! [`Client::handle_packet`], outbound packets accumulate in an outbox.
//! [`ClientRunner`] wraps it with the actual socket and the update-rate
//! tick loop. Keeping the protocol logic off the socket means the whole
//! handshake can be exercised with hand-built packets.

use crate::event_manager::ClientEventManager;
use crate::game::ClientGameState;
use log::{debug, error, info, warn};
use shared::chat::ChatMessage;
use shared::packets::{
    ClientPacketHeader, NetObject, PacketReader, PacketWriter, ServerPacketHeader,
    PROTOCOL_VERSION, UPDATE_INTERVAL_MS,
};
use shared::protocol::{
    AuthRequest, AuthResponse, ChatText, ClientSync, DisconnectNotice, InitRequest,
    LobbySnapshot, PositionUpdate, RoundEndNotice, ServerCommandBody, ServerSync,
    StartGameNotice, StartGameResponse, VoteBody, VoteStatusBody,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub name: String,
    pub password: Option<String>,
    pub spectate_only: bool,
    pub job_preferences: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Authenticating,
    Joining,
    Lobby,
    InGame,
}

pub struct Client {
    config: ClientConfig,
    phase: Phase,
    pub game: ClientGameState,
    pub events: ClientEventManager,
    pub latest_vote_status: VoteStatusBody,
    /// Smoothed round-trip estimate, zero until the first sample.
    avg_rtt_ms: f32,
    clock_start: Instant,
    outbox: Vec<Vec<u8>>,
    outgoing_chat: Vec<String>,
    outgoing_votes: Vec<VoteBody>,
    disconnect_reason: Option<String>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Client {
            config,
            phase: Phase::Disconnected,
            game: ClientGameState::new(),
            events: ClientEventManager::new(),
            latest_vote_status: VoteStatusBody::default(),
            avg_rtt_ms: 0.0,
            clock_start: Instant::now(),
            outbox: Vec::new(),
            outgoing_chat: Vec::new(),
            outgoing_votes: Vec::new(),
            disconnect_reason: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn disconnect_reason(&self) -> Option<&str> {
        self.disconnect_reason.as_deref()
    }

    pub fn avg_rtt_ms(&self) -> f32 {
        self.avg_rtt_ms
    }

    /// Milliseconds since this client was created; echoed back by the
    /// server for round-trip measurement.
    fn clock_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.clock_start).as_millis() as u64
    }

    /// Drains the packets queued since the last call.
    pub fn take_outbox(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbox)
    }

    fn queue_packet(&mut self, bytes: Vec<u8>) {
        self.outbox.push(bytes);
    }

    // ---- connection -------------------------------------------------------

    /// Starts the join handshake. The request is retransmitted every update
    /// until the server answers.
    pub fn connect(&mut self) {
        info!("Connecting as '{}'", self.config.name);
        self.phase = Phase::Authenticating;
        self.disconnect_reason = None;
        self.send_auth_request();
    }

    fn send_auth_request(&mut self) {
        let mut writer = PacketWriter::client(ClientPacketHeader::RequestAuth);
        let request = AuthRequest {
            version: PROTOCOL_VERSION,
            password: self.config.password.clone(),
        };
        if writer.write_body(&request).is_ok() {
            self.queue_packet(writer.into_bytes());
        }
    }

    fn send_init_request(&mut self) {
        let mut writer = PacketWriter::client(ClientPacketHeader::RequestInit);
        let request = InitRequest {
            name: self.config.name.clone(),
            job_preferences: self.config.job_preferences.clone(),
            spectate_only: self.config.spectate_only,
        };
        if writer.write_body(&request).is_ok() {
            self.queue_packet(writer.into_bytes());
        }
    }

    /// Tells the server we are leaving, then forgets the connection.
    pub fn disconnect(&mut self, reason: &str) {
        if self.phase != Phase::Disconnected {
            let mut writer = PacketWriter::client(ClientPacketHeader::Disconnect);
            if writer
                .write_body(&DisconnectNotice {
                    reason: reason.to_string(),
                })
                .is_ok()
            {
                self.queue_packet(writer.into_bytes());
            }
        }
        self.phase = Phase::Disconnected;
    }

    // ---- user actions -----------------------------------------------------

    /// Queues a chat line for the next update packet.
    pub fn send_chat(&mut self, text: &str) {
        self.outgoing_chat.push(text.to_string());
    }

    pub fn send_vote(&mut self, vote: VoteBody) {
        self.outgoing_votes.push(vote);
    }

    /// Sends a permission-gated command immediately. The server silently
    /// ignores it if this client lacks the permission.
    pub fn send_command(&mut self, command: ServerCommandBody) {
        let mut writer = PacketWriter::client(ClientPacketHeader::ServerCommand);
        if writer.write_body(&command).is_ok() {
            self.queue_packet(writer.into_bytes());
        }
    }

    /// Queues an interaction with an item through our own character.
    pub fn interact_with(&mut self, item_id: u16) -> bool {
        let Some(character) = self.game.my_character else {
            return false;
        };
        let payload = shared::protocol::EventPayload::Interact { item_id };
        match bincode::serialize(&payload) {
            Ok(bytes) => self.events.create_event(character, bytes).is_some(),
            Err(e) => {
                warn!("Failed to encode interaction: {}", e);
                false
            }
        }
    }

    // ---- inbound ----------------------------------------------------------

    /// Entry point for one inbound datagram.
    pub fn handle_packet(&mut self, data: &[u8], now: Instant) {
        let mut reader = PacketReader::new(data);
        let Some(header_byte) = reader.read_u8() else {
            return;
        };
        let Some(header) = ServerPacketHeader::from_byte(header_byte) else {
            debug!("Unknown packet header {}", header_byte);
            return;
        };

        match header {
            ServerPacketHeader::AuthResponse => self.handle_auth_response(&mut reader),
            ServerPacketHeader::LobbyUpdate => self.read_lobby_update(&mut reader, now),
            ServerPacketHeader::IngameUpdate => self.read_ingame_update(&mut reader, now),
            ServerPacketHeader::StartGame => self.handle_start_game(&mut reader),
            ServerPacketHeader::EndGame => self.handle_end_game(&mut reader),
            ServerPacketHeader::FileTransfer => {
                debug!("Ignoring file transfer record");
            }
            ServerPacketHeader::Disconnect => {
                let reason = reader
                    .read_body::<DisconnectNotice>()
                    .map(|n| n.reason)
                    .unwrap_or_else(|| "connection closed".to_string());
                warn!("Disconnected by server: {}", reason);
                self.disconnect_reason = Some(reason);
                self.phase = Phase::Disconnected;
            }
        }
    }

    fn handle_auth_response(&mut self, reader: &mut PacketReader) {
        if self.phase != Phase::Authenticating {
            return;
        }
        let Some(response) = reader.read_body::<AuthResponse>() else {
            return;
        };
        if !response.granted {
            let reason = response
                .reason
                .unwrap_or_else(|| "rejected".to_string());
            error!("Server refused the connection: {}", reason);
            self.disconnect_reason = Some(reason);
            self.phase = Phase::Disconnected;
            return;
        }
        info!("Authenticated, requesting a slot");
        self.phase = Phase::Joining;
        self.send_init_request();
    }

    fn handle_start_game(&mut self, reader: &mut PacketReader) {
        let Some(notice) = reader.read_body::<StartGameNotice>() else {
            return;
        };
        // retransmitted notices only need the ready response again
        if self.phase != Phase::InGame {
            self.events.clear();
            self.game.on_round_start(&notice);
            self.phase = Phase::InGame;
        }
        let mut writer = PacketWriter::client(ClientPacketHeader::ResponseStartGame);
        if writer
            .write_body(&StartGameResponse { ready: true })
            .is_ok()
        {
            self.queue_packet(writer.into_bytes());
        }
    }

    fn handle_end_game(&mut self, reader: &mut PacketReader) {
        let Some(notice) = reader.read_body::<RoundEndNotice>() else {
            return;
        };
        if self.game.round_running {
            self.game.on_round_end(notice.summary);
        }
        self.events.clear();
        if self.phase == Phase::InGame {
            self.phase = Phase::Lobby;
        }
    }

    fn apply_server_sync(&mut self, sync: &ServerSync, now: Instant) {
        self.events.ack(sync.last_recv_client_event);
        if sync.echo_clock_ms > 0 {
            let sample = self.clock_ms(now).saturating_sub(sync.echo_clock_ms) as f32;
            self.avg_rtt_ms = if self.avg_rtt_ms == 0.0 {
                sample
            } else {
                self.avg_rtt_ms * 0.875 + sample * 0.125
            };
        }
    }

    fn read_lobby_update(&mut self, reader: &mut PacketReader, now: Instant) {
        // the first lobby update completes the join handshake; an in-game
        // client still gets lobby updates between rounds and stays in-game
        // until the round-end notice
        if self.phase == Phase::Joining {
            self.phase = Phase::Lobby;
        }
        if self.phase != Phase::Lobby && self.phase != Phase::InGame {
            return;
        }

        while let Some(byte) = reader.read_u8() {
            let Some(object) = NetObject::from_byte(byte) else {
                warn!("Server sent unknown record kind {}", byte);
                return;
            };
            match object {
                NetObject::EndOfMessage => return,
                NetObject::SyncIds => {
                    if let Some(sync) = reader.read_body::<ServerSync>() {
                        self.apply_server_sync(&sync, now);
                    }
                }
                NetObject::LobbyState => {
                    if let Some(snapshot) = reader.read_body::<LobbySnapshot>() {
                        self.game.apply_lobby(snapshot);
                    }
                }
                NetObject::Vote => {
                    if let Some(status) = reader.read_body::<VoteStatusBody>() {
                        self.latest_vote_status = status;
                    }
                }
                NetObject::ChatMessage => {
                    if let Some(message) = reader.read_body::<ChatMessage>() {
                        self.game.add_chat(message);
                    }
                }
                other => {
                    debug!("Ignoring {:?} record in a lobby update", other);
                    if !reader.skip_body() {
                        return;
                    }
                }
            }
        }
    }

    fn read_ingame_update(&mut self, reader: &mut PacketReader, now: Instant) {
        if self.phase != Phase::InGame {
            return;
        }
        while let Some(byte) = reader.read_u8() {
            let Some(object) = NetObject::from_byte(byte) else {
                warn!("Server sent unknown record kind {}", byte);
                return;
            };
            match object {
                NetObject::EndOfMessage => return,
                NetObject::SyncIds => {
                    if let Some(sync) = reader.read_body::<ServerSync>() {
                        self.apply_server_sync(&sync, now);
                    }
                }
                NetObject::EntityState => {
                    if self
                        .events
                        .read_server_events(false, reader, &mut self.game)
                        .is_none()
                    {
                        return;
                    }
                }
                NetObject::EntityEventInitial => {
                    if self
                        .events
                        .read_server_events(true, reader, &mut self.game)
                        .is_none()
                    {
                        return;
                    }
                }
                NetObject::EntityPosition => {
                    if let Some(update) = reader.read_body::<PositionUpdate>() {
                        self.game.apply_position(&update);
                    }
                }
                NetObject::ChatMessage => {
                    if let Some(message) = reader.read_body::<ChatMessage>() {
                        self.game.add_chat(message);
                    }
                }
                other => {
                    debug!("Ignoring {:?} record in an in-game update", other);
                    if !reader.skip_body() {
                        return;
                    }
                }
            }
        }
    }

    // ---- outbound ---------------------------------------------------------

    /// Builds and queues the periodic update packet for the current phase.
    pub fn write_update(&mut self, now: Instant) {
        match self.phase {
            Phase::Disconnected => {}
            // handshake packets are small, resending every tick is fine
            Phase::Authenticating => self.send_auth_request(),
            Phase::Joining => self.send_init_request(),
            Phase::Lobby => {
                let mut writer = PacketWriter::client(ClientPacketHeader::UpdateLobby);
                if self.write_sync(&mut writer, now) {
                    self.write_chat_and_votes(&mut writer);
                    self.queue_packet(writer.finish());
                }
            }
            Phase::InGame => {
                let mut writer = PacketWriter::client(ClientPacketHeader::UpdateIngame);
                if self.write_sync(&mut writer, now) {
                    let avg_rtt = self.avg_rtt_ms;
                    self.events.write(&mut writer, now, avg_rtt);
                    self.write_chat_and_votes(&mut writer);
                    self.queue_packet(writer.finish());
                }
            }
        }
    }

    fn write_sync(&mut self, writer: &mut PacketWriter, now: Instant) -> bool {
        writer.write_object(NetObject::SyncIds);
        let sync = ClientSync {
            last_recv_event_id: self.events.last_recv_server_event,
            last_recv_chat_id: self.game.last_recv_chat_id,
            last_recv_lobby_update: self.game.last_recv_lobby_update,
            clock_ms: self.clock_ms(now),
        };
        writer.write_body(&sync).is_ok()
    }

    fn write_chat_and_votes(&mut self, writer: &mut PacketWriter) {
        for text in self.outgoing_chat.drain(..) {
            writer.write_object(NetObject::ChatMessage);
            if writer.write_body(&ChatText { text }).is_err() {
                return;
            }
        }
        for vote in self.outgoing_votes.drain(..) {
            writer.write_object(NetObject::Vote);
            if writer.write_body(&vote).is_err() {
                return;
            }
        }
    }
}

/// Socket loop around the state machine.
pub struct ClientRunner {
    socket: UdpSocket,
    server_addr: SocketAddr,
    pub client: Client,
}

impl ClientRunner {
    pub async fn new(
        server_addr: &str,
        config: ClientConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;
        Ok(ClientRunner {
            socket,
            server_addr,
            client: Client::new(config),
        })
    }

    async fn flush_outbox(&mut self) {
        for bytes in self.client.take_outbox() {
            if let Err(e) = self.socket.send_to(&bytes, self.server_addr).await {
                error!("Error sending packet: {}", e);
            }
        }
    }

    /// Runs until the server drops us or Ctrl+C.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.client.connect();
        self.flush_outbox().await;

        let mut update_interval = interval(Duration::from_millis(UPDATE_INTERVAL_MS));
        update_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut buffer = [0u8; 2048];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, addr)) => {
                            if addr == self.server_addr {
                                self.client.handle_packet(&buffer[..len], Instant::now());
                            }
                        }
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                }

                _ = update_interval.tick() => {
                    if self.client.phase() == Phase::Disconnected
                        && self.client.disconnect_reason().is_some()
                    {
                        return Ok(());
                    }
                    self.client.write_update(Instant::now());
                    self.flush_outbox().await;
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, leaving the server");
                    self.client.disconnect("quit");
                    self.flush_outbox().await;
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::chat::ChatMessageType;
    use shared::protocol::InitialLobbyData;

    fn test_client() -> Client {
        Client::new(ClientConfig {
            name: "Tester".to_string(),
            password: None,
            spectate_only: false,
            job_preferences: vec!["Captain".to_string()],
        })
    }

    fn lobby_packet(snapshot: Option<LobbySnapshot>) -> Vec<u8> {
        let mut writer = PacketWriter::server(ServerPacketHeader::LobbyUpdate);
        writer
            .write_body_at(NetObject::SyncIds, &ServerSync {
                last_recv_client_event: 0,
                last_sent_event_id: 0,
                echo_clock_ms: 0,
            });
        if let Some(snapshot) = snapshot {
            writer.write_body_at(NetObject::LobbyState, &snapshot);
        }
        writer.finish()
    }

    trait WriteAt {
        fn write_body_at<T: serde::Serialize>(&mut self, object: NetObject, body: &T);
    }

    impl WriteAt for PacketWriter {
        fn write_body_at<T: serde::Serialize>(&mut self, object: NetObject, body: &T) {
            self.write_object(object);
            self.write_body(body).unwrap();
        }
    }

    fn snapshot_with_initial(update_id: u16) -> LobbySnapshot {
        LobbySnapshot {
            update_id,
            server_name: "srv".to_string(),
            server_message: String::new(),
            game_started: false,
            allow_spectating: true,
            selected_sub: "Dugong".to_string(),
            selected_shuttle: "Selkie".to_string(),
            selected_mode: "sandbox".to_string(),
            level_seed: 7,
            auto_restart_timer: None,
            players: vec![],
            initial: Some(InitialLobbyData {
                your_id: 2,
                your_permissions: 0,
                sub_list: vec!["Dugong".to_string()],
                mode_list: vec!["sandbox".to_string()],
            }),
        }
    }

    #[test]
    fn test_handshake_reaches_lobby() {
        let mut client = test_client();
        let now = Instant::now();

        client.connect();
        let sent = client.take_outbox();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][0], ClientPacketHeader::RequestAuth as u8);

        let mut writer = PacketWriter::server(ServerPacketHeader::AuthResponse);
        writer
            .write_body(&AuthResponse {
                granted: true,
                reason: None,
            })
            .unwrap();
        client.handle_packet(&writer.into_bytes(), now);
        assert_eq!(client.phase(), Phase::Joining);
        let sent = client.take_outbox();
        assert_eq!(sent[0][0], ClientPacketHeader::RequestInit as u8);

        client.handle_packet(&lobby_packet(Some(snapshot_with_initial(3))), now);
        assert_eq!(client.phase(), Phase::Lobby);
        assert_eq!(client.game.my_id, 2);
        assert_eq!(client.game.last_recv_lobby_update, 3);
    }

    #[test]
    fn test_rejected_auth_disconnects() {
        let mut client = test_client();
        client.connect();

        let mut writer = PacketWriter::server(ServerPacketHeader::AuthResponse);
        writer
            .write_body(&AuthResponse {
                granted: false,
                reason: Some("wrong password".to_string()),
            })
            .unwrap();
        client.handle_packet(&writer.into_bytes(), Instant::now());
        assert_eq!(client.phase(), Phase::Disconnected);
        assert_eq!(client.disconnect_reason(), Some("wrong password"));
    }

    #[test]
    fn test_lobby_update_carries_chat_and_acks() {
        let mut client = test_client();
        client.phase = Phase::Lobby;
        client.send_chat("hello there");

        client.write_update(Instant::now());
        let sent = client.take_outbox();
        assert_eq!(sent.len(), 1);

        let mut reader = PacketReader::new(&sent[0]);
        assert_eq!(reader.read_u8(), Some(ClientPacketHeader::UpdateLobby as u8));
        assert_eq!(reader.read_u8(), Some(NetObject::SyncIds as u8));
        assert!(reader.read_body::<ClientSync>().is_some());
        assert_eq!(reader.read_u8(), Some(NetObject::ChatMessage as u8));
        let chat = reader.read_body::<ChatText>().unwrap();
        assert_eq!(chat.text, "hello there");
        assert_eq!(reader.read_u8(), Some(NetObject::EndOfMessage as u8));
    }

    #[test]
    fn test_incoming_chat_lands_in_log() {
        let mut client = test_client();
        client.phase = Phase::Lobby;

        let mut writer = PacketWriter::server(ServerPacketHeader::LobbyUpdate);
        writer.write_body_at(NetObject::ChatMessage, &ChatMessage {
            net_state_id: 1,
            sender: String::new(),
            text: "welcome".to_string(),
            kind: ChatMessageType::Server,
        });
        client.handle_packet(&writer.finish(), Instant::now());

        assert_eq!(client.game.chat_log.len(), 1);
        assert_eq!(client.game.last_recv_chat_id, 1);
    }

    #[test]
    fn test_start_game_acknowledged_with_ready() {
        let mut client = test_client();
        client.phase = Phase::Lobby;

        let mut writer = PacketWriter::server(ServerPacketHeader::StartGame);
        writer
            .write_body(&StartGameNotice {
                seed: 1,
                sub: "Dugong".to_string(),
                shuttle: "Selkie".to_string(),
                mode: "sandbox".to_string(),
                respawn_allowed: true,
                two_teams: false,
            })
            .unwrap();
        client.handle_packet(&writer.into_bytes(), Instant::now());

        assert_eq!(client.phase(), Phase::InGame);
        assert!(client.game.round_running);
        let sent = client.take_outbox();
        assert_eq!(sent[0][0], ClientPacketHeader::ResponseStartGame as u8);
    }

    #[test]
    fn test_rtt_sampled_from_echo() {
        let mut client = test_client();
        client.phase = Phase::InGame;
        let now = client.clock_start + Duration::from_millis(250);

        let mut writer = PacketWriter::server(ServerPacketHeader::IngameUpdate);
        writer.write_body_at(NetObject::SyncIds, &ServerSync {
            last_recv_client_event: 0,
            last_sent_event_id: 0,
            echo_clock_ms: 100,
        });
        client.handle_packet(&writer.finish(), now);

        assert_eq!(client.avg_rtt_ms(), 150.0);
    }

    #[test]
    fn test_rtt_smoothing_weights_new_samples() {
        use assert_approx_eq::assert_approx_eq;

        let mut client = test_client();
        client.phase = Phase::InGame;

        let first = client.clock_start + Duration::from_millis(300);
        let mut writer = PacketWriter::server(ServerPacketHeader::IngameUpdate);
        writer.write_body_at(NetObject::SyncIds, &ServerSync {
            last_recv_client_event: 0,
            last_sent_event_id: 0,
            echo_clock_ms: 100,
        });
        client.handle_packet(&writer.finish(), first);
        assert_approx_eq!(client.avg_rtt_ms(), 200.0, 0.001);

        // a slow round trip only nudges the average
        let second = client.clock_start + Duration::from_millis(1000);
        let mut writer = PacketWriter::server(ServerPacketHeader::IngameUpdate);
        writer.write_body_at(NetObject::SyncIds, &ServerSync {
            last_recv_client_event: 0,
            last_sent_event_id: 0,
            echo_clock_ms: 400,
        });
        client.handle_packet(&writer.finish(), second);
        assert_approx_eq!(client.avg_rtt_ms(), 200.0 * 0.875 + 600.0 * 0.125, 0.001);
    }
}
