//! The server session: all authoritative state and packet handling, with no
//! socket attached.
//!
//! The network layer feeds inbound datagrams into [`Session::handle_packet`],
//! drives [`Session::tick`] and [`Session::write_clients`] on the update
//! interval, and drains [`Session::take_outbox`] onto the wire. Keeping the
//! session free of I/O means every protocol rule can be exercised in tests
//! with hand-built packets.
//!
//! Chat, voting and round lifecycle live in their own modules but extend
//! this type; this file owns connection handling and the read/write paths.

use crate::banlist::{BanList, SavedPermissions};
use crate::client::{ClientManager, DisconnectedClient, RemoteClient};
use crate::event_manager::ServerEventManager;
use crate::jobs::{default_jobs, JobPrefab};
use crate::lifecycle::{Lifecycle, RoundState};
use crate::permissions::ClientPermissions;
use crate::world::{World, CHARACTER_IGNORE_DISTANCE_SQR};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::event::decode_batch;
use shared::netid::{id_more_recent, NetId};
use shared::packets::{
    ClientPacketHeader, NetObject, PacketReader, PacketWriter, ServerPacketHeader, MTU,
    MTU_SAFETY_MARGIN, PROTOCOL_VERSION,
};
use shared::protocol::{
    AuthRequest, AuthResponse, ClientSync, DisconnectNotice, EventPayload, FileRequestBody,
    InitRequest, InitialLobbyData, LobbyPlayer, LobbySnapshot, PositionUpdate, ServerCommandBody,
    ServerSync, StartGameResponse, VoteStatusBody,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

/// Characters of clients that have not entered the round get killed after
/// this many seconds, matching the disconnect grace period.
pub const NOT_IN_GAME_KILL_SECONDS: f32 = 30.0;

/// How long a mid-round disconnector's character survives awaiting a
/// reconnect.
pub const DISCONNECT_GRACE_SECONDS: f32 = 30.0;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub port: u16,
    pub max_clients: usize,
    pub password: Option<String>,
    pub server_message: String,
    pub allow_spectating: bool,
    pub allow_respawn: bool,
    pub auto_restart: bool,
    pub banlist_path: PathBuf,
    pub permissions_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "Subsea Server".to_string(),
            port: 27015,
            max_clients: 16,
            password: None,
            server_message: String::new(),
            allow_spectating: true,
            allow_respawn: true,
            auto_restart: false,
            banlist_path: PathBuf::from("banlist.json"),
            permissions_path: PathBuf::from("permissions.json"),
        }
    }
}

/// Lobby contents replicated to clients through versioned snapshots.
#[derive(Debug)]
pub struct LobbyState {
    /// Bumped on every lobby-visible change; clients report the last ID
    /// they have seen and stale ones get a fresh snapshot.
    pub last_update_id: NetId,
    pub sub_list: Vec<String>,
    pub mode_list: Vec<String>,
    pub selected_sub: String,
    pub selected_shuttle: String,
    pub selected_mode: String,
    pub level_seed: u32,
}

impl Default for LobbyState {
    fn default() -> Self {
        Self {
            last_update_id: 1,
            sub_list: vec!["Dugong".to_string(), "Typhon".to_string()],
            mode_list: vec!["sandbox".to_string(), "mission".to_string(), "pvp".to_string()],
            selected_sub: "Dugong".to_string(),
            selected_shuttle: "Selkie".to_string(),
            selected_mode: "sandbox".to_string(),
            level_seed: 0,
        }
    }
}

/// Hook for a host-side display. All methods default to no-ops so headless
/// servers attach nothing.
pub trait Presenter {
    fn chat_message(&mut self, _message: &shared::chat::ChatMessage) {}
    fn round_state_changed(&mut self, _state: RoundState) {}
    fn flash_message(&mut self, _text: &str) {}
}

pub struct Session {
    pub config: ServerConfig,
    pub clients: ClientManager,
    pub world: World,
    pub events: ServerEventManager,
    pub lifecycle: Lifecycle,
    pub lobby: LobbyState,
    pub jobs: Vec<JobPrefab>,
    pub banlist: BanList,
    pub saved_permissions: SavedPermissions,
    pub presenter: Option<Box<dyn Presenter + Send>>,
    /// Human-readable record of the current round, flushed into the round
    /// summary at the end.
    pub round_log: Vec<String>,
    pub latest_vote_status: VoteStatusBody,
    outbox: Vec<(SocketAddr, Vec<u8>)>,
    pub(crate) rng: StdRng,
}

impl Session {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic construction for tests.
    pub fn with_seed(config: ServerConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: ServerConfig, rng: StdRng) -> Self {
        let banlist = BanList::load(&config.banlist_path);
        let saved_permissions = SavedPermissions::load(&config.permissions_path);
        Self {
            clients: ClientManager::new(config.max_clients),
            world: World::new(),
            events: ServerEventManager::new(),
            lifecycle: Lifecycle::new(),
            lobby: LobbyState::default(),
            jobs: default_jobs(),
            banlist,
            saved_permissions,
            presenter: None,
            round_log: Vec::new(),
            latest_vote_status: VoteStatusBody::default(),
            outbox: Vec::new(),
            rng,
            config,
        }
    }

    pub(crate) fn queue_packet(&mut self, addr: SocketAddr, bytes: Vec<u8>) {
        self.outbox.push((addr, bytes));
    }

    /// Drains the datagrams queued since the last call, in order.
    pub fn take_outbox(&mut self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn log_line(&mut self, line: String) {
        info!("{}", line);
        self.round_log.push(line);
    }

    /// Marks a lobby-visible change so every client gets a fresh snapshot.
    pub(crate) fn bump_lobby_update(&mut self) {
        self.lobby.last_update_id = self.lobby.last_update_id.wrapping_add(1);
        // zero means "never seen anything" on the client side
        if self.lobby.last_update_id == 0 {
            self.lobby.last_update_id = 1;
        }
    }

    // ---- inbound ----------------------------------------------------------

    /// Entry point for one inbound datagram.
    pub fn handle_packet(&mut self, addr: SocketAddr, data: &[u8], now: Instant) {
        let mut reader = PacketReader::new(data);
        let Some(header_byte) = reader.read_u8() else {
            return;
        };
        let Some(header) = ClientPacketHeader::from_byte(header_byte) else {
            debug!("Unknown packet header {} from {}", header_byte, addr);
            return;
        };

        match header {
            ClientPacketHeader::RequestAuth => self.handle_auth(addr, &mut reader),
            ClientPacketHeader::RequestInit => self.handle_init(addr, &mut reader, now),
            _ => {
                let Some(client_id) = self.clients.find_by_addr(addr) else {
                    debug!("Packet from unknown address {}", addr);
                    return;
                };
                if let Some(client) = self.clients.get_mut(client_id) {
                    client.last_seen = now;
                }
                match header {
                    ClientPacketHeader::ResponseStartGame => {
                        self.handle_response_startgame(client_id, &mut reader)
                    }
                    ClientPacketHeader::UpdateLobby => self.client_read_lobby(client_id, &mut reader),
                    ClientPacketHeader::UpdateIngame => {
                        self.client_read_ingame(client_id, &mut reader)
                    }
                    ClientPacketHeader::ServerCommand => {
                        self.handle_server_command(client_id, &mut reader)
                    }
                    ClientPacketHeader::FileRequest => {
                        self.handle_file_request(client_id, &mut reader)
                    }
                    ClientPacketHeader::Disconnect => {
                        let reason = reader
                            .read_body::<DisconnectNotice>()
                            .map(|n| n.reason)
                            .unwrap_or_else(|| "quit".to_string());
                        self.disconnect_client(client_id, &reason, true);
                    }
                    ClientPacketHeader::RequestAuth | ClientPacketHeader::RequestInit => {
                        unreachable!()
                    }
                }
            }
        }
    }

    fn handle_auth(&mut self, addr: SocketAddr, reader: &mut PacketReader) {
        let Some(request) = reader.read_body::<AuthRequest>() else {
            return;
        };
        if self.banlist.is_banned(addr.ip()) {
            // banned addresses get no response at all
            info!("Ignoring auth request from banned address {}", addr);
            return;
        }

        let (granted, reason) = if request.version != PROTOCOL_VERSION {
            (
                false,
                Some(format!(
                    "protocol version mismatch (server {}, client {})",
                    PROTOCOL_VERSION, request.version
                )),
            )
        } else if self.config.password.is_some() && request.password != self.config.password {
            (false, Some("wrong password".to_string()))
        } else {
            (true, None)
        };

        if !granted {
            info!("Rejected auth from {}: {:?}", addr, reason);
        }
        let mut writer = PacketWriter::server(ServerPacketHeader::AuthResponse);
        if let Err(e) = writer.write_body(&AuthResponse { granted, reason }) {
            warn!("Failed to encode auth response: {}", e);
            return;
        }
        self.queue_packet(addr, writer.into_bytes());
    }

    fn handle_init(&mut self, addr: SocketAddr, reader: &mut PacketReader, now: Instant) {
        let Some(request) = reader.read_body::<InitRequest>() else {
            return;
        };
        if self.banlist.is_banned(addr.ip()) {
            return;
        }
        if self.clients.find_by_addr(addr).is_some() {
            // retransmitted init from an already-joined client
            debug!("Duplicate init request from {}", addr);
            return;
        }

        let name = self.unique_name(request.name.trim());
        let Some(client_id) = self.clients.add_client(addr, name.clone()) else {
            let mut writer = PacketWriter::server(ServerPacketHeader::Disconnect);
            if writer
                .write_body(&DisconnectNotice {
                    reason: "server full".to_string(),
                })
                .is_ok()
            {
                self.queue_packet(addr, writer.into_bytes());
            }
            return;
        };

        let joined_mid_round = self.lifecycle.state == RoundState::InRound;
        if let Some(client) = self.clients.get_mut(client_id) {
            client.last_seen = now;
            client.spectate_only = request.spectate_only && self.config.allow_spectating;
            client.job_preferences = request.job_preferences;
            client.permissions = self.saved_permissions.get(&name);
            client.joined_mid_round = joined_mid_round;
        }

        // a returning player picks their parked character back up before
        // the grace timer kills it
        if let Some(pos) = self
            .clients
            .disconnected
            .iter()
            .position(|r| r.name == name)
        {
            let record = self.clients.disconnected.swap_remove(pos);
            if let Some(character_id) = record.character {
                let team = self
                    .world
                    .get_mut(character_id)
                    .and_then(|e| e.character.as_mut())
                    .map(|c| {
                        c.client_id = Some(client_id);
                        c.team
                    });
                if let Some(client) = self.clients.get_mut(client_id) {
                    client.character = Some(character_id);
                    if let Some(team) = team {
                        client.team = team;
                    }
                }
                info!("{} reclaims character {} on reconnect", name, character_id);
            }
        }

        match self.lifecycle.state {
            // the client enters the round immediately and backfills history
            RoundState::InRound => self.send_start_notice(addr),
            // a joiner during the countdown is taken along: the handshake
            // waits for them and the round spawns them a character
            RoundState::Starting => {
                if let Some(handshake) = self.lifecycle.handshake.as_mut() {
                    handshake.enroll(client_id);
                }
                self.send_start_notice(addr);
            }
            _ => {}
        }

        self.bump_lobby_update();
        self.server_chat(format!("{} has joined the server.", name));
        self.update_vote_status();
    }

    /// Appends a numeric suffix until the name is free.
    fn unique_name(&self, requested: &str) -> String {
        let base = if requested.is_empty() { "Player" } else { requested };
        if self.clients.find_by_name(base).is_none() {
            return base.to_string();
        }
        let mut n = 2;
        loop {
            let candidate = format!("{}-{}", base, n);
            if self.clients.find_by_name(&candidate).is_none() {
                return candidate;
            }
            n += 1;
        }
    }

    fn handle_response_startgame(&mut self, client_id: u8, reader: &mut PacketReader) {
        let Some(response) = reader.read_body::<StartGameResponse>() else {
            return;
        };
        if let Some(client) = self.clients.get_mut(client_id) {
            client.ready_to_start = response.ready;
        }
        if let Some(handshake) = self.lifecycle.handshake.as_mut() {
            if response.ready {
                handshake.mark_ready(client_id);
            } else {
                // the client will catch up through mid-round sync instead
                handshake.forget(client_id);
                if let Some(client) = self.clients.get_mut(client_id) {
                    client.joined_mid_round = true;
                }
            }
        }
    }

    fn client_read_lobby(&mut self, client_id: u8, reader: &mut PacketReader) {
        while let Some(byte) = reader.read_u8() {
            let Some(object) = NetObject::from_byte(byte) else {
                warn!("Client {} sent unknown record kind {}", client_id, byte);
                return;
            };
            match object {
                NetObject::EndOfMessage => return,
                NetObject::SyncIds => {
                    let Some(sync) = reader.read_body::<ClientSync>() else {
                        continue;
                    };
                    self.apply_client_sync(client_id, &sync);
                }
                NetObject::ChatMessage => {
                    if let Some(chat) = reader.read_body::<shared::protocol::ChatText>() {
                        self.send_chat(client_id, &chat.text);
                    }
                }
                NetObject::Vote => {
                    if let Some(vote) = reader.read_body::<shared::protocol::VoteBody>() {
                        self.handle_vote(client_id, vote);
                    }
                }
                other => {
                    debug!(
                        "Ignoring {:?} record in a lobby packet from client {}",
                        other, client_id
                    );
                    if !reader.skip_body() {
                        return;
                    }
                }
            }
        }
    }

    fn client_read_ingame(&mut self, client_id: u8, reader: &mut PacketReader) {
        // the first in-game packet is the signal that the client has loaded
        // the round
        let mut begin_sync = false;
        if let Some(client) = self.clients.get_mut(client_id) {
            if !client.in_game {
                client.in_game = true;
                begin_sync = client.joined_mid_round;
            }
        }
        if begin_sync {
            if let Some(client) = self.clients.get_mut(client_id) {
                self.events.begin_mid_round_sync(client);
            }
        }

        while let Some(byte) = reader.read_u8() {
            let Some(object) = NetObject::from_byte(byte) else {
                warn!("Client {} sent unknown record kind {}", client_id, byte);
                return;
            };
            match object {
                NetObject::EndOfMessage => return,
                NetObject::SyncIds => {
                    let Some(sync) = reader.read_body::<ClientSync>() else {
                        continue;
                    };
                    self.apply_client_sync(client_id, &sync);
                    if let Some(client) = self.clients.get_mut(client_id) {
                        self.events.read_acks(client, sync.last_recv_event_id);
                    }
                }
                NetObject::EntityState => {
                    let Some((_, entries)) = decode_batch(reader) else {
                        return;
                    };
                    self.read_client_events(client_id, entries);
                }
                NetObject::ChatMessage => {
                    if let Some(chat) = reader.read_body::<shared::protocol::ChatText>() {
                        self.send_chat(client_id, &chat.text);
                    }
                }
                NetObject::Vote => {
                    if let Some(vote) = reader.read_body::<shared::protocol::VoteBody>() {
                        self.handle_vote(client_id, vote);
                    }
                }
                other => {
                    debug!(
                        "Ignoring {:?} record in an in-game packet from client {}",
                        other, client_id
                    );
                    if !reader.skip_body() {
                        return;
                    }
                }
            }
        }
    }

    fn apply_client_sync(&mut self, client_id: u8, sync: &ClientSync) {
        let Some(client) = self.clients.get_mut(client_id) else {
            return;
        };
        client.last_clock_ms = sync.clock_ms;
        if sync.last_recv_lobby_update != client.last_recv_lobby_update
            && id_more_recent(sync.last_recv_lobby_update, client.last_recv_lobby_update)
        {
            client.last_recv_lobby_update = sync.last_recv_lobby_update;
        }
        if sync.last_recv_chat_id != client.last_recv_chat_id
            && id_more_recent(sync.last_recv_chat_id, client.last_recv_chat_id)
        {
            client.last_recv_chat_id = sync.last_recv_chat_id;
            let cursor = client.last_recv_chat_id;
            client
                .chat_queue
                .retain(|m| m.net_state_id != cursor && id_more_recent(m.net_state_id, cursor));
        }
    }

    /// Applies a batch of client-authored events with strict ID continuity:
    /// only the next expected ID advances the cursor, duplicates and
    /// retransmissions are dropped silently.
    fn read_client_events(
        &mut self,
        client_id: u8,
        entries: Vec<(NetId, shared::event::BatchEntry)>,
    ) {
        let Some(client) = self.clients.get(client_id) else {
            return;
        };
        let mut cursor = client.last_client_event_recv;
        let character = client.character;

        for (id, entry) in entries {
            if id != cursor.wrapping_add(1) {
                continue;
            }
            cursor = id;
            if let shared::event::BatchEntry::Payload { entity_id, payload } = entry {
                self.apply_client_event(client_id, character, entity_id, &payload);
            }
        }

        if let Some(client) = self.clients.get_mut(client_id) {
            client.last_client_event_recv = cursor;
        }
    }

    /// A single client event. Invalid targets are dropped per event; the
    /// connection is never punished for them.
    fn apply_client_event(
        &mut self,
        client_id: u8,
        character: Option<u16>,
        entity_id: u16,
        payload: &[u8],
    ) {
        let Some(character_id) = character else {
            debug!("Client {} sent an event but has no character", client_id);
            return;
        };
        if !self
            .world
            .get(character_id)
            .map_or(false, |c| c.is_alive_character())
        {
            debug!("Client {} sent an event while dead", client_id);
            return;
        }
        let Ok(event) = bincode::deserialize::<EventPayload>(payload) else {
            warn!("Client {} sent an undecodable event payload", client_id);
            return;
        };

        match event {
            EventPayload::Interact { item_id } => {
                if !self.world.is_active(item_id) || !self.world.is_active(entity_id) {
                    debug!("Client {} interacted with a missing entity", client_id);
                    return;
                }
                // rebroadcast the resulting state change to everyone
                if let Some(bytes) = encode_event_payload(&EventPayload::State {
                    data: item_id.to_le_bytes().to_vec(),
                }) {
                    self.events.create_event(&self.world, entity_id, bytes);
                }
            }
            EventPayload::Command { action } => {
                if entity_id != character_id {
                    debug!(
                        "Client {} tried to command entity {} (own character is {})",
                        client_id, entity_id, character_id
                    );
                    return;
                }
                if let Some(bytes) =
                    encode_event_payload(&EventPayload::State { data: vec![action] })
                {
                    self.events.create_event(&self.world, character_id, bytes);
                }
            }
            _ => {
                // Spawn/Despawn/State are server-authored kinds
                warn!(
                    "Client {} sent a server-only event kind, dropping",
                    client_id
                );
            }
        }
    }

    fn handle_server_command(&mut self, client_id: u8, reader: &mut PacketReader) {
        let Some(command) = reader.read_body::<ServerCommandBody>() else {
            return;
        };
        let required = match &command {
            ServerCommandBody::Kick { .. } => ClientPermissions::KICK,
            ServerCommandBody::Ban { .. } => ClientPermissions::BAN,
            ServerCommandBody::EndRound => ClientPermissions::END_ROUND,
            ServerCommandBody::SelectSub { .. } => ClientPermissions::SELECT_SUB,
            ServerCommandBody::SelectMode { .. } => ClientPermissions::SELECT_MODE,
            ServerCommandBody::ManageCampaign { .. } => ClientPermissions::MANAGE_CAMPAIGN,
        };
        let Some(client) = self.clients.get(client_id) else {
            return;
        };
        if !client.has_permission(required) {
            // no feedback to the client, just an audit line
            warn!(
                "Client {} ({}) attempted {:?} without permission",
                client_id, client.name, command
            );
            return;
        }
        let issuer = client.name.clone();

        match command {
            ServerCommandBody::Kick { target, reason } => {
                self.log_line(format!("{} kicked {}: {}", issuer, target, reason));
                self.kick_client(&target, &reason);
            }
            ServerCommandBody::Ban { target, reason } => {
                self.log_line(format!("{} banned {}: {}", issuer, target, reason));
                self.ban_client(&target, &reason);
            }
            ServerCommandBody::EndRound => {
                self.log_line(format!("{} ended the round", issuer));
                self.end_game("Round ended by a moderator.");
            }
            ServerCommandBody::SelectSub { name } => {
                if self.lobby.sub_list.iter().any(|s| s == &name) {
                    self.lobby.selected_sub = name;
                    self.bump_lobby_update();
                } else {
                    warn!("{} selected unknown submarine {:?}", issuer, name);
                }
            }
            ServerCommandBody::SelectMode { name } => {
                if self.lobby.mode_list.iter().any(|m| m == &name) {
                    self.lobby.selected_mode = name;
                    self.bump_lobby_update();
                } else {
                    warn!("{} selected unknown mode {:?}", issuer, name);
                }
            }
            ServerCommandBody::ManageCampaign { action } => {
                self.log_line(format!("{} issued campaign action {:?}", issuer, action));
            }
        }
    }

    fn handle_file_request(&mut self, client_id: u8, reader: &mut PacketReader) {
        let Some(request) = reader.read_body::<FileRequestBody>() else {
            return;
        };
        // transfers are delegated to an external collaborator; log the
        // request so missing content is diagnosable
        info!(
            "Client {} requested file {:?} (transfers not hosted here)",
            client_id, request.file_name
        );
    }

    // ---- departures -------------------------------------------------------

    /// Removes a client. With `grace` set and a round running, the client's
    /// character is parked for [`DISCONNECT_GRACE_SECONDS`] in case they
    /// reconnect; otherwise the character dies immediately.
    pub fn disconnect_client(&mut self, client_id: u8, reason: &str, grace: bool) {
        let Some(client) = self.clients.remove_client(client_id) else {
            return;
        };
        if let Some(handshake) = self.lifecycle.handshake.as_mut() {
            handshake.forget(client_id);
        }
        self.finalize_departure(client, reason, grace);
    }

    pub(crate) fn finalize_departure(&mut self, client: RemoteClient, reason: &str, grace: bool) {
        if let Some(character_id) = client.character {
            if grace
                && self.lifecycle.state == RoundState::InRound
                && self
                    .world
                    .get(character_id)
                    .map_or(false, |c| c.is_alive_character())
            {
                self.clients.disconnected.push(DisconnectedClient {
                    name: client.name.clone(),
                    character: Some(character_id),
                    grace_timer: DISCONNECT_GRACE_SECONDS,
                });
            } else {
                self.kill_character(character_id);
            }
        }
        self.server_chat(format!("{} has left the server ({}).", client.name, reason));
        self.bump_lobby_update();
        self.update_vote_status();
    }

    pub(crate) fn kill_character(&mut self, character_id: u16) {
        if let Some(entity) = self.world.get_mut(character_id) {
            if let Some(character) = entity.character.as_mut() {
                if !character.alive {
                    return;
                }
                character.alive = false;
                character.conscious = false;
            }
        }
        if let Some(bytes) = encode_event_payload(&EventPayload::State { data: vec![0] }) {
            self.events.create_event(&self.world, character_id, bytes);
        }
    }

    /// Sends a disconnect notice and drops the client, no reconnect grace.
    pub fn kick_client(&mut self, target_name: &str, reason: &str) {
        let Some(client_id) = self.clients.find_by_name(target_name) else {
            warn!("Kick target {:?} not found", target_name);
            return;
        };
        let addr = self.clients.get(client_id).map(|c| c.addr);
        if let Some(addr) = addr {
            let mut writer = PacketWriter::server(ServerPacketHeader::Disconnect);
            if writer
                .write_body(&DisconnectNotice {
                    reason: format!("Kicked: {}", reason),
                })
                .is_ok()
            {
                self.queue_packet(addr, writer.into_bytes());
            }
        }
        self.disconnect_client(client_id, &format!("kicked: {}", reason), false);
    }

    pub fn ban_client(&mut self, target_name: &str, reason: &str) {
        let Some(client_id) = self.clients.find_by_name(target_name) else {
            warn!("Ban target {:?} not found", target_name);
            return;
        };
        if let Some(client) = self.clients.get(client_id) {
            let ip = client.addr.ip();
            let name = client.name.clone();
            self.banlist.add(ip, &name, reason);
        }
        self.kick_client(target_name, reason);
    }

    // ---- outbound ---------------------------------------------------------

    pub(crate) fn send_start_notice(&mut self, addr: SocketAddr) {
        let notice = self.lifecycle.start_notice(&self.lobby);
        let mut writer = PacketWriter::server(ServerPacketHeader::StartGame);
        if let Err(e) = writer.write_body(&notice) {
            warn!("Failed to encode start-game notice: {}", e);
            return;
        }
        self.queue_packet(addr, writer.into_bytes());
    }

    /// Writes one update packet to every connected client.
    pub fn write_clients(&mut self, now: Instant) {
        // clients that never load in don't get to keep an invulnerable
        // character forever
        if self.lifecycle.state == RoundState::InRound {
            if let Some(started) = self.lifecycle.round_start {
                if now.saturating_duration_since(started).as_secs_f32() > NOT_IN_GAME_KILL_SECONDS {
                    let stragglers: Vec<u16> = self
                        .clients
                        .iter()
                        .filter(|c| !c.in_game)
                        .filter_map(|c| c.character)
                        .filter(|&id| {
                            self.world.get(id).map_or(false, |e| e.is_alive_character())
                        })
                        .collect();
                    for character_id in stragglers {
                        info!(
                            "Killing character {} (owner never entered the round)",
                            character_id
                        );
                        self.kill_character(character_id);
                    }
                }
            }
        }

        for client_id in self.clients.ids() {
            let in_game = self.clients.get(client_id).map_or(false, |c| c.in_game);
            if in_game && self.lifecycle.state == RoundState::InRound {
                self.client_write_ingame(client_id);
            } else {
                self.client_write_lobby(client_id);
            }
        }
        self.world.clear_position_flags();
    }

    fn client_write_lobby(&mut self, client_id: u8) {
        let Some(client) = self.clients.get(client_id) else {
            return;
        };
        let addr = client.addr;
        let stale = client.last_recv_lobby_update != self.lobby.last_update_id;

        let mut writer = PacketWriter::server(ServerPacketHeader::LobbyUpdate);
        writer.write_object(NetObject::SyncIds);
        let sync = ServerSync {
            last_recv_client_event: client.last_client_event_recv,
            last_sent_event_id: self.events.last_event_id(),
            echo_clock_ms: client.last_clock_ms,
        };
        if writer.write_body(&sync).is_err() {
            return;
        }

        if stale {
            let snapshot = self.build_lobby_snapshot(client_id);
            writer.write_object(NetObject::LobbyState);
            if writer.write_body(&snapshot).is_err() {
                return;
            }
            writer.write_object(NetObject::Vote);
            if writer.write_body(&self.latest_vote_status).is_err() {
                return;
            }
        }

        if let Some(client) = self.clients.get_mut(client_id) {
            write_chat_messages(client, &mut writer);
        }
        self.queue_packet(addr, writer.finish());
    }

    fn build_lobby_snapshot(&self, client_id: u8) -> LobbySnapshot {
        let players = {
            let mut ids = self.clients.ids();
            ids.sort_unstable();
            ids.into_iter()
                .filter_map(|id| self.clients.get(id))
                .map(|c| LobbyPlayer {
                    id: c.id,
                    name: c.name.clone(),
                    character_id: c.character.unwrap_or(0),
                })
                .collect()
        };
        let initial = self.clients.get(client_id).and_then(|c| {
            if c.last_recv_lobby_update == 0 {
                Some(InitialLobbyData {
                    your_id: c.id,
                    your_permissions: c.permissions.bits(),
                    sub_list: self.lobby.sub_list.clone(),
                    mode_list: self.lobby.mode_list.clone(),
                })
            } else {
                None
            }
        });
        LobbySnapshot {
            update_id: self.lobby.last_update_id,
            server_name: self.config.name.clone(),
            server_message: self.config.server_message.clone(),
            game_started: self.lifecycle.state != RoundState::Lobby,
            allow_spectating: self.config.allow_spectating,
            selected_sub: self.lobby.selected_sub.clone(),
            selected_shuttle: self.lobby.selected_shuttle.clone(),
            selected_mode: self.lobby.selected_mode.clone(),
            level_seed: self.lobby.level_seed,
            auto_restart_timer: self.lifecycle.auto_restart_timer,
            players,
            initial,
        }
    }

    fn client_write_ingame(&mut self, client_id: u8) {
        let Some(client) = self.clients.get(client_id) else {
            return;
        };
        let addr = client.addr;
        let syncing = client.needs_mid_round_sync;
        let character = client.character;

        // gather entities worth a position record for this client before
        // taking the mutable borrow
        let mut fresh_positions: Vec<u16> = Vec::new();
        if !syncing {
            let observer = character.and_then(|id| self.world.get(id));
            for entity in self.world.entities() {
                if entity.removed || !entity.needs_position_update {
                    continue;
                }
                if entity.character.is_some() {
                    if let Some(observer) = observer {
                        if observer.id != entity.id
                            && observer.distance_sqr_to(entity) > CHARACTER_IGNORE_DISTANCE_SQR
                        {
                            continue;
                        }
                    }
                }
                fresh_positions.push(entity.id);
            }
        }

        let mut writer = PacketWriter::server(ServerPacketHeader::IngameUpdate);
        writer.write_object(NetObject::SyncIds);
        let sync = ServerSync {
            last_recv_client_event: client.last_client_event_recv,
            last_sent_event_id: self.events.last_event_id(),
            echo_clock_ms: client.last_clock_ms,
        };
        if writer.write_body(&sync).is_err() {
            return;
        }

        let Some(client) = self.clients.get_mut(client_id) else {
            return;
        };
        self.events.write(client, &self.world, &mut writer);
        write_chat_messages(client, &mut writer);

        if !syncing {
            for entity_id in fresh_positions {
                if !client.pending_position_updates.contains(&entity_id) {
                    client.pending_position_updates.push_back(entity_id);
                }
            }
            // leftovers stay queued for the next packet
            while writer.len() + 32 <= MTU - MTU_SAFETY_MARGIN {
                let Some(entity_id) = client.pending_position_updates.pop_front() else {
                    break;
                };
                let Some(entity) = self.world.get(entity_id) else {
                    continue;
                };
                if entity.removed {
                    continue;
                }
                writer.write_object(NetObject::EntityPosition);
                if writer
                    .write_body(&PositionUpdate {
                        entity_id,
                        x: entity.x,
                        y: entity.y,
                    })
                    .is_err()
                {
                    break;
                }
            }
        }

        let bytes = writer.finish();
        if bytes.len() > MTU {
            warn!(
                "In-game packet for client {} is {} bytes, over the {} MTU",
                client_id,
                bytes.len(),
                MTU
            );
        }
        self.queue_packet(addr, bytes);
    }

    // ---- per-tick upkeep --------------------------------------------------

    /// One pass of simulation-side upkeep: timers, timeouts and the round
    /// lifecycle. Inbound packets must already have been drained.
    pub fn tick(&mut self, now: Instant, dt: f32) {
        for client in self.clients.iter_mut() {
            client.chat_spam_timer = (client.chat_spam_timer - dt).max(0.0);
        }

        // reconnect grace for characters of dropped clients
        let mut expired: Vec<u16> = Vec::new();
        for record in self.clients.disconnected.iter_mut() {
            record.grace_timer -= dt;
            if record.grace_timer <= 0.0 {
                if let Some(character_id) = record.character {
                    expired.push(character_id);
                }
            }
        }
        self.clients.disconnected.retain(|r| r.grace_timer > 0.0);
        for character_id in expired {
            self.kill_character(character_id);
        }

        let timed_out = self.clients.check_timeouts(now);
        for client in timed_out {
            let id = client.id;
            if let Some(handshake) = self.lifecycle.handshake.as_mut() {
                handshake.forget(id);
            }
            self.finalize_departure(client, "timed out", true);
        }

        self.update_lifecycle(now, dt);
    }

    /// Moves an entity and flags it for replication.
    pub fn move_entity(&mut self, entity_id: u16, x: f32, y: f32) {
        if let Some(entity) = self.world.get_mut(entity_id) {
            entity.x = x;
            entity.y = y;
            entity.needs_position_update = true;
        }
    }
}

/// Writes the unacknowledged tail of a client's chat queue, oldest first,
/// within the per-packet cap and the MTU budget.
pub(crate) fn write_chat_messages(client: &mut RemoteClient, writer: &mut PacketWriter) {
    use shared::packets::MAX_CHAT_MESSAGES_PER_PACKET;

    let mut written = 0;
    for message in &client.chat_queue {
        if message.net_state_id == client.last_recv_chat_id
            || !id_more_recent(message.net_state_id, client.last_recv_chat_id)
        {
            continue;
        }
        if written >= MAX_CHAT_MESSAGES_PER_PACKET {
            break;
        }
        // rough upper bound for the record about to be written
        if writer.len() + message.text.len() + message.sender.len() + 40 > MTU - MTU_SAFETY_MARGIN {
            break;
        }
        writer.write_object(NetObject::ChatMessage);
        if writer.write_body(message).is_err() {
            break;
        }
        client.last_sent_chat_id = message.net_state_id;
        written += 1;
    }
}

/// Encodes an event payload, logging instead of panicking on the (never
/// expected) serialization failure.
pub(crate) fn encode_event_payload(payload: &EventPayload) -> Option<Vec<u8>> {
    match bincode::serialize(payload) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("Failed to encode an event payload: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session() -> Session {
        let config = ServerConfig {
            banlist_path: PathBuf::from("/nonexistent/banlist.json"),
            permissions_path: PathBuf::from("/nonexistent/permissions.json"),
            ..ServerConfig::default()
        };
        Session::with_seed(config, 7)
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn auth_packet(version: u32) -> Vec<u8> {
        let mut writer = PacketWriter::client(ClientPacketHeader::RequestAuth);
        writer
            .write_body(&AuthRequest {
                version,
                password: None,
            })
            .unwrap();
        writer.into_bytes()
    }

    fn init_packet(name: &str) -> Vec<u8> {
        let mut writer = PacketWriter::client(ClientPacketHeader::RequestInit);
        writer
            .write_body(&InitRequest {
                name: name.to_string(),
                job_preferences: Vec::new(),
                spectate_only: false,
            })
            .unwrap();
        writer.into_bytes()
    }

    fn auth_reply(bytes: &[u8]) -> AuthResponse {
        let mut reader = PacketReader::new(bytes);
        assert_eq!(reader.read_u8(), Some(ServerPacketHeader::AuthResponse as u8));
        reader.read_body::<AuthResponse>().unwrap()
    }

    #[test]
    fn test_protocol_version_mismatch_is_rejected() {
        let mut session = test_session();
        session.handle_packet(addr(9000), &auth_packet(99), Instant::now());

        let outbox = session.take_outbox();
        assert_eq!(outbox.len(), 1);
        let response = auth_reply(&outbox[0].1);
        assert!(!response.granted);
        assert!(response.reason.unwrap().contains("protocol version"));
    }

    #[test]
    fn test_matching_version_is_granted() {
        let mut session = test_session();
        session.handle_packet(addr(9000), &auth_packet(PROTOCOL_VERSION), Instant::now());
        assert!(auth_reply(&session.take_outbox()[0].1).granted);
    }

    #[test]
    fn test_duplicate_names_get_suffixed() {
        let mut session = test_session();
        let now = Instant::now();
        session.handle_packet(addr(9000), &init_packet("Morgan"), now);
        session.handle_packet(addr(9001), &init_packet("Morgan"), now);

        let names: Vec<String> = session
            .clients
            .ids()
            .into_iter()
            .map(|id| session.clients.get(id).unwrap().name.clone())
            .collect();
        assert!(names.contains(&"Morgan".to_string()));
        assert!(names.contains(&"Morgan-2".to_string()));
    }

    #[test]
    fn test_full_server_turns_joiners_away() {
        let mut session = test_session();
        session.config.max_clients = 1;
        session.clients = ClientManager::new(1);
        let now = Instant::now();

        session.handle_packet(addr(9000), &init_packet("first"), now);
        session.take_outbox();
        session.handle_packet(addr(9001), &init_packet("second"), now);

        assert_eq!(session.clients.len(), 1);
        let outbox = session.take_outbox();
        let (to, bytes) = &outbox[0];
        assert_eq!(*to, addr(9001));
        assert_eq!(bytes[0], ServerPacketHeader::Disconnect as u8);
    }

    #[test]
    fn test_banned_address_gets_silence() {
        let mut session = test_session();
        let banned = addr(9000);
        session.banlist.add(banned.ip(), "Griefer", "sabotage");

        session.handle_packet(banned, &auth_packet(PROTOCOL_VERSION), Instant::now());
        assert!(session.take_outbox().is_empty());
    }
}
