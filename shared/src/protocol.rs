//! Serde bodies carried inside the byte-framed packets.

use crate::netid::NetId;
use serde::{Deserialize, Serialize};

/// Body of a `RequestAuth` packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub version: u32,
    pub password: Option<String>,
}

/// Body of an `AuthResponse` packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub granted: bool,
    pub reason: Option<String>,
}

/// Body of a `RequestInit` packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequest {
    pub name: String,
    pub job_preferences: Vec<String>,
    pub spectate_only: bool,
}

/// Body of a `ResponseStartGame` packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartGameResponse {
    pub ready: bool,
}

/// Per-tick acknowledgement cursors sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSync {
    /// Last server event the client has received, cumulative.
    pub last_recv_event_id: NetId,
    /// Last chat message the client has received.
    pub last_recv_chat_id: NetId,
    /// Last lobby update the client has seen.
    pub last_recv_lobby_update: NetId,
    /// Client wall clock, echoed back by the server for RTT estimation.
    pub clock_ms: u64,
}

/// Per-tick cursors sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSync {
    /// Last client-authored event the server has received, cumulative.
    pub last_recv_client_event: NetId,
    /// Last server event queued for this client; lets the client detect
    /// how far behind it is.
    pub last_sent_event_id: NetId,
    /// Echo of the most recent `ClientSync::clock_ms`.
    pub echo_clock_ms: u64,
}

/// Snapshot of the lobby, sent whenever a client's lobby cursor is stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbySnapshot {
    pub update_id: NetId,
    pub server_name: String,
    pub server_message: String,
    pub game_started: bool,
    pub allow_spectating: bool,
    pub selected_sub: String,
    pub selected_shuttle: String,
    pub selected_mode: String,
    pub level_seed: u32,
    pub auto_restart_timer: Option<f32>,
    pub players: Vec<LobbyPlayer>,
    /// Present only on the first (initial) update for a client.
    pub initial: Option<InitialLobbyData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyPlayer {
    pub id: u8,
    pub name: String,
    /// Zero when the player has no spawned character.
    pub character_id: u16,
}

/// One-time data bundled with a client's first lobby snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialLobbyData {
    pub your_id: u8,
    pub your_permissions: u16,
    pub sub_list: Vec<String>,
    pub mode_list: Vec<String>,
}

/// Body of a `StartGame` packet: the query-start handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartGameNotice {
    pub seed: u32,
    pub sub: String,
    pub shuttle: String,
    pub mode: String,
    pub respawn_allowed: bool,
    pub two_teams: bool,
}

/// Body of an `EndGame` packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundEndNotice {
    pub summary: String,
}

/// Position delta for a single entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub entity_id: u16,
    pub x: f32,
    pub y: f32,
}

/// Chat text as submitted by a client; classification happens server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatText {
    pub text: String,
}

/// A single vote cast by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum VoteBody {
    Sub(String),
    Mode(String),
    EndRound(bool),
    Kick(u8),
}

/// Vote tallies broadcast to clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoteStatusBody {
    pub end_count: u8,
    pub end_max: u8,
    pub kick_counts: Vec<(u8, u8)>,
}

/// Permission-gated remote commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerCommandBody {
    Kick { target: String, reason: String },
    Ban { target: String, reason: String },
    EndRound,
    SelectSub { name: String },
    SelectMode { name: String },
    ManageCampaign { action: String },
}

/// Content of an entity event, carried opaquely by the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// Server notifies clients of a new entity.
    Spawn { kind: u8, x: f32, y: f32, owner: u8 },
    /// Server notifies clients of a removed entity.
    Despawn,
    /// Generic entity state blob (device settings, health, inventory...).
    State { data: Vec<u8> },
    /// Client interacts with an item.
    Interact { item_id: u16 },
    /// Client-issued UI command targeting its own character.
    Command { action: u8 },
}

/// Body of a `Disconnect` packet, either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectNotice {
    pub reason: String,
}

/// Body of a `FileRequest` packet; the transfer itself is handled by an
/// external collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRequestBody {
    pub file_name: String,
}
