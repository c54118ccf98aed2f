//! Client-side mirror of the replicated state: entities, chat log and the
//! lobby snapshot.
//!
//! Nothing here is authoritative. The mirror only ever changes in response
//! to server records, and the accessors exist so a frontend can render it.

use log::{debug, info};
use shared::chat::ChatMessage;
use shared::netid::{id_more_recent, NetId};
use shared::protocol::{EventPayload, LobbySnapshot, PositionUpdate, StartGameNotice};

/// One replicated entity as the client knows it.
#[derive(Debug, Clone)]
pub struct ClientEntity {
    pub id: u16,
    pub kind: u8,
    pub x: f32,
    pub y: f32,
    pub alive: bool,
    /// Owning client ID for characters, zero otherwise.
    pub owner: u8,
    /// Most recent opaque state blob from the server.
    pub last_state: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct ClientGameState {
    entities: std::collections::HashMap<u16, ClientEntity>,
    pub chat_log: Vec<ChatMessage>,
    pub last_recv_chat_id: NetId,
    pub lobby: Option<LobbySnapshot>,
    pub last_recv_lobby_update: NetId,
    pub my_id: u8,
    pub my_permissions: u16,
    pub my_character: Option<u16>,
    pub round_running: bool,
    pub round_summary: Option<String>,
}

impl ClientGameState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one server entity event. Returns false when the target is
    /// unknown, which the caller treats as a single dropped event.
    pub fn apply_event(&mut self, entity_id: u16, payload: &[u8]) -> bool {
        let Ok(event) = bincode::deserialize::<EventPayload>(payload) else {
            debug!("Undecodable event payload for entity {}", entity_id);
            // the event is consumed either way; the stream must advance
            return true;
        };
        match event {
            EventPayload::Spawn { kind, x, y, owner } => {
                self.entities.insert(
                    entity_id,
                    ClientEntity {
                        id: entity_id,
                        kind,
                        x,
                        y,
                        alive: true,
                        owner,
                        last_state: Vec::new(),
                    },
                );
                if owner == self.my_id && self.my_id != 0 {
                    self.my_character = Some(entity_id);
                }
                true
            }
            EventPayload::Despawn => {
                if self.my_character == Some(entity_id) {
                    self.my_character = None;
                }
                self.entities.remove(&entity_id).is_some()
            }
            EventPayload::State { data } => match self.entities.get_mut(&entity_id) {
                Some(entity) => {
                    // a lone zero byte is the death notice
                    if data.as_slice() == [0] {
                        entity.alive = false;
                    }
                    entity.last_state = data;
                    true
                }
                None => false,
            },
            EventPayload::Interact { .. } | EventPayload::Command { .. } => {
                debug!("Server sent a client-only event kind for entity {}", entity_id);
                true
            }
        }
    }

    /// Position records are unordered and unreliable; anything for an
    /// unknown entity is simply dropped.
    pub fn apply_position(&mut self, update: &PositionUpdate) {
        if let Some(entity) = self.entities.get_mut(&update.entity_id) {
            entity.x = update.x;
            entity.y = update.y;
        }
    }

    /// Appends a chat message if it is new, advancing the ack cursor.
    pub fn add_chat(&mut self, message: ChatMessage) {
        if message.net_state_id != self.last_recv_chat_id
            && id_more_recent(message.net_state_id, self.last_recv_chat_id)
        {
            self.last_recv_chat_id = message.net_state_id;
            self.chat_log.push(message);
        }
    }

    /// Replaces the lobby snapshot if the server's version is newer.
    pub fn apply_lobby(&mut self, snapshot: LobbySnapshot) {
        if snapshot.update_id == self.last_recv_lobby_update
            || !id_more_recent(snapshot.update_id, self.last_recv_lobby_update)
        {
            return;
        }
        self.last_recv_lobby_update = snapshot.update_id;
        if let Some(initial) = &snapshot.initial {
            self.my_id = initial.your_id;
            self.my_permissions = initial.your_permissions;
            info!("Joined as client {} ({:#x} permissions)", self.my_id, self.my_permissions);
        }
        self.lobby = Some(snapshot);
    }

    pub fn on_round_start(&mut self, notice: &StartGameNotice) {
        info!(
            "Round starting: sub {}, mode {}, seed {}",
            notice.sub, notice.mode, notice.seed
        );
        self.entities.clear();
        self.my_character = None;
        self.round_summary = None;
        self.round_running = true;
    }

    pub fn on_round_end(&mut self, summary: String) {
        info!("Round over");
        self.entities.clear();
        self.my_character = None;
        self.round_running = false;
        self.round_summary = Some(summary);
    }

    pub fn entity(&self, id: u16) -> Option<&ClientEntity> {
        self.entities.get(&id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }
}
