//! Client connection management for the multiplayer server.
//!
//! Each connected client carries the acknowledgement cursors, flags, queues
//! and timers that drive replication: what it has seen of the event log and
//! chat stream, whether it is in the round or still mid-round syncing, and
//! which votes it has cast. The manager enforces capacity, hands out stable
//! small IDs and sweeps out clients that stop sending packets.

use crate::permissions::ClientPermissions;
use crate::world::EntityId;
use log::info;
use shared::chat::ChatMessage;
use shared::NetId;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Clients that send nothing for this long are dropped.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Votes cast by a single client.
#[derive(Debug, Default, Clone)]
pub struct ClientVotes {
    pub sub: Option<String>,
    pub mode: Option<String>,
    pub end_round: bool,
    pub kick: HashSet<u8>,
}

/// A connected client and its replication bookkeeping.
#[derive(Debug)]
pub struct RemoteClient {
    pub id: u8,
    pub addr: SocketAddr,
    pub name: String,
    pub permissions: ClientPermissions,
    pub last_seen: Instant,

    // acknowledgement cursors
    /// Last server event written to this client (resend pacing).
    pub last_sent_event_id: NetId,
    /// Last server event the client reports having received, cumulative.
    pub last_recv_event_id: NetId,
    /// Last client-authored event the server has accepted.
    pub last_client_event_recv: NetId,
    /// Last chat message queued for this client.
    pub last_sent_chat_id: NetId,
    /// Last chat message the client reports having received.
    pub last_recv_chat_id: NetId,
    /// Last lobby update the client reports having seen.
    pub last_recv_lobby_update: NetId,
    /// Clock value from the client's latest sync record, echoed back for
    /// RTT measurement.
    pub last_clock_ms: u64,

    // flags
    pub in_game: bool,
    pub needs_mid_round_sync: bool,
    pub spectate_only: bool,
    pub ready_to_start: bool,
    /// Set when the client connected while a round was already running.
    pub joined_mid_round: bool,

    // mid-round sync bookkeeping
    pub unreceived_event_count: u16,
    pub first_new_event_id: NetId,

    // queues
    pub pending_position_updates: VecDeque<EntityId>,
    pub chat_queue: Vec<ChatMessage>,

    // timers
    pub chat_spam_timer: f32,

    pub character: Option<EntityId>,
    pub team: u8,
    pub job_preferences: Vec<String>,
    pub votes: ClientVotes,
}

impl RemoteClient {
    pub fn new(id: u8, addr: SocketAddr, name: String) -> Self {
        Self {
            id,
            addr,
            name,
            permissions: ClientPermissions::NONE,
            last_seen: Instant::now(),
            last_sent_event_id: 0,
            last_recv_event_id: 0,
            last_client_event_recv: 0,
            last_sent_chat_id: 0,
            last_recv_chat_id: 0,
            last_recv_lobby_update: 0,
            last_clock_ms: 0,
            in_game: false,
            needs_mid_round_sync: false,
            spectate_only: false,
            ready_to_start: false,
            joined_mid_round: false,
            unreceived_event_count: 0,
            first_new_event_id: 0,
            pending_position_updates: VecDeque::new(),
            chat_queue: Vec::new(),
            chat_spam_timer: 0.0,
            character: None,
            team: 1,
            job_preferences: Vec::new(),
            votes: ClientVotes::default(),
        }
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) > CLIENT_TIMEOUT
    }

    pub fn has_permission(&self, permission: ClientPermissions) -> bool {
        self.permissions.contains(permission)
    }

    /// Resets round-scoped state; cursors restart with the fresh event ID
    /// space of the next round.
    pub fn reset_round_state(&mut self) {
        self.last_sent_event_id = 0;
        self.last_recv_event_id = 0;
        self.last_client_event_recv = 0;
        self.in_game = false;
        self.needs_mid_round_sync = false;
        self.ready_to_start = false;
        self.joined_mid_round = false;
        self.unreceived_event_count = 0;
        self.first_new_event_id = 0;
        self.pending_position_updates.clear();
        self.character = None;
        self.votes.end_round = false;
    }
}

/// A client that dropped mid-round; its character is kept alive for the
/// duration of the reconnect grace timer.
#[derive(Debug)]
pub struct DisconnectedClient {
    pub name: String,
    pub character: Option<EntityId>,
    pub grace_timer: f32,
}

/// Roster of connected clients, indexed by their stable small ID.
#[derive(Debug)]
pub struct ClientManager {
    clients: HashMap<u8, RemoteClient>,
    next_client_id: u8,
    max_clients: usize,
    pub disconnected: Vec<DisconnectedClient>,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 0,
            max_clients,
            disconnected: Vec::new(),
        }
    }

    fn next_id(&mut self) -> u8 {
        // IDs wrap but zero stays reserved and live IDs are never reused
        loop {
            self.next_client_id = self.next_client_id.wrapping_add(1);
            if self.next_client_id != 0 && !self.clients.contains_key(&self.next_client_id) {
                return self.next_client_id;
            }
        }
    }

    /// Adds a client, returning None when the server is full.
    pub fn add_client(&mut self, addr: SocketAddr, name: String) -> Option<u8> {
        if self.clients.len() >= self.max_clients {
            return None;
        }
        let id = self.next_id();
        info!("Client {} ({}) connected from {}", id, name, addr);
        self.clients.insert(id, RemoteClient::new(id, addr, name));
        Some(id)
    }

    pub fn remove_client(&mut self, id: u8) -> Option<RemoteClient> {
        let removed = self.clients.remove(&id);
        if let Some(client) = &removed {
            info!("Client {} ({}) disconnected", client.id, client.name);
        }
        removed
    }

    pub fn get(&self, id: u8) -> Option<&RemoteClient> {
        self.clients.get(&id)
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut RemoteClient> {
        self.clients.get_mut(&id)
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<u8> {
        self.clients
            .iter()
            .find(|(_, c)| c.addr == addr)
            .map(|(id, _)| *id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<u8> {
        let lowered = name.to_lowercase();
        self.clients
            .iter()
            .find(|(_, c)| c.name.to_lowercase() == lowered)
            .map(|(id, _)| *id)
    }

    /// Removes and returns clients that have stopped sending packets.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<RemoteClient> {
        let timed_out: Vec<u8> = self
            .clients
            .iter()
            .filter(|(_, c)| c.is_timed_out(now))
            .map(|(id, _)| *id)
            .collect();

        timed_out
            .into_iter()
            .filter_map(|id| self.remove_client(id))
            .collect()
    }

    pub fn ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.clients.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteClient> {
        self.clients.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RemoteClient> {
        self.clients.values_mut()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_add_and_remove_client() {
        let mut manager = ClientManager::new(4);
        let id = manager.add_client(test_addr(9000), "Morgan".to_string()).unwrap();
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.get(id).unwrap().name, "Morgan");

        let removed = manager.remove_client(id).unwrap();
        assert_eq!(removed.id, id);
        assert!(manager.is_empty());
        assert!(manager.remove_client(id).is_none());
    }

    #[test]
    fn test_capacity_limit() {
        let mut manager = ClientManager::new(1);
        assert!(manager.add_client(test_addr(9000), "a".to_string()).is_some());
        assert!(manager.add_client(test_addr(9001), "b".to_string()).is_none());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_ids_are_unique_and_nonzero() {
        let mut manager = ClientManager::new(8);
        let a = manager.add_client(test_addr(9000), "a".to_string()).unwrap();
        let b = manager.add_client(test_addr(9001), "b".to_string()).unwrap();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_find_by_addr_and_name() {
        let mut manager = ClientManager::new(4);
        let addr = test_addr(9000);
        let id = manager.add_client(addr, "Morgan".to_string()).unwrap();

        assert_eq!(manager.find_by_addr(addr), Some(id));
        assert_eq!(manager.find_by_addr(test_addr(9999)), None);
        assert_eq!(manager.find_by_name("morgan"), Some(id));
        assert_eq!(manager.find_by_name("nobody"), None);
    }

    #[test]
    fn test_timeout_sweep() {
        let mut manager = ClientManager::new(4);
        let id = manager.add_client(test_addr(9000), "a".to_string()).unwrap();
        manager.add_client(test_addr(9001), "b".to_string()).unwrap();

        manager.get_mut(id).unwrap().last_seen = Instant::now() - CLIENT_TIMEOUT * 2;
        let removed = manager.check_timeouts(Instant::now());
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, id);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_reset_round_state() {
        let mut client = RemoteClient::new(1, test_addr(9000), "a".to_string());
        client.last_recv_event_id = 99;
        client.in_game = true;
        client.needs_mid_round_sync = true;
        client.character = Some(5);
        client.votes.end_round = true;
        client.pending_position_updates.push_back(5);

        client.reset_round_state();
        assert_eq!(client.last_recv_event_id, 0);
        assert!(!client.in_game);
        assert!(!client.needs_mid_round_sync);
        assert!(client.character.is_none());
        assert!(!client.votes.end_round);
        assert!(client.pending_position_updates.is_empty());
    }
}
