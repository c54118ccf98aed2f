//! Client-side entity-event manager.
//!
//! Outbound: client-authored events (interactions, character commands) are
//! queued with their own ID sequence and retransmitted until the server's
//! cumulative acknowledgement covers them. Resends are paced by the
//! measured round-trip time instead of a fixed timer.
//!
//! Inbound: server events are applied in strict ID order; a gap means the
//! rest of the batch waits for the retransmission. An event for an entity
//! the client no longer knows is dropped individually, because spawn
//! events always precede use, so an unknown target can only mean the
//! entity was already despawned.

use crate::game::ClientGameState;
use log::{debug, warn};
use shared::event::{decode_batch, encode_batch, BatchEntry, EventLog};
use shared::netid::{id_more_recent, NetId};
use shared::packets::{NetObject, PacketReader, PacketWriter, MAX_EVENTS_PER_WRITE};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Resend threshold as a multiple of the average round-trip time.
const RESEND_RTT_FACTOR: f32 = 1.5;

#[derive(Debug, Default)]
pub struct ClientEventManager {
    log: EventLog,
    /// When each pending event was last put on the wire.
    event_last_sent: HashMap<NetId, Instant>,
    /// Server's cumulative ack for our events.
    last_acked: NetId,
    /// Our cumulative cursor over the server's event stream.
    pub last_recv_server_event: NetId,
}

impl ClientEventManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an event for the server. Returns its ID.
    pub fn create_event(&mut self, entity_id: u16, payload: Vec<u8>) -> Option<NetId> {
        self.log.append(entity_id, payload, self.last_recv_server_event)
    }

    /// Writes pending events into an update packet.
    ///
    /// Retransmission is go-back-N: once any event is overdue, everything
    /// from that event onward goes out again, capped per packet. Events
    /// sent more recently than `RESEND_RTT_FACTOR` round trips ago are
    /// left alone.
    pub fn write(&mut self, writer: &mut PacketWriter, now: Instant, avg_rtt_ms: f32) {
        let resend_after = Duration::from_millis((avg_rtt_ms * RESEND_RTT_FACTOR) as u64);
        let pending = self.log.select_unacknowledged(self.last_acked);

        let first_due = pending.iter().position(|event| {
            self.event_last_sent
                .get(&event.id)
                .map_or(true, |sent| now.saturating_duration_since(*sent) >= resend_after)
        });
        let Some(start) = first_due else {
            return;
        };
        let batch = &pending[start..(start + MAX_EVENTS_PER_WRITE).min(pending.len())];

        let entries: Vec<BatchEntry> = batch
            .iter()
            .map(|event| BatchEntry::Payload {
                entity_id: event.entity_id,
                payload: event.payload.clone(),
            })
            .collect();
        writer.write_object(NetObject::EntityState);
        encode_batch(writer, batch[0].id, &entries);

        for event in batch {
            self.event_last_sent.insert(event.id, now);
        }
    }

    /// Handles the server's cumulative acknowledgement: acknowledged events
    /// are gone for good, the client keeps no round history.
    pub fn ack(&mut self, server_last_recv: NetId) {
        self.last_acked = server_last_recv;
        self.log.prune_acknowledged(server_last_recv);
        self.event_last_sent
            .retain(|&id, _| id != server_last_recv && id_more_recent(id, server_last_recv));
    }

    /// Reads one server event batch and applies it in order.
    ///
    /// `initial` batches carry the mid-round sync prefix; the jump rule
    /// positions our cursor at the end of the historical range once it has
    /// been fully received (or when there was nothing to receive).
    pub fn read_server_events(
        &mut self,
        initial: bool,
        reader: &mut PacketReader,
        game: &mut ClientGameState,
    ) -> Option<()> {
        if initial {
            let unreceived_count = reader.read_u16()?;
            let first_new_id = reader.read_u16()?;
            if unreceived_count == 0 || self.last_recv_server_event == unreceived_count {
                self.last_recv_server_event = first_new_id.wrapping_sub(1);
            }
        }

        let (_, entries) = decode_batch(reader)?;
        for (id, entry) in entries {
            if id != self.last_recv_server_event.wrapping_add(1) {
                debug!(
                    "Out-of-order server event {} (expecting {}), waiting for resend",
                    id,
                    self.last_recv_server_event.wrapping_add(1)
                );
                continue;
            }
            match entry {
                BatchEntry::Skip => {}
                BatchEntry::Payload { entity_id, payload } => {
                    if !game.apply_event(entity_id, &payload) {
                        // spawn precedes use, so this entity is already gone
                        warn!(
                            "Dropping event {} for unknown entity {}",
                            id, entity_id
                        );
                    }
                }
            }
            self.last_recv_server_event = id;
        }
        Some(())
    }

    pub fn pending_count(&self) -> usize {
        self.log.len()
    }

    /// Resets all cursors for a fresh round.
    pub fn clear(&mut self) {
        self.log.clear();
        self.event_last_sent.clear();
        self.last_acked = 0;
        self.last_recv_server_event = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::packets::{ClientPacketHeader, ServerPacketHeader};

    fn written(manager: &mut ClientEventManager, now: Instant, rtt: f32) -> Vec<u8> {
        let mut writer = PacketWriter::client(ClientPacketHeader::UpdateIngame);
        manager.write(&mut writer, now, rtt);
        writer.into_bytes()
    }

    fn batch_len(bytes: &[u8]) -> usize {
        if bytes.len() <= 1 {
            return 0;
        }
        let mut reader = PacketReader::new(bytes);
        reader.read_u8().unwrap(); // header
        reader.read_u8().unwrap(); // object kind
        let (_, entries) = decode_batch(&mut reader).unwrap();
        entries.len()
    }

    #[test]
    fn test_resend_paced_by_rtt() {
        let mut manager = ClientEventManager::new();
        manager.create_event(5, vec![1]);
        manager.create_event(5, vec![2]);

        let now = Instant::now();
        assert_eq!(batch_len(&written(&mut manager, now, 100.0)), 2);
        // nothing is due again one RTT later
        assert_eq!(
            batch_len(&written(&mut manager, now + Duration::from_millis(100), 100.0)),
            0
        );
        // past 1.5x RTT the whole window goes out again
        assert_eq!(
            batch_len(&written(&mut manager, now + Duration::from_millis(151), 100.0)),
            2
        );
    }

    #[test]
    fn test_new_event_triggers_tail_send() {
        let mut manager = ClientEventManager::new();
        manager.create_event(5, vec![1]);
        let now = Instant::now();
        written(&mut manager, now, 100.0);

        // a newly created event is due immediately; the already-sent one is
        // not, but go-back-N starts at the first due event
        manager.create_event(5, vec![2]);
        let bytes = written(&mut manager, now + Duration::from_millis(10), 100.0);
        let mut reader = PacketReader::new(&bytes);
        reader.read_u8().unwrap();
        reader.read_u8().unwrap();
        let (first_id, entries) = decode_batch(&mut reader).unwrap();
        assert_eq!(first_id, 2);
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_ack_prunes_history() {
        let mut manager = ClientEventManager::new();
        for i in 0..5u8 {
            manager.create_event(5, vec![i]);
        }
        manager.ack(3);
        assert_eq!(manager.pending_count(), 2);

        let bytes = written(&mut manager, Instant::now(), 100.0);
        let mut reader = PacketReader::new(&bytes);
        reader.read_u8().unwrap();
        reader.read_u8().unwrap();
        let (first_id, entries) = decode_batch(&mut reader).unwrap();
        assert_eq!(first_id, 4);
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_server_events_require_continuity() {
        let mut manager = ClientEventManager::new();
        let mut game = ClientGameState::new();

        // batch starting past the expected cursor is ignored entirely
        let mut writer = PacketWriter::server(ServerPacketHeader::IngameUpdate);
        encode_batch(&mut writer, 5, &[BatchEntry::Skip, BatchEntry::Skip]);
        let bytes = writer.into_bytes();
        let mut reader = PacketReader::new(&bytes);
        reader.read_u8().unwrap();
        manager.read_server_events(false, &mut reader, &mut game);
        assert_eq!(manager.last_recv_server_event, 0);

        // a contiguous batch advances the cursor
        let mut writer = PacketWriter::server(ServerPacketHeader::IngameUpdate);
        encode_batch(&mut writer, 1, &[BatchEntry::Skip, BatchEntry::Skip, BatchEntry::Skip]);
        let bytes = writer.into_bytes();
        let mut reader = PacketReader::new(&bytes);
        reader.read_u8().unwrap();
        manager.read_server_events(false, &mut reader, &mut game);
        assert_eq!(manager.last_recv_server_event, 3);

        // duplicates inside an overlapping resend are skipped, the tail is
        // still applied
        let mut writer = PacketWriter::server(ServerPacketHeader::IngameUpdate);
        encode_batch(&mut writer, 2, &[BatchEntry::Skip, BatchEntry::Skip, BatchEntry::Skip]);
        let bytes = writer.into_bytes();
        let mut reader = PacketReader::new(&bytes);
        reader.read_u8().unwrap();
        manager.read_server_events(false, &mut reader, &mut game);
        assert_eq!(manager.last_recv_server_event, 4);
    }

    #[test]
    fn test_initial_jump_rule() {
        let mut manager = ClientEventManager::new();
        let mut game = ClientGameState::new();

        // 40 historical events, first new one will be 41; a fresh client
        // starts reading from 1
        let mut writer = PacketWriter::server(ServerPacketHeader::IngameUpdate);
        writer.write_u16(40);
        writer.write_u16(41);
        encode_batch(&mut writer, 1, &[BatchEntry::Skip, BatchEntry::Skip]);
        let bytes = writer.into_bytes();
        let mut reader = PacketReader::new(&bytes);
        reader.read_u8().unwrap();
        manager.read_server_events(true, &mut reader, &mut game);
        assert_eq!(manager.last_recv_server_event, 2);

        // once the full historical range is in, the cursor jumps to the
        // start of the live stream
        manager.last_recv_server_event = 40;
        let mut writer = PacketWriter::server(ServerPacketHeader::IngameUpdate);
        writer.write_u16(40);
        writer.write_u16(41);
        encode_batch(&mut writer, 41, &[BatchEntry::Skip]);
        let bytes = writer.into_bytes();
        let mut reader = PacketReader::new(&bytes);
        reader.read_u8().unwrap();
        manager.read_server_events(true, &mut reader, &mut game);
        assert_eq!(manager.last_recv_server_event, 41);
    }
}
