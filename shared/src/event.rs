//! The windowed event log: an append-only, monotonically-ID'd sequence of
//! entity state changes, plus the batch codec both sides use on the wire.
//!
//! Reliability is cumulative-ack, go-back-N: the peer reports a single
//! "last received" cursor and the sender retransmits everything more recent.
//! Batch entries are length-delimited so a receiver can always skip a
//! payload it cannot decode, and a zero entity ID acts as a no-op
//! placeholder that preserves ID continuity for events whose entity no
//! longer exists.

use crate::netid::{id_more_recent, NetId};
use crate::packets::{PacketReader, PacketWriter};
use log::warn;

/// Payload size limit imposed by the one-byte length field.
pub const MAX_EVENT_PAYLOAD: usize = 255;

/// An immutable state-change record.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: NetId,
    /// Target entity; never zero for a stored event.
    pub entity_id: u16,
    /// Opaque kind + data, bincode-encoded by the layer above.
    pub payload: Vec<u8>,
    /// State ID of the originator at creation time (e.g. the character
    /// update the client had seen when it issued the event).
    pub originator_state_id: NetId,
}

/// Append-only log with go-back-N selection.
///
/// IDs start at 1 and are assigned in strict creation order; `clear` resets
/// the ID space for a new round.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<Event>,
    last_id: NetId,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a new event and returns its ID, or None if the payload
    /// exceeds the wire limit or the entity ID is the reserved placeholder.
    pub fn append(
        &mut self,
        entity_id: u16,
        payload: Vec<u8>,
        originator_state_id: NetId,
    ) -> Option<NetId> {
        if entity_id == 0 {
            warn!("Refusing to create an event for the reserved entity ID 0");
            return None;
        }
        if payload.len() > MAX_EVENT_PAYLOAD {
            warn!(
                "Refusing to create a {}-byte event for entity {} (limit {})",
                payload.len(),
                entity_id,
                MAX_EVENT_PAYLOAD
            );
            return None;
        }

        self.last_id = self.last_id.wrapping_add(1);
        // skip the reserved zero ID on wraparound
        if self.last_id == 0 {
            self.last_id = 1;
        }
        self.events.push(Event {
            id: self.last_id,
            entity_id,
            payload,
            originator_state_id,
        });
        Some(self.last_id)
    }

    /// All events more recent than the peer's cumulative cursor, in ID
    /// order. Idempotent; repeated calls with the same cursor return the
    /// same slice.
    pub fn select_unacknowledged(&self, peer_last_recv: NetId) -> &[Event] {
        let mut start = self.events.len();
        while start > 0 {
            let id = self.events[start - 1].id;
            if id != peer_last_recv && id_more_recent(id, peer_last_recv) {
                start -= 1;
            } else {
                break;
            }
        }
        &self.events[start..]
    }

    pub fn last_id(&self) -> NetId {
        self.last_id
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drops events the peer has acknowledged. Used on the client side,
    /// where history is not needed for mid-round sync.
    pub fn prune_acknowledged(&mut self, peer_last_recv: NetId) {
        self.events
            .retain(|e| e.id != peer_last_recv && id_more_recent(e.id, peer_last_recv));
    }

    /// Resets the log and the ID space; the next round starts fresh.
    pub fn clear(&mut self) {
        self.events.clear();
        self.last_id = 0;
    }
}

/// One decoded batch entry.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEntry {
    /// Placeholder for a skipped event; the receiver advances its counter
    /// without reading a payload.
    Skip,
    Payload { entity_id: u16, payload: Vec<u8> },
}

/// Encodes a batch: `{first_id, count, entries}`. Entries with a removed
/// target must be passed as [`BatchEntry::Skip`] by the caller.
pub fn encode_batch(writer: &mut PacketWriter, first_id: NetId, entries: &[BatchEntry]) {
    debug_assert!(entries.len() <= u8::MAX as usize);
    writer.write_u16(first_id);
    writer.write_u8(entries.len() as u8);
    for entry in entries {
        match entry {
            BatchEntry::Skip => writer.write_u16(0),
            BatchEntry::Payload { entity_id, payload } => {
                debug_assert_ne!(*entity_id, 0);
                debug_assert!(payload.len() <= MAX_EVENT_PAYLOAD);
                writer.write_u16(*entity_id);
                writer.write_u8(payload.len() as u8);
                writer.write_bytes(payload);
            }
        }
    }
}

/// Decodes a batch into `(event_id, entry)` pairs, assigning IDs
/// consecutively from the batch header. Returns None on a truncated
/// header; a truncated entry ends the batch early with what was read.
pub fn decode_batch(reader: &mut PacketReader) -> Option<(NetId, Vec<(NetId, BatchEntry)>)> {
    let first_id = reader.read_u16()?;
    let count = reader.read_u8()?;

    let mut entries = Vec::with_capacity(count as usize);
    for i in 0..count {
        let id = first_id.wrapping_add(i as u16);
        let entity_id = match reader.read_u16() {
            Some(entity_id) => entity_id,
            None => {
                warn!("Event batch truncated at entry {} of {}", i, count);
                break;
            }
        };
        if entity_id == 0 {
            entries.push((id, BatchEntry::Skip));
            continue;
        }
        let len = match reader.read_u8() {
            Some(len) => len as usize,
            None => {
                warn!("Event batch truncated in entry {} of {}", i, count);
                break;
            }
        };
        match reader.read_bytes(len) {
            Some(payload) => entries.push((
                id,
                BatchEntry::Payload {
                    entity_id,
                    payload: payload.to_vec(),
                },
            )),
            None => {
                warn!("Event payload truncated in entry {} of {}", i, count);
                break;
            }
        }
    }
    Some((first_id, entries))
}
