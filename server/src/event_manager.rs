//! Server-side entity-event manager: the authoritative log plus per-client
//! delivery bookkeeping.
//!
//! Delivery is go-back-N: each client reports a single cumulative
//! last-received ID and everything more recent is retransmitted, capped per
//! packet. Events whose target entity has been removed since creation are
//! written as zero-entity placeholders so ID continuity is preserved.
//!
//! A client that joins after round start has an event history gap; it is
//! switched into mid-round sync and walked through the historical batch
//! (tagged `EntityEventInitial`) before normal replication resumes.
//! Position updates are withheld while the flag is set, since the client
//! has not yet been told the entities exist.

use crate::client::RemoteClient;
use crate::world::World;
use log::{debug, warn};
use shared::event::{encode_batch, BatchEntry, EventLog};
use shared::netid::{id_more_recent, NetId};
use shared::packets::{NetObject, PacketWriter, MAX_EVENTS_PER_WRITE, MTU, MTU_SAFETY_MARGIN};

/// Worst-case framing around a batch: object byte, the two mid-round sync
/// fields, first ID and count.
const BATCH_OVERHEAD: usize = 8;

#[derive(Debug, Default)]
pub struct ServerEventManager {
    log: EventLog,
}

impl ServerEventManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event for an entity. Side effect only, no network I/O.
    ///
    /// Removed or event-incapable entities are filtered here, at creation,
    /// so stale references never accumulate in the log.
    pub fn create_event(&mut self, world: &World, entity_id: u16, payload: Vec<u8>) -> Option<NetId> {
        match world.get(entity_id) {
            Some(entity) if !entity.removed && entity.event_capable => {
                self.log.append(entity_id, payload, 0)
            }
            Some(entity) if !entity.event_capable => {
                warn!(
                    "Dropping event for entity {}: not event-capable",
                    entity_id
                );
                None
            }
            _ => {
                debug!("Dropping event for missing/removed entity {}", entity_id);
                None
            }
        }
    }

    /// Writes the unacknowledged batch for one client into an in-game
    /// packet, updating resend bookkeeping.
    pub fn write(&self, client: &mut RemoteClient, world: &World, writer: &mut PacketWriter) {
        let pending = self.log.select_unacknowledged(client.last_recv_event_id);
        if pending.is_empty() {
            return;
        }

        // the batch is bounded by count and by the bytes left in the
        // packet; a lone oversized event still goes out so the stream
        // cannot stall
        let budget = (MTU - MTU_SAFETY_MARGIN).saturating_sub(writer.len() + BATCH_OVERHEAD);
        let mut used = 0usize;
        let mut take = 0usize;
        for event in pending.iter().take(MAX_EVENTS_PER_WRITE) {
            let cost = if world.is_active(event.entity_id) {
                3 + event.payload.len()
            } else {
                2
            };
            if take > 0 && used + cost > budget {
                break;
            }
            used += cost;
            take += 1;
        }
        let batch = &pending[..take];

        let entries: Vec<BatchEntry> = batch
            .iter()
            .map(|event| {
                if world.is_active(event.entity_id) {
                    BatchEntry::Payload {
                        entity_id: event.entity_id,
                        payload: event.payload.clone(),
                    }
                } else {
                    // entity gone since the event was created; keep the ID
                    // slot so the client's counter still advances
                    BatchEntry::Skip
                }
            })
            .collect();

        if client.needs_mid_round_sync {
            writer.write_object(NetObject::EntityEventInitial);
            writer.write_u16(client.unreceived_event_count);
            writer.write_u16(client.first_new_event_id);
        } else {
            writer.write_object(NetObject::EntityState);
        }
        encode_batch(writer, batch[0].id, &entries);

        client.last_sent_event_id = batch[batch.len() - 1].id;
    }

    /// Advances a client's cumulative acknowledgement cursor. The cursor
    /// never moves backward, so stale or duplicate reports are no-ops.
    pub fn read_acks(&self, client: &mut RemoteClient, reported: NetId) {
        if reported != client.last_recv_event_id
            && id_more_recent(reported, client.last_recv_event_id)
        {
            client.last_recv_event_id = reported;
        }
        self.update_mid_round_sync(client);
    }

    /// Flags a late joiner for history backfill.
    pub fn begin_mid_round_sync(&self, client: &mut RemoteClient) {
        if self.log.is_empty() {
            return;
        }
        client.needs_mid_round_sync = true;
        client.unreceived_event_count = self.log.last_id();
        client.first_new_event_id = self.log.last_id().wrapping_add(1);
        debug!(
            "Client {} needs mid-round sync: {} historical events, first new ID {}",
            client.id, client.unreceived_event_count, client.first_new_event_id
        );
    }

    /// Clears the mid-round flag once the client's cursor has reached the
    /// end of the historical batch.
    fn update_mid_round_sync(&self, client: &mut RemoteClient) {
        if !client.needs_mid_round_sync {
            return;
        }
        let sync_target = client.first_new_event_id.wrapping_sub(1);
        if client.last_recv_event_id == sync_target
            || id_more_recent(client.last_recv_event_id, sync_target)
        {
            client.needs_mid_round_sync = false;
            debug!("Client {} finished mid-round sync", client.id);
        }
    }

    pub fn last_event_id(&self) -> NetId {
        self.log.last_id()
    }

    pub fn event_count(&self) -> usize {
        self.log.len()
    }

    /// Clears the event history; the next round starts a fresh ID space.
    pub fn clear(&mut self) {
        self.log.clear();
    }
}
