//! Wire vocabulary shared by the server and client crates: wrap-aware
//! sequence IDs, the windowed entity-event log and its batch codec, packet
//! framing, protocol bodies and the chat message model.

pub mod chat;
pub mod event;
pub mod netid;
pub mod packets;
pub mod protocol;

pub use netid::{id_diff, id_more_recent, NetId};
