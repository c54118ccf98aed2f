//! Authoritative multiplayer server.
//!
//! The server owns the canonical round state: which clients are connected,
//! the entities in the world, the ordered entity-event log and the chat,
//! vote and permission machinery around them. Clients send inputs and
//! acknowledgements; the server decides everything and replicates the
//! results.
//!
//! ## Architecture
//!
//! All state lives in a single [`session::Session`] with no socket
//! attached. The [`network::Server`] wraps it with a UDP socket and a tick
//! loop: drain inbound datagrams, run upkeep, write one update packet per
//! client, flush. Processing everything on one task keeps the protocol
//! deterministic and makes the whole server testable with hand-built
//! packets.
//!
//! ## Reliability
//!
//! Entity events use cumulative acknowledgement with go-back-N resend (see
//! [`event_manager`]); chat and lobby state ride their own ack cursors.
//! Packets are bounded by the shared MTU budget, and anything that does not
//! fit waits for the next tick.

pub mod banlist;
pub mod chat;
pub mod client;
pub mod event_manager;
pub mod jobs;
pub mod lifecycle;
pub mod network;
pub mod permissions;
pub mod session;
pub mod tasks;
pub mod votes;
pub mod world;
