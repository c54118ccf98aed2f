//! Game client.
//!
//! The client mirrors whatever the server replicates: the lobby, the chat
//! log and the in-round entity set. Its own authority is limited to the
//! events it authors (interactions and character commands), which are
//! retransmitted until the server acknowledges them.
//!
//! [`network::Client`] holds the connection state machine,
//! [`event_manager::ClientEventManager`] the reliable event channel and
//! [`game::ClientGameState`] the replicated mirror.

pub mod event_manager;
pub mod game;
pub mod network;
