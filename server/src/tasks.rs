//! Resumable multi-tick tasks driven from the update loop.
//!
//! Anything that spans ticks (waiting for clients to acknowledge a round
//! start, end-of-round delays) is modeled as a small struct polled once per
//! tick instead of a blocking wait, so one slow client can never stall the
//! loop.

use log::warn;
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Outcome of polling a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState<T> {
    Pending,
    TimedOut,
    Completed(T),
}

/// Waits for every queried client to confirm it is ready for round start.
///
/// Clients that disconnect mid-handshake must be cleared by the caller via
/// [`StartHandshake::forget`]; a client that neither answers nor leaves
/// runs the task into its deadline.
#[derive(Debug)]
pub struct StartHandshake {
    deadline: Instant,
    pending: HashSet<u8>,
}

impl StartHandshake {
    pub fn new(clients: impl IntoIterator<Item = u8>, now: Instant, timeout: Duration) -> Self {
        Self {
            deadline: now + timeout,
            pending: clients.into_iter().collect(),
        }
    }

    pub fn mark_ready(&mut self, client_id: u8) {
        self.pending.remove(&client_id);
    }

    /// Adds a late joiner to the set of awaited confirmations.
    pub fn enroll(&mut self, client_id: u8) {
        self.pending.insert(client_id);
    }

    pub fn forget(&mut self, client_id: u8) {
        self.pending.remove(&client_id);
    }

    pub fn poll(&self, now: Instant) -> TaskState<()> {
        if self.pending.is_empty() {
            TaskState::Completed(())
        } else if now >= self.deadline {
            warn!(
                "Round start handshake timed out with {} clients unconfirmed",
                self.pending.len()
            );
            TaskState::TimedOut
        } else {
            TaskState::Pending
        }
    }
}

/// A plain dt-driven delay.
#[derive(Debug, Clone, Copy)]
pub struct Countdown {
    remaining: f32,
}

impl Countdown {
    pub fn new(seconds: f32) -> Self {
        Self { remaining: seconds }
    }

    /// Advances the countdown; true once it has elapsed.
    pub fn tick(&mut self, dt: f32) -> bool {
        self.remaining -= dt;
        self.remaining <= 0.0
    }

    pub fn remaining(&self) -> f32 {
        self.remaining.max(0.0)
    }
}

/// Public-listing registration. The real implementation talks to a master
/// list over HTTP; the null one is used for private servers and tests.
pub trait Directory {
    fn register(&mut self, server_name: &str, port: u16);
    fn refresh(&mut self, player_count: usize, game_started: bool);
    fn unregister(&mut self);
}

#[derive(Debug, Default)]
pub struct NullDirectory;

impl Directory for NullDirectory {
    fn register(&mut self, _server_name: &str, _port: u16) {}
    fn refresh(&mut self, _player_count: usize, _game_started: bool) {}
    fn unregister(&mut self) {}
}
