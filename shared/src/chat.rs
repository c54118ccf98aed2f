//! Chat message model: classification from a leading command token and the
//! distance attenuation applied to spoken/radio messages.

use crate::netid::NetId;
use serde::{Deserialize, Serialize};

/// How far normal speech carries, in world units.
pub const SPEAK_RANGE: f32 = 300.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatMessageType {
    Default,
    Radio,
    Dead,
    Private,
    Server,
    /// Local feedback line ("player not found"), only ever sent back to
    /// the sender.
    Error,
}

/// A chat message as delivered to one recipient. `net_state_id` is assigned
/// per recipient queue, so the same logical message can carry different IDs
/// (and different text, after distance effects) for different clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub net_state_id: NetId,
    pub sender: String,
    pub text: String,
    pub kind: ChatMessageType,
}

/// Splits a leading `command;` token off a chat line.
///
/// `r;`/`radio;` and `d;`/`dead;` select a message type; any other
/// non-empty token is a player name for a private message. Returns the
/// lowercased command (empty if none) and the remaining text.
pub fn parse_chat_command(text: &str) -> (String, &str) {
    match text.find(';') {
        Some(idx) if idx > 0 => {
            let command = text[..idx].trim().to_lowercase();
            let rest = text[idx + 1..].trim_start();
            if command.is_empty() {
                (String::new(), text)
            } else {
                (command, rest)
            }
        }
        _ => (String::new(), text),
    }
}

/// Attenuates a spoken message by distance.
///
/// Returns None when the receiver is out of range. Within the inner half of
/// the range the message is intact; past that, characters are progressively
/// garbled. The garble is deterministic for a given message and distance so
/// both a test and a retransmission see the same text.
pub fn apply_distance_effect(message: &str, distance: f32, range: f32) -> Option<String> {
    if range <= 0.0 || distance > range {
        return None;
    }
    let garble_start = range * 0.5;
    if distance <= garble_start {
        return Some(message.to_string());
    }

    let ratio = (distance - garble_start) / (range - garble_start);
    let mut seed: u32 = 0x9e37_79b9;
    for byte in message.bytes() {
        seed = seed.wrapping_mul(31).wrapping_add(byte as u32);
    }

    let garbled = message
        .chars()
        .enumerate()
        .map(|(i, ch)| {
            if ch.is_whitespace() {
                return ch;
            }
            // cheap deterministic hash per character position
            let mut h = seed ^ (i as u32).wrapping_mul(0x85eb_ca6b);
            h ^= h >> 13;
            h = h.wrapping_mul(0xc2b2_ae35);
            h ^= h >> 16;
            if (h % 1000) as f32 / 1000.0 < ratio {
                '.'
            } else {
                ch
            }
        })
        .collect();
    Some(garbled)
}
