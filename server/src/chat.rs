//! Server-side chat: classifies submitted lines, picks recipients and
//! applies per-recipient distance attenuation before queueing.
//!
//! Delivery itself rides the per-client chat queues written by the update
//! path; a message only leaves the queue once the recipient acknowledges
//! its ID.

use crate::lifecycle::RoundState;
use crate::session::Session;
use shared::chat::{
    apply_distance_effect, parse_chat_command, ChatMessage, ChatMessageType, SPEAK_RANGE,
};

/// Each message adds this much to the sender's spam accumulator, which
/// drains at one unit per second.
const CHAT_SPAM_COST: f32 = 1.0;
/// Accumulator level above which messages are rejected.
const CHAT_SPAM_THRESHOLD: f32 = 5.0;

/// Oldest unacknowledged messages are dropped past this queue depth.
const MAX_CHAT_QUEUE: usize = 60;

enum Audience {
    Everyone,
    DeadOnly,
    Spoken(f32),
    Private(u8),
}

impl Session {
    /// Handles a chat line submitted by a client: spam check, command
    /// parsing, recipient selection and queueing.
    pub fn send_chat(&mut self, sender_id: u8, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        let (sender_name, spam_blocked) = {
            let Some(sender) = self.clients.get_mut(sender_id) else {
                return;
            };
            sender.chat_spam_timer += CHAT_SPAM_COST;
            (
                sender.name.clone(),
                sender.chat_spam_timer > CHAT_SPAM_THRESHOLD,
            )
        };
        if spam_blocked {
            self.chat_error(sender_id, "You are sending messages too fast.");
            return;
        }

        let (command, body) = parse_chat_command(text);
        let body = body.trim();
        if body.is_empty() {
            return;
        }

        let in_round = self.lifecycle.state == RoundState::InRound;
        let sender_entity = self
            .clients
            .get(sender_id)
            .and_then(|c| c.character)
            .and_then(|id| self.world.get(id));
        let sender_alive = sender_entity.map_or(false, |e| e.is_alive_character());
        let sender_pos = sender_entity.map(|e| (e.x, e.y));
        let radio_range = sender_entity
            .and_then(|e| e.character.as_ref())
            .and_then(|c| c.radio_range);

        let (mut kind, mut audience) = match command.as_str() {
            "" => {
                if in_round {
                    (ChatMessageType::Default, Audience::Spoken(SPEAK_RANGE))
                } else {
                    (ChatMessageType::Default, Audience::Everyone)
                }
            }
            "r" | "radio" => match (in_round, radio_range) {
                (true, Some(range)) if sender_alive => {
                    (ChatMessageType::Radio, Audience::Spoken(range))
                }
                // no working radio degrades to plain speech
                (true, _) => (ChatMessageType::Default, Audience::Spoken(SPEAK_RANGE)),
                (false, _) => (ChatMessageType::Default, Audience::Everyone),
            },
            "d" | "dead" => {
                if in_round {
                    (ChatMessageType::Dead, Audience::DeadOnly)
                } else {
                    (ChatMessageType::Default, Audience::Everyone)
                }
            }
            target_name => {
                let Some(target_id) = self.clients.find_by_name(target_name) else {
                    self.chat_error(sender_id, &format!("Player '{}' not found.", target_name));
                    return;
                };
                if in_round && sender_alive {
                    self.chat_error(
                        sender_id,
                        "Private messages are unavailable while your character is alive.",
                    );
                    return;
                }
                (ChatMessageType::Private, Audience::Private(target_id))
            }
        };
        // living players can't hear the dead
        if in_round && !sender_alive && !matches!(audience, Audience::Private(_)) {
            kind = ChatMessageType::Dead;
            audience = Audience::DeadOnly;
        }

        let mut deliveries: Vec<(u8, String)> = Vec::new();
        match audience {
            Audience::Everyone => {
                for id in self.clients.ids() {
                    deliveries.push((id, body.to_string()));
                }
            }
            Audience::DeadOnly => {
                for id in self.clients.ids() {
                    if id == sender_id || !self.client_is_alive(id) {
                        deliveries.push((id, body.to_string()));
                    }
                }
            }
            Audience::Private(target_id) => {
                deliveries.push((target_id, body.to_string()));
                if target_id != sender_id {
                    deliveries.push((sender_id, body.to_string()));
                }
            }
            Audience::Spoken(range) => {
                let Some((sx, sy)) = sender_pos else {
                    return;
                };
                for id in self.clients.ids() {
                    if id == sender_id {
                        deliveries.push((id, body.to_string()));
                        continue;
                    }
                    let listener = self
                        .clients
                        .get(id)
                        .and_then(|c| c.character)
                        .and_then(|cid| self.world.get(cid))
                        .filter(|e| e.is_alive_character());
                    match listener {
                        // dead players and spectators overhear everything
                        None => deliveries.push((id, body.to_string())),
                        Some(entity) => {
                            let dx = entity.x - sx;
                            let dy = entity.y - sy;
                            let distance = (dx * dx + dy * dy).sqrt();
                            // radio is transmitter-to-transmitter; a listener
                            // without one only catches the spoken words
                            let heard = if kind == ChatMessageType::Radio {
                                let listener_radio =
                                    entity.character.as_ref().and_then(|c| c.radio_range);
                                if listener_radio.is_some() && distance <= range {
                                    Some(body.to_string())
                                } else {
                                    apply_distance_effect(body, distance, SPEAK_RANGE)
                                }
                            } else {
                                apply_distance_effect(body, distance, range)
                            };
                            if let Some(heard) = heard {
                                deliveries.push((id, heard));
                            }
                        }
                    }
                }
            }
        }

        for (recipient_id, heard) in deliveries {
            self.queue_chat_message(recipient_id, &sender_name, &heard, kind);
        }
        let preview = ChatMessage {
            net_state_id: 0,
            sender: sender_name,
            text: body.to_string(),
            kind,
        };
        if let Some(presenter) = self.presenter.as_mut() {
            presenter.chat_message(&preview);
        }
    }

    fn client_is_alive(&self, client_id: u8) -> bool {
        self.clients
            .get(client_id)
            .and_then(|c| c.character)
            .and_then(|id| self.world.get(id))
            .map_or(false, |e| e.is_alive_character())
    }

    /// Appends a message to one client's queue, assigning the next ID in
    /// that queue's sequence.
    pub(crate) fn queue_chat_message(
        &mut self,
        recipient_id: u8,
        sender: &str,
        text: &str,
        kind: ChatMessageType,
    ) {
        let Some(client) = self.clients.get_mut(recipient_id) else {
            return;
        };
        let mut id = client
            .chat_queue
            .last()
            .map(|m| m.net_state_id)
            .unwrap_or(client.last_recv_chat_id)
            .wrapping_add(1);
        if id == 0 {
            id = 1;
        }
        client.chat_queue.push(ChatMessage {
            net_state_id: id,
            sender: sender.to_string(),
            text: text.to_string(),
            kind,
        });
        if client.chat_queue.len() > MAX_CHAT_QUEUE {
            let excess = client.chat_queue.len() - MAX_CHAT_QUEUE;
            client.chat_queue.drain(..excess);
        }
    }

    /// Broadcast server announcement.
    pub(crate) fn server_chat(&mut self, text: String) {
        for id in self.clients.ids() {
            self.queue_chat_message(id, "Server", &text, ChatMessageType::Server);
        }
        let message = ChatMessage {
            net_state_id: 0,
            sender: "Server".to_string(),
            text,
            kind: ChatMessageType::Server,
        };
        if let Some(presenter) = self.presenter.as_mut() {
            presenter.chat_message(&message);
        }
    }

    /// Feedback line delivered only to the affected client.
    pub(crate) fn chat_error(&mut self, client_id: u8, text: &str) {
        self.queue_chat_message(client_id, "Server", text, ChatMessageType::Error);
    }
}
