//! Vote handling: submarine/mode preferences for the next round, end-round
//! votes and kick votes, with tallies replicated through the lobby update
//! stream.

use crate::lifecycle::RoundState;
use crate::session::Session;
use log::warn;
use shared::protocol::{VoteBody, VoteStatusBody};
use std::collections::HashMap;

/// Fraction of connected clients required to kick a player.
pub const KICK_VOTE_REQUIRED_RATIO: f32 = 0.6;
/// Fraction of character-holding clients required to end the round.
pub const END_VOTE_REQUIRED_RATIO: f32 = 0.6;

impl Session {
    pub fn handle_vote(&mut self, client_id: u8, vote: VoteBody) {
        match vote {
            VoteBody::Sub(name) => {
                let Some(canonical) = self
                    .lobby
                    .sub_list
                    .iter()
                    .find(|s| s.eq_ignore_ascii_case(&name))
                    .cloned()
                else {
                    self.chat_error(client_id, &format!("Unknown submarine '{}'.", name));
                    return;
                };
                if let Some(client) = self.clients.get_mut(client_id) {
                    client.votes.sub = Some(canonical);
                }
            }
            VoteBody::Mode(name) => {
                let Some(canonical) = self
                    .lobby
                    .mode_list
                    .iter()
                    .find(|m| m.eq_ignore_ascii_case(&name))
                    .cloned()
                else {
                    self.chat_error(client_id, &format!("Unknown game mode '{}'.", name));
                    return;
                };
                if let Some(client) = self.clients.get_mut(client_id) {
                    client.votes.mode = Some(canonical);
                }
            }
            VoteBody::EndRound(wants_end) => {
                if let Some(client) = self.clients.get_mut(client_id) {
                    client.votes.end_round = wants_end;
                }
            }
            VoteBody::Kick(target_id) => {
                if target_id == client_id || self.clients.get(target_id).is_none() {
                    warn!("Client {} cast an invalid kick vote", client_id);
                    return;
                }
                if let Some(client) = self.clients.get_mut(client_id) {
                    client.votes.kick.insert(target_id);
                }
            }
        }
        self.update_vote_status();
    }

    /// Recomputes the tallies, replicates them when they changed, and
    /// enacts any vote that has crossed its threshold. Called after every
    /// vote and after every join or departure, since the ratios move with
    /// the player count.
    pub fn update_vote_status(&mut self) {
        let total = self.clients.len();
        if total == 0 {
            self.latest_vote_status = VoteStatusBody::default();
            return;
        }

        // end-round votes are a crew matter: both the count and the quorum
        // only cover clients with a character in the round
        let mut end_count = 0usize;
        let mut end_max = 0usize;
        for client in self.clients.iter() {
            if client.character.is_none() {
                continue;
            }
            end_max += 1;
            if client.votes.end_round {
                end_count += 1;
            }
        }
        let mut kick_tally: HashMap<u8, u8> = HashMap::new();
        for client in self.clients.iter() {
            for &target in &client.votes.kick {
                *kick_tally.entry(target).or_default() += 1;
            }
        }
        // stale votes against departed clients don't count
        kick_tally.retain(|target, _| self.clients.get(*target).is_some());

        let mut kick_counts: Vec<(u8, u8)> = kick_tally.iter().map(|(&t, &n)| (t, n)).collect();
        kick_counts.sort_unstable();
        let status = VoteStatusBody {
            end_count: end_count as u8,
            end_max: end_max as u8,
            kick_counts,
        };
        if status != self.latest_vote_status {
            self.latest_vote_status = status;
            self.bump_lobby_update();
        }

        let kicked: Vec<String> = kick_tally
            .into_iter()
            .filter(|(_, votes)| *votes as f32 / total as f32 >= KICK_VOTE_REQUIRED_RATIO)
            .filter_map(|(target, _)| self.clients.get(target).map(|c| c.name.clone()))
            .collect();
        for name in kicked {
            self.log_line(format!("{} was kicked by vote.", name));
            self.kick_client(&name, "voted out");
        }

        if self.lifecycle.state == RoundState::InRound
            && end_max > 0
            && end_count as f32 / end_max as f32 >= END_VOTE_REQUIRED_RATIO
        {
            self.end_game("Round ended by vote.");
        }
    }

    /// The sub with the most votes, ties broken by name for determinism.
    pub(crate) fn winning_sub_vote(&self) -> Option<String> {
        Self::winning_vote(self.clients.iter().filter_map(|c| c.votes.sub.as_deref()))
    }

    pub(crate) fn winning_mode_vote(&self) -> Option<String> {
        Self::winning_vote(self.clients.iter().filter_map(|c| c.votes.mode.as_deref()))
    }

    fn winning_vote<'a>(votes: impl Iterator<Item = &'a str>) -> Option<String> {
        let mut tally: HashMap<&str, usize> = HashMap::new();
        for vote in votes {
            *tally.entry(vote).or_default() += 1;
        }
        let mut ranked: Vec<(&str, usize)> = tally.into_iter().collect();
        ranked.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        ranked.first().map(|(name, _)| name.to_string())
    }
}
