//! Round lifecycle: Lobby -> Starting -> InRound -> Ending and back.
//!
//! Transitions are driven from [`Session::tick`]; everything that waits
//! (the start handshake, the end-of-round delay, respawns) is a resumable
//! task polled per tick rather than a blocking wait.

use crate::jobs::{assign_jobs, JobCandidate};
use crate::session::{encode_event_payload, LobbyState, Session};
use crate::tasks::{Countdown, StartHandshake, TaskState};
use log::info;
use rand::Rng;
use shared::protocol::{EventPayload, RoundEndNotice, StartGameNotice};
use shared::packets::{PacketWriter, ServerPacketHeader};
use std::time::{Duration, Instant};

/// Delay before an auto-restarting server launches the next round.
pub const AUTO_RESTART_INTERVAL_SECONDS: f32 = 30.0;
/// How long the server waits for round-start confirmations.
pub const START_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);
/// End-of-round linger before everyone returns to the lobby.
pub const END_CINEMATIC_SECONDS: f32 = 5.0;
/// Delay between a crew member dying and their replacement spawning.
pub const RESPAWN_DELAY_SECONDS: f32 = 8.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    Lobby,
    Starting,
    InRound,
    Ending,
}

#[derive(Debug)]
pub struct Lifecycle {
    pub state: RoundState,
    pub auto_restart_timer: Option<f32>,
    pub handshake: Option<StartHandshake>,
    pub end_countdown: Option<Countdown>,
    pub respawn_timer: Option<Countdown>,
    pub round_start: Option<Instant>,
    pub two_teams: bool,
    pub respawn_allowed: bool,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: RoundState::Lobby,
            auto_restart_timer: None,
            handshake: None,
            end_countdown: None,
            respawn_timer: None,
            round_start: None,
            two_teams: false,
            respawn_allowed: true,
        }
    }

    pub fn start_notice(&self, lobby: &LobbyState) -> StartGameNotice {
        StartGameNotice {
            seed: lobby.level_seed,
            sub: lobby.selected_sub.clone(),
            shuttle: lobby.selected_shuttle.clone(),
            mode: lobby.selected_mode.clone(),
            respawn_allowed: self.respawn_allowed,
            two_teams: self.two_teams,
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Launches a round from the lobby. Votes pick the submarine and mode,
    /// falling back to the host selection; returns false when the launch is
    /// rejected.
    pub fn start_game(&mut self, now: Instant) -> bool {
        if self.lifecycle.state != RoundState::Lobby {
            return false;
        }
        if self.clients.is_empty() {
            self.flash("Cannot start the round without players.");
            return false;
        }

        if let Some(sub) = self.winning_sub_vote() {
            self.lobby.selected_sub = sub;
        }
        if let Some(mode) = self.winning_mode_vote() {
            self.lobby.selected_mode = mode;
        }
        if !self.lobby.sub_list.contains(&self.lobby.selected_sub) {
            self.flash("Selected submarine is not available.");
            return false;
        }
        if !self.lobby.mode_list.contains(&self.lobby.selected_mode) {
            self.flash("Selected game mode is not available.");
            return false;
        }

        self.lobby.level_seed = self.rng.gen();
        self.lifecycle.two_teams = self.lobby.selected_mode == "pvp";
        self.lifecycle.respawn_allowed = self.config.allow_respawn;
        self.lifecycle.state = RoundState::Starting;
        self.lifecycle.handshake = Some(StartHandshake::new(
            self.clients.ids(),
            now,
            START_HANDSHAKE_TIMEOUT,
        ));
        for client in self.clients.iter_mut() {
            client.ready_to_start = false;
        }
        self.bump_lobby_update();
        self.notify_round_state();
        self.log_line(format!(
            "Starting round: sub {}, mode {}, seed {}",
            self.lobby.selected_sub, self.lobby.selected_mode, self.lobby.level_seed
        ));

        let addrs: Vec<_> = self.clients.iter().map(|c| c.addr).collect();
        for addr in addrs {
            self.send_start_notice(addr);
        }
        true
    }

    /// The handshake has resolved: load the level, assign crews and open
    /// the round.
    fn begin_round(&mut self, now: Instant) {
        self.lifecycle.handshake = None;
        self.round_log.clear();
        self.world.load_level(self.lobby.level_seed);
        self.events.clear();

        let participants: Vec<u8> = self
            .clients
            .iter()
            .filter(|c| !c.spectate_only)
            .map(|c| c.id)
            .collect();
        let two_teams = self.lifecycle.two_teams;
        for (i, &id) in participants.iter().enumerate() {
            if let Some(client) = self.clients.get_mut(id) {
                client.team = if two_teams && i % 2 == 1 { 2 } else { 1 };
            }
        }

        let teams: &[u8] = if two_teams { &[1, 2] } else { &[1] };
        for &team in teams {
            self.assign_team_crew(team, &participants);
        }

        self.lifecycle.state = RoundState::InRound;
        self.lifecycle.round_start = Some(now);
        self.lifecycle.respawn_timer = None;
        self.bump_lobby_update();
        self.notify_round_state();
        self.log_line("Round started.".to_string());
    }

    fn assign_team_crew(&mut self, team: u8, participants: &[u8]) {
        let candidates: Vec<JobCandidate> = participants
            .iter()
            .filter_map(|&id| self.clients.get(id))
            .filter(|c| c.team == team)
            .map(|c| JobCandidate {
                client_id: c.id,
                preferences: c
                    .job_preferences
                    .iter()
                    .filter_map(|name| {
                        self.jobs
                            .iter()
                            .position(|j| j.name.eq_ignore_ascii_case(name))
                    })
                    .collect(),
            })
            .collect();
        let crew_size = candidates.len();

        for (client_id, job_idx) in assign_jobs(&self.jobs, candidates, crew_size, &mut self.rng) {
            let (x, y) = self.world.spawn_point(team);
            let character_id = self.world.spawn_character(x, y, team, Some(client_id));
            let job_name = self.jobs[job_idx].name.clone();
            if let Some(entity) = self.world.get_mut(character_id) {
                if let Some(character) = entity.character.as_mut() {
                    character.job = Some(job_name.clone());
                }
            }
            let name = if let Some(client) = self.clients.get_mut(client_id) {
                client.character = Some(character_id);
                client.name.clone()
            } else {
                continue;
            };
            if let Some(bytes) = encode_event_payload(&EventPayload::Spawn {
                kind: 0,
                x,
                y,
                owner: client_id,
            }) {
                self.events.create_event(&self.world, character_id, bytes);
            }
            self.log_line(format!("{} spawns as {} (team {}).", name, job_name, team));
        }
    }

    /// Ends the running round with a reason shown to every client.
    pub fn end_game(&mut self, reason: &str) {
        if !matches!(
            self.lifecycle.state,
            RoundState::InRound | RoundState::Starting
        ) {
            return;
        }
        self.log_line(format!("Round over: {}", reason));
        let summary = self.round_log.join("\n");

        let addrs: Vec<_> = self.clients.iter().map(|c| c.addr).collect();
        for addr in addrs {
            let mut writer = PacketWriter::server(ServerPacketHeader::EndGame);
            if writer
                .write_body(&RoundEndNotice {
                    summary: summary.clone(),
                })
                .is_ok()
            {
                self.queue_packet(addr, writer.into_bytes());
            }
        }

        self.lifecycle.state = RoundState::Ending;
        self.lifecycle.handshake = None;
        self.lifecycle.end_countdown = Some(Countdown::new(END_CINEMATIC_SECONDS));
        self.notify_round_state();
    }

    fn return_to_lobby(&mut self) {
        info!("Returning to lobby");
        self.world.clear();
        self.events.clear();
        self.clients.disconnected.clear();
        for client in self.clients.iter_mut() {
            client.reset_round_state();
        }
        self.round_log.clear();
        self.lifecycle.state = RoundState::Lobby;
        self.lifecycle.round_start = None;
        self.lifecycle.end_countdown = None;
        self.lifecycle.respawn_timer = None;
        self.lifecycle.auto_restart_timer = if self.config.auto_restart {
            Some(AUTO_RESTART_INTERVAL_SECONDS)
        } else {
            None
        };
        self.bump_lobby_update();
        self.notify_round_state();
        self.update_vote_status();
    }

    /// One lifecycle step, called every tick after inbound packets have
    /// been drained.
    pub fn update_lifecycle(&mut self, now: Instant, dt: f32) {
        match self.lifecycle.state {
            RoundState::Lobby => {
                if self.config.auto_restart && !self.clients.is_empty() {
                    let expired = {
                        let timer = self
                            .lifecycle
                            .auto_restart_timer
                            .get_or_insert(AUTO_RESTART_INTERVAL_SECONDS);
                        *timer -= dt;
                        *timer <= 0.0
                    };
                    if expired {
                        self.lifecycle.auto_restart_timer = None;
                        self.start_game(now);
                    }
                } else {
                    self.lifecycle.auto_restart_timer = None;
                }
            }
            RoundState::Starting => {
                let resolved = match self.lifecycle.handshake.as_ref() {
                    Some(handshake) => handshake.poll(now) != TaskState::Pending,
                    None => true,
                };
                if resolved {
                    self.begin_round(now);
                }
            }
            RoundState::InRound => {
                if !self.clients.is_empty() {
                    // with respawns on, a dead crew comes back instead
                    if !self.lifecycle.respawn_allowed && self.crew_is_dead() {
                        self.end_game("The crew is dead!");
                        return;
                    }
                    if self.world.main_sub_at_end() {
                        self.end_game("The submarine reached its destination.");
                        return;
                    }
                }
                if self.lifecycle.respawn_allowed {
                    self.update_respawns(dt);
                }
            }
            RoundState::Ending => {
                let done = self
                    .lifecycle
                    .end_countdown
                    .as_mut()
                    .map_or(true, |countdown| countdown.tick(dt));
                if done {
                    self.return_to_lobby();
                }
            }
        }
    }

    /// True when client-owned characters exist and none of them is alive.
    /// Characters parked for a disconnect grace period still count as
    /// living crew.
    fn crew_is_dead(&self) -> bool {
        let mut any = false;
        for entity in self.world.entities() {
            let Some(character) = &entity.character else {
                continue;
            };
            if character.client_id.is_none() {
                continue;
            }
            any = true;
            if entity.is_alive_character() {
                return false;
            }
        }
        any
    }

    fn update_respawns(&mut self, dt: f32) {
        let waiting: Vec<u8> = self
            .clients
            .iter()
            .filter(|c| c.in_game && !c.spectate_only && !c.needs_mid_round_sync)
            .filter(|c| {
                c.character.map_or(true, |id| {
                    !self.world.get(id).map_or(false, |e| e.is_alive_character())
                })
            })
            .map(|c| c.id)
            .collect();

        if waiting.is_empty() {
            self.lifecycle.respawn_timer = None;
            return;
        }
        let elapsed = self
            .lifecycle
            .respawn_timer
            .get_or_insert(Countdown::new(RESPAWN_DELAY_SECONDS))
            .tick(dt);
        if !elapsed {
            return;
        }
        self.lifecycle.respawn_timer = None;

        for client_id in waiting {
            let Some((team, name)) = self
                .clients
                .get(client_id)
                .map(|c| (c.team, c.name.clone()))
            else {
                continue;
            };
            let (x, y) = self.world.spawn_point(team);
            let character_id = self.world.spawn_character(x, y, team, Some(client_id));
            if let Some(client) = self.clients.get_mut(client_id) {
                client.character = Some(character_id);
            }
            if let Some(bytes) = encode_event_payload(&EventPayload::Spawn {
                kind: 0,
                x,
                y,
                owner: client_id,
            }) {
                self.events.create_event(&self.world, character_id, bytes);
            }
            self.log_line(format!("{} respawns (team {}).", name, team));
        }
    }

    pub(crate) fn notify_round_state(&mut self) {
        let state = self.lifecycle.state;
        if let Some(presenter) = self.presenter.as_mut() {
            presenter.round_state_changed(state);
        }
    }

    pub(crate) fn flash(&mut self, text: &str) {
        info!("{}", text);
        if let Some(presenter) = self.presenter.as_mut() {
            presenter.flash_message(text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ServerConfig;
    use std::net::SocketAddr;
    use std::path::PathBuf;

    fn test_session() -> Session {
        let config = ServerConfig {
            banlist_path: PathBuf::from("/nonexistent/banlist.json"),
            permissions_path: PathBuf::from("/nonexistent/permissions.json"),
            ..ServerConfig::default()
        };
        Session::with_seed(config, 42)
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn join(session: &mut Session, name: &str, port: u16) -> u8 {
        session.clients.add_client(addr(port), name.to_string()).unwrap()
    }

    fn force_round(session: &mut Session, now: Instant) {
        assert!(session.start_game(now));
        let ids = session.clients.ids();
        let handshake = session.lifecycle.handshake.as_mut().unwrap();
        for id in ids {
            handshake.mark_ready(id);
        }
        session.update_lifecycle(now, 0.15);
        assert_eq!(session.lifecycle.state, RoundState::InRound);
    }

    #[test]
    fn test_start_rejected_without_players() {
        let mut session = test_session();
        assert!(!session.start_game(Instant::now()));
        assert_eq!(session.lifecycle.state, RoundState::Lobby);
    }

    #[test]
    fn test_full_round_cycle() {
        let mut session = test_session();
        join(&mut session, "a", 9000);
        join(&mut session, "b", 9001);
        let now = Instant::now();

        force_round(&mut session, now);
        // everyone got a character with a job
        for client in session.clients.iter() {
            let character_id = client.character.unwrap();
            let entity = session.world.get(character_id).unwrap();
            assert!(entity.is_alive_character());
            assert!(entity.character.as_ref().unwrap().job.is_some());
        }
        // spawn events were logged for the new characters
        assert_eq!(session.events.event_count(), 2);

        session.end_game("test over");
        assert_eq!(session.lifecycle.state, RoundState::Ending);
        for _ in 0..60 {
            session.update_lifecycle(now, 0.15);
        }
        assert_eq!(session.lifecycle.state, RoundState::Lobby);
        assert_eq!(session.events.event_count(), 0);
        assert!(session.world.is_empty());
        for client in session.clients.iter() {
            assert!(client.character.is_none());
            assert!(!client.in_game);
        }
    }

    #[test]
    fn test_handshake_timeout_still_starts_round() {
        let mut session = test_session();
        join(&mut session, "a", 9000);
        let now = Instant::now();
        assert!(session.start_game(now));
        assert_eq!(session.lifecycle.state, RoundState::Starting);

        // nobody confirms; the deadline forces the start
        session.update_lifecycle(now + Duration::from_secs(5), 0.15);
        assert_eq!(session.lifecycle.state, RoundState::Starting);
        session.update_lifecycle(now + START_HANDSHAKE_TIMEOUT, 0.15);
        assert_eq!(session.lifecycle.state, RoundState::InRound);
    }

    #[test]
    fn test_crew_death_ends_round() {
        let mut session = test_session();
        let a = join(&mut session, "a", 9000);
        let b = join(&mut session, "b", 9001);
        let now = Instant::now();
        force_round(&mut session, now);
        session.lifecycle.respawn_allowed = false;

        for id in [a, b] {
            let character_id = session.clients.get(id).unwrap().character.unwrap();
            session.kill_character(character_id);
        }
        session.update_lifecycle(now, 0.15);
        assert_eq!(session.lifecycle.state, RoundState::Ending);
    }

    #[test]
    fn test_sub_reaching_destination_ends_round() {
        let mut session = test_session();
        join(&mut session, "a", 9000);
        let now = Instant::now();
        force_round(&mut session, now);

        let sub = session.world.main_sub.unwrap();
        session.world.get_mut(sub).unwrap().at_end_position = true;
        session.update_lifecycle(now, 0.15);
        assert_eq!(session.lifecycle.state, RoundState::Ending);
    }

    #[test]
    fn test_pvp_mode_splits_teams() {
        let mut session = test_session();
        session.lobby.selected_mode = "pvp".to_string();
        for i in 0..4 {
            join(&mut session, &format!("p{}", i), 9000 + i);
        }
        let now = Instant::now();
        force_round(&mut session, now);

        let mut teams: Vec<u8> = session.clients.iter().map(|c| c.team).collect();
        teams.sort_unstable();
        assert_eq!(teams, vec![1, 1, 2, 2]);
        // the two crews spawn at their own ends of the level
        for client in session.clients.iter() {
            let entity = session.world.get(client.character.unwrap()).unwrap();
            let expected_x = if client.team == 2 { 4000.0 } else { 0.0 };
            assert_eq!(entity.x, expected_x);
        }
    }

    #[test]
    fn test_respawn_after_death() {
        let mut session = test_session();
        let a = join(&mut session, "a", 9000);
        let now = Instant::now();
        force_round(&mut session, now);
        session.clients.get_mut(a).unwrap().in_game = true;

        let old_character = session.clients.get(a).unwrap().character.unwrap();
        session.kill_character(old_character);

        let mut respawned = false;
        for _ in 0..80 {
            session.update_lifecycle(now, 0.15);
            if session.lifecycle.state != RoundState::InRound {
                break;
            }
            let character = session.clients.get(a).unwrap().character.unwrap();
            if character != old_character {
                respawned = true;
                break;
            }
        }
        assert!(respawned, "client was never respawned");
    }
}
