use log::{debug, info};
use shared::rpc::{PlayerScore, SavedTee, TeamSave};
use shared::{Packet, MAX_CLIENTS, NUM_CHECKPOINTS};
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use crate::client_manager::ClientManager;
use crate::config::{ScoreConfig, TeamMode};
use crate::epoch::{EpochSource, RunId};
use crate::save::{self, LoadTeamError, SaveTeamError, TeeView};

/// Who a chat line is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTarget {
    All,
    Client(usize),
    Team(u8),
}

/// A line waiting in the outbox until the network layer delivers it.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Chat { target: ChatTarget, text: String },
    Broadcast { slot: usize, text: String },
}

/// Why a player may not call a map vote right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteWait {
    /// Player joined too recently.
    FirstVote { secs: u64 },
    /// Player called a vote too recently.
    Cooldown { secs: u64 },
    /// The last map vote on the server was too recent.
    MapVoteDelay { delay: u64, secs: u64 },
}

impl VoteWait {
    pub fn message(&self) -> String {
        match self {
            VoteWait::FirstVote { secs } => {
                format!("You must wait {} seconds before making your first vote.", secs)
            }
            VoteWait::Cooldown { secs } => {
                format!("You must wait {} seconds before making another vote.", secs)
            }
            VoteWait::MapVoteDelay { delay, secs } => format!(
                "There's a {} second delay between map-votes, please wait {} seconds.",
                delay, secs
            ),
        }
    }

    /// Only the server-wide map delay lets the vote go ahead.
    pub fn blocks(&self) -> bool {
        !matches!(self, VoteWait::MapVoteDelay { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapVote {
    pub map: String,
    pub server_type: String,
    pub caller: usize,
    pub started_tick: u64,
}

/// Per-slot race and score record.
#[derive(Debug, Clone)]
pub struct PlayerRecord {
    pub team: u8,
    pub best_time: Option<f32>,
    pub current_time: Option<f32>,
    pub score: Option<i32>,
    pub has_finish_score: bool,
    pub best_checkpoints: Vec<f32>,
    /// Tick the current race started, `None` when not racing.
    pub race_start: Option<u64>,
    pub checkpoints: Vec<f32>,
    pub first_vote_tick: u64,
    pub last_vote_call: Option<u64>,
}

impl PlayerRecord {
    fn new(first_vote_tick: u64) -> Self {
        Self {
            team: 0,
            best_time: None,
            current_time: None,
            score: None,
            has_finish_score: false,
            best_checkpoints: vec![0.0; NUM_CHECKPOINTS],
            race_start: None,
            checkpoints: Vec::new(),
            first_vote_tick,
            last_vote_call: None,
        }
    }

    pub fn is_racing(&self) -> bool {
        self.race_start.is_some()
    }
}

/// One finishing tee, as snapshotted when a race ends.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedTee {
    pub slot: usize,
    pub name: String,
    pub checkpoints: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RaceFinish {
    pub team: bool,
    pub time: f32,
    pub tees: Vec<FinishedTee>,
}

/// The game-state operations deferred score effects are allowed to perform.
pub trait GameContext: EpochSource {
    fn client_name(&self, slot: usize) -> Option<String>;
    fn team_of(&self, slot: usize) -> Option<u8>;
    /// Slots currently in `team`.
    fn team_members(&self, team: u8) -> Vec<usize>;

    fn send_chat_all(&mut self, text: &str);
    fn send_chat_target(&mut self, slot: usize, text: &str);
    fn send_chat_team(&mut self, team: u8, text: &str);
    fn send_broadcast(&mut self, slot: usize, text: &str);

    fn set_current_record(&mut self, time: f32);
    fn set_player_score(&mut self, slot: usize, score: &PlayerScore, with_checkpoints: bool);

    /// Returns why `slot` cannot call a vote now, if anything stops it.
    fn vote_wait(&self, slot: usize) -> Option<VoteWait>;
    fn start_map_vote(&mut self, map: &str, server_type: &str, caller: usize);
    /// Lets the next map vote through without waiting for the delay.
    fn reset_map_vote_timer(&mut self);

    fn is_team_locked(&self, team: u8) -> bool;
    /// Snapshots the team of `slot` for a savegame.
    fn capture_team(&self, slot: usize) -> Result<(u8, Vec<SavedTee>), SaveTeamError>;
    /// Stops the race of every member of `team`.
    fn kill_team(&mut self, team: u8);
    /// Restores a savegame onto the team of `slot`.
    fn restore_team(&mut self, slot: usize, save: &TeamSave) -> Result<(), LoadTeamError>;
}

/// Connected players and the score-related state of the running game.
pub struct GameState {
    pub tick: u64,
    pub clients: ClientManager,
    config: ScoreConfig,
    players: BTreeMap<usize, PlayerRecord>,
    locked_teams: HashSet<u8>,
    current_record: Option<f32>,
    map_vote: Option<MapVote>,
    last_map_vote_tick: Option<u64>,
    run_id: RunId,
    outbox: Vec<Outgoing>,
}

impl GameState {
    pub fn new(config: ScoreConfig, max_clients: usize) -> Self {
        Self {
            tick: 0,
            clients: ClientManager::new(max_clients),
            config,
            players: BTreeMap::new(),
            locked_teams: HashSet::new(),
            current_record: None,
            map_vote: None,
            last_map_vote_tick: None,
            run_id: RunId::generate(),
            outbox: Vec::new(),
        }
    }

    pub fn config(&self) -> &ScoreConfig {
        &self.config
    }

    pub fn add_player(&mut self, addr: SocketAddr, name: String) -> Option<usize> {
        let slot = self.clients.add_client(addr, name)?;
        let first_vote_tick = self.tick + self.config.vote_delay_ticks();
        self.players.insert(slot, PlayerRecord::new(first_vote_tick));
        Some(slot)
    }

    pub fn remove_player(&mut self, slot: usize) -> bool {
        self.players.remove(&slot);
        self.clients.remove_client(slot).is_some()
    }

    /// Drops timed-out clients and their records.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<usize> {
        let timed_out = self.clients.check_timeouts(timeout);
        for slot in &timed_out {
            self.players.remove(slot);
        }
        timed_out
    }

    pub fn player(&self, slot: usize) -> Option<&PlayerRecord> {
        self.players.get(&slot)
    }

    pub fn current_record(&self) -> Option<f32> {
        self.current_record
    }

    pub fn map_vote(&self) -> Option<&MapVote> {
        self.map_vote.as_ref()
    }

    /// Returns the running map vote once it has been open for `duration` ticks.
    pub fn take_passed_vote(&mut self, duration: u64) -> Option<MapVote> {
        let vote = self.map_vote.as_ref()?;
        if self.tick < vote.started_tick + duration {
            return None;
        }
        self.map_vote.take()
    }

    /// Starts a new game session on `map`. Effects bound to the old one go
    /// stale, and every player's race and score record is reset.
    pub fn begin_session(&mut self, map: &str, server_type: &str) -> RunId {
        self.run_id = RunId::generate();
        self.config.map_name = map.to_string();
        self.config.server_type = server_type.to_string();
        self.current_record = None;
        self.map_vote = None;
        for player in self.players.values_mut() {
            *player = PlayerRecord {
                team: player.team,
                first_vote_tick: player.first_vote_tick,
                last_vote_call: player.last_vote_call,
                ..PlayerRecord::new(0)
            };
        }
        info!("Game session {} started on {}", self.run_id, map);
        self.run_id
    }

    pub fn set_team(&mut self, slot: usize, team: u8) -> Result<(), String> {
        if team as usize >= MAX_CLIENTS {
            return Err(format!("Team must be between 0 and {}", MAX_CLIENTS - 1));
        }
        if self.locked_teams.contains(&team) {
            return Err("This team is locked".to_string());
        }
        let player = self
            .players
            .get_mut(&slot)
            .ok_or_else(|| "Unknown player".to_string())?;
        if player.is_racing() {
            return Err("You can't change teams while racing".to_string());
        }
        player.team = team;
        Ok(())
    }

    pub fn set_team_locked(&mut self, team: u8, locked: bool) {
        if locked {
            self.locked_teams.insert(team);
        } else {
            self.locked_teams.remove(&team);
        }
    }

    pub fn start_race(&mut self, slot: usize) -> bool {
        if self.config.team_mode == TeamMode::Mandatory
            && self.players.get(&slot).map_or(true, |p| p.team == 0)
        {
            return false;
        }
        let tick = self.tick;
        match self.players.get_mut(&slot) {
            Some(player) => {
                player.race_start = Some(tick);
                player.checkpoints.clear();
                true
            }
            None => false,
        }
    }

    /// Ends the race of `slot`. In a team, every racing member finishes
    /// together with the same time.
    pub fn finish_race(&mut self, slot: usize, checkpoints: Vec<f32>) -> Option<RaceFinish> {
        let player = self.players.get(&slot)?;
        let start = player.race_start?;
        let team = player.team;
        let time = self.tick.saturating_sub(start) as f32 / self.config.ticks_per_sec() as f32;

        let finishers: Vec<usize> = if team > 0 {
            self.team_members(team)
                .into_iter()
                .filter(|member| self.players.get(member).is_some_and(PlayerRecord::is_racing))
                .collect()
        } else {
            vec![slot]
        };

        let mut checkpoints = checkpoints;
        checkpoints.truncate(NUM_CHECKPOINTS);

        let mut tees = Vec::with_capacity(finishers.len());
        for member in finishers {
            let name = self.clients.name(member).unwrap_or_default().to_string();
            let Some(record) = self.players.get_mut(&member) else {
                continue;
            };
            record.race_start = None;
            let tee_checkpoints = if member == slot {
                checkpoints.clone()
            } else {
                std::mem::take(&mut record.checkpoints)
            };
            record.current_time = Some(time);
            if record.best_time.map_or(true, |best| time < best) {
                record.best_time = Some(time);
                record.best_checkpoints = tee_checkpoints.clone();
                record.best_checkpoints.resize(NUM_CHECKPOINTS, 0.0);
            }
            tees.push(FinishedTee {
                slot: member,
                name,
                checkpoints: tee_checkpoints,
            });
        }

        if self.current_record.map_or(true, |record| time < record) {
            self.current_record = Some(time);
        }

        debug!("Slot {} finished in {:.2}s ({} tees)", slot, time, tees.len());
        Some(RaceFinish {
            team: team > 0,
            time,
            tees,
        })
    }

    pub fn outbox(&self) -> &[Outgoing] {
        &self.outbox
    }

    pub fn take_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    /// Resolves outgoing lines to packets for the currently connected clients.
    pub fn deliveries(&mut self) -> Vec<(SocketAddr, Packet)> {
        let mut out = Vec::new();
        for outgoing in self.take_outbox() {
            match outgoing {
                Outgoing::Chat { target, text } => {
                    let slots: Vec<usize> = match target {
                        ChatTarget::All => self.clients.clients().map(|c| c.slot).collect(),
                        ChatTarget::Client(slot) => vec![slot],
                        ChatTarget::Team(team) => self.team_members(team),
                    };
                    for slot in slots {
                        if let Some(client) = self.clients.client(slot) {
                            out.push((
                                client.addr,
                                Packet::ChatLine {
                                    from: None,
                                    text: text.clone(),
                                },
                            ));
                        }
                    }
                }
                Outgoing::Broadcast { slot, text } => {
                    if let Some(client) = self.clients.client(slot) {
                        out.push((client.addr, Packet::Broadcast { text }));
                    }
                }
            }
        }
        out
    }

    fn tee_views(&self) -> Vec<TeeView<'_>> {
        self.players
            .iter()
            .filter_map(|(&slot, record)| {
                Some(TeeView {
                    slot,
                    name: self.clients.name(slot)?,
                    team: record.team,
                    race_time: record.race_start.map(|start| {
                        self.tick.saturating_sub(start) as f32 / self.config.ticks_per_sec() as f32
                    }),
                    checkpoints: &record.checkpoints,
                })
            })
            .collect()
    }

    fn push_chat(&mut self, target: ChatTarget, text: &str) {
        // Multi-line answers from the database become separate lines.
        for line in text.lines() {
            self.outbox.push(Outgoing::Chat {
                target,
                text: line.to_string(),
            });
        }
    }
}

impl EpochSource for GameState {
    fn slot_epoch(&self, slot: usize) -> Option<u64> {
        self.clients.slot_epoch(slot)
    }

    fn run_id(&self) -> RunId {
        self.run_id
    }
}

impl GameContext for GameState {
    fn client_name(&self, slot: usize) -> Option<String> {
        self.clients.name(slot).map(str::to_string)
    }

    fn team_of(&self, slot: usize) -> Option<u8> {
        self.players.get(&slot).map(|player| player.team)
    }

    fn team_members(&self, team: u8) -> Vec<usize> {
        self.players
            .iter()
            .filter(|(_, player)| player.team == team)
            .map(|(&slot, _)| slot)
            .collect()
    }

    fn send_chat_all(&mut self, text: &str) {
        self.push_chat(ChatTarget::All, text);
    }

    fn send_chat_target(&mut self, slot: usize, text: &str) {
        self.push_chat(ChatTarget::Client(slot), text);
    }

    fn send_chat_team(&mut self, team: u8, text: &str) {
        self.push_chat(ChatTarget::Team(team), text);
    }

    fn send_broadcast(&mut self, slot: usize, text: &str) {
        self.outbox.push(Outgoing::Broadcast {
            slot,
            text: text.to_string(),
        });
    }

    fn set_current_record(&mut self, time: f32) {
        if time > 0.0 {
            self.current_record = Some(time);
        }
    }

    fn set_player_score(&mut self, slot: usize, score: &PlayerScore, with_checkpoints: bool) {
        let Some(player) = self.players.get_mut(&slot) else {
            return;
        };
        if score.time <= 0.0 {
            return;
        }
        player.best_time = Some(score.time);
        player.current_time = Some(score.time);
        player.score = Some(-(score.time as i32));
        player.has_finish_score = true;
        if with_checkpoints {
            let mut checkpoints = score.checkpoints.clone();
            checkpoints.resize(NUM_CHECKPOINTS, 0.0);
            player.best_checkpoints = checkpoints;
        }
    }

    fn vote_wait(&self, slot: usize) -> Option<VoteWait> {
        let player = self.players.get(&slot)?;
        let tick_rate = self.config.ticks_per_sec() as u64;
        let secs_until = |tick: u64| tick.saturating_sub(self.tick).div_ceil(tick_rate);

        if self.tick < player.first_vote_tick {
            return Some(VoteWait::FirstVote {
                secs: secs_until(player.first_vote_tick),
            });
        }
        if let Some(last) = player.last_vote_call {
            let until = last + self.config.vote_delay_ticks();
            if self.tick < until {
                return Some(VoteWait::Cooldown {
                    secs: secs_until(until),
                });
            }
        }
        if let Some(last) = self.last_map_vote_tick {
            let until = last + self.config.map_vote_delay_ticks();
            if self.tick < until {
                return Some(VoteWait::MapVoteDelay {
                    delay: self.config.map_vote_delay_secs,
                    secs: secs_until(until),
                });
            }
        }
        None
    }

    fn start_map_vote(&mut self, map: &str, server_type: &str, caller: usize) {
        let name = self.client_name(caller).unwrap_or_default();
        if let Some(player) = self.players.get_mut(&caller) {
            player.last_vote_call = Some(self.tick);
        }
        self.last_map_vote_tick = Some(self.tick);
        self.map_vote = Some(MapVote {
            map: map.to_string(),
            server_type: server_type.to_string(),
            caller,
            started_tick: self.tick,
        });
        info!("Map vote for {} ({}) called by {}", map, server_type, name);
        self.send_chat_all(&format!(
            "'{}' called vote to change server option 'Map: {}' ({})",
            name, map, server_type
        ));
    }

    fn reset_map_vote_timer(&mut self) {
        self.last_map_vote_tick = None;
    }

    fn is_team_locked(&self, team: u8) -> bool {
        self.locked_teams.contains(&team)
    }

    fn capture_team(&self, slot: usize) -> Result<(u8, Vec<SavedTee>), SaveTeamError> {
        let team = self.team_of(slot).ok_or(SaveTeamError::TeamNotFound)?;
        let views = self.tee_views();
        let members: Vec<TeeView<'_>> = if team == 0 {
            views.into_iter().filter(|tee| tee.slot == slot).collect()
        } else {
            views.into_iter().filter(|tee| tee.team == team).collect()
        };
        let tees = save::capture_team(team, self.config.team_mode, &members)?;
        Ok((team, tees))
    }

    fn kill_team(&mut self, team: u8) {
        for slot in self.team_members(team) {
            if let Some(player) = self.players.get_mut(&slot) {
                player.race_start = None;
                player.checkpoints.clear();
            }
        }
    }

    fn restore_team(&mut self, slot: usize, save: &TeamSave) -> Result<(), LoadTeamError> {
        let requester = self.client_name(slot).ok_or(LoadTeamError::NotMember)?;
        let team = self.team_of(slot).ok_or(LoadTeamError::NotMember)?;
        let plan = save::restore_team(
            save,
            &requester,
            team,
            self.config.team_mode,
            &self.tee_views(),
        )?;

        let tick_rate = self.config.ticks_per_sec() as f32;
        for restore in plan {
            if let Some(player) = self.players.get_mut(&restore.slot) {
                let raced_ticks = (restore.tee.race_time * tick_rate) as u64;
                player.race_start = Some(self.tick.saturating_sub(raced_ticks));
                player.checkpoints = restore.tee.checkpoints;
            }
        }
        self.set_team_locked(team, save.team_locked);
        Ok(())
    }
}
