//! Team savegames: capturing a racing team and checking whether a savegame
//! can be restored onto the players currently connected.
//!
//! Error `Display` texts are sent to players verbatim.

use shared::rpc::{SavedTee, TeamSave};
use shared::{MAX_CLIENTS, NUM_CHECKPOINTS};
use thiserror::Error;

use crate::config::TeamMode;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SaveTeamError {
    #[error("You have to be in a team (from 1-{})!", MAX_CLIENTS - 1)]
    NotInTeam,
    #[error("Could not find your Team!")]
    TeamNotFound,
    #[error("Unable to find all Characters!")]
    MissingCharacters,
    #[error("Your team has not started yet!")]
    NotStarted,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LoadTeamError {
    #[error("Unable to load savegame: data corrupted")]
    Corrupted,
    #[error("You don't belong to this team")]
    NotMember,
    #[error("You have to be in a team (from 1-{})", MAX_CLIENTS - 1)]
    NotInTeam,
    #[error("Too many players in this team, should be {expected}")]
    WrongSize { expected: usize },
    #[error("Unable to find player: '{0}'")]
    PlayerMissing(String),
    #[error("{0} is racing right now, Team can't be loaded if a Tee is racing already")]
    AlreadyRacing(String),
    #[error("Everyone has to be in a team, {0} is in team 0 or the wrong team")]
    WrongTeam(String),
}

/// Read-only view of one connected player, as far as savegames care.
#[derive(Debug, Clone)]
pub struct TeeView<'a> {
    pub slot: usize,
    pub name: &'a str,
    pub team: u8,
    /// Seconds raced so far, `None` when not racing.
    pub race_time: Option<f32>,
    pub checkpoints: &'a [f32],
}

/// Where one saved tee is restored.
#[derive(Debug, Clone, PartialEq)]
pub struct Restore {
    pub slot: usize,
    pub tee: SavedTee,
}

fn team_allowed(team: u8, mode: TeamMode) -> bool {
    mode == TeamMode::Solo || (team > 0 && (team as usize) < MAX_CLIENTS)
}

/// Snapshots every member of `team`. `members` must hold exactly the
/// players currently in that team.
pub fn capture_team(
    team: u8,
    mode: TeamMode,
    members: &[TeeView<'_>],
) -> Result<Vec<SavedTee>, SaveTeamError> {
    if !team_allowed(team, mode) {
        return Err(SaveTeamError::NotInTeam);
    }
    if members.is_empty() {
        return Err(SaveTeamError::TeamNotFound);
    }
    if members.iter().any(|tee| tee.name.is_empty()) {
        return Err(SaveTeamError::MissingCharacters);
    }

    members
        .iter()
        .map(|tee| {
            let race_time = tee.race_time.ok_or(SaveTeamError::NotStarted)?;
            Ok(SavedTee {
                name: tee.name.to_string(),
                race_time,
                checkpoints: tee.checkpoints.to_vec(),
            })
        })
        .collect()
}

fn is_corrupted(save: &TeamSave) -> bool {
    save.tees.is_empty()
        || save.tees.len() >= MAX_CLIENTS
        || save.tees.iter().any(|tee| {
            tee.name.is_empty()
                || !tee.race_time.is_finite()
                || tee.race_time < 0.0
                || tee.checkpoints.len() > NUM_CHECKPOINTS
        })
}

/// Matches a savegame against the connected players and decides where each
/// saved tee goes. Nothing is mutated; the caller applies the result.
///
/// `requester` is the name of the player who asked for the load, `team`
/// their current team, and `players` every connected player.
pub fn restore_team(
    save: &TeamSave,
    requester: &str,
    team: u8,
    mode: TeamMode,
    players: &[TeeView<'_>],
) -> Result<Vec<Restore>, LoadTeamError> {
    if is_corrupted(save) {
        return Err(LoadTeamError::Corrupted);
    }
    if !save.tees.iter().any(|tee| tee.name == requester) {
        return Err(LoadTeamError::NotMember);
    }
    if !team_allowed(team, mode) {
        return Err(LoadTeamError::NotInTeam);
    }

    let team_size = players.iter().filter(|tee| tee.team == team).count();
    if team_size > save.tees.len() {
        return Err(LoadTeamError::WrongSize {
            expected: save.tees.len(),
        });
    }

    save.tees
        .iter()
        .map(|saved| {
            let player = players
                .iter()
                .find(|tee| tee.name == saved.name)
                .ok_or_else(|| LoadTeamError::PlayerMissing(saved.name.clone()))?;
            if player.race_time.is_some() {
                return Err(LoadTeamError::AlreadyRacing(saved.name.clone()));
            }
            if player.team != team || !team_allowed(player.team, mode) {
                return Err(LoadTeamError::WrongTeam(saved.name.clone()));
            }
            Ok(Restore {
                slot: player.slot,
                tee: saved.clone(),
            })
        })
        .collect()
}
