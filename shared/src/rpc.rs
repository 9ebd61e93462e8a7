//! Request and response payloads understood by the score database.
//!
//! Every remote verb has its own payload pair. [`Request`] and [`Response`]
//! wrap them so the transport and the durable fallback log can carry any verb
//! with the same bincode encoding.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MapName {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlayerName {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlayerAndMap {
    pub player_name: String,
    pub map_name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TopRankRequest {
    pub map_name: String,
    pub num_ranks: u32,
    pub offset: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TopPointsRequest {
    pub num_ranks: u32,
    pub offset: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RandomMapRequest {
    pub stars: i32,
    pub current_map: String,
    pub server_type: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RandomUnfinishedMapRequest {
    pub stars: i32,
    pub current_map: String,
    pub server_type: String,
    pub player_name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TeeFinish {
    pub player_name: String,
    pub checkpoints: Vec<f32>,
}

/// A finished race, solo or as a team.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Finish {
    pub map_name: String,
    pub game_uuid: String,
    pub team: bool,
    pub time: f32,
    pub tees: Vec<TeeFinish>,
}

/// Race state of one team member at the moment the team was saved.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SavedTee {
    pub name: String,
    pub race_time: f32,
    pub checkpoints: Vec<f32>,
}

/// Self-contained team savegame. Carries everything needed to restore the
/// team or to resubmit the save later.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TeamSave {
    pub code: String,
    pub map_name: String,
    pub team_locked: bool,
    pub tees: Vec<SavedTee>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TeamLoadRequest {
    pub code: String,
    pub map_name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Time {
    pub time: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Birthday {
    pub years_ago: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlayerScore {
    pub time: f32,
    pub checkpoints: Vec<f32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Text {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MapFound {
    pub map_name: String,
    pub server_type: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RandomMap {
    pub name: String,
}

/// Chat produced by the database for a finish: one line for everyone and
/// optional private lines keyed by client id.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct FinishChat {
    pub chat_all: String,
    pub chat_id: BTreeMap<u32, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Request {
    BestTime(MapName),
    CheckBirthday(PlayerName),
    PlayerScore(PlayerAndMap),
    MapInfo(MapName),
    FindMap(MapName),
    Finish(Finish),
    ShowRank(PlayerAndMap),
    ShowTeamRank(PlayerAndMap),
    ShowTimes(PlayerAndMap),
    ShowTop(TopRankRequest),
    ShowTeamTop(TopRankRequest),
    ShowPoints(PlayerName),
    ShowTopPoints(TopPointsRequest),
    RandomMap(RandomMapRequest),
    RandomUnfinishedMap(RandomUnfinishedMapRequest),
    SaveTeam(TeamSave),
    LoadTeam(TeamLoadRequest),
    LoadingTeamDone(TeamLoadRequest),
}

impl Request {
    /// Short verb name used in logs.
    pub fn verb(&self) -> &'static str {
        match self {
            Request::BestTime(_) => "best_time",
            Request::CheckBirthday(_) => "check_birthday",
            Request::PlayerScore(_) => "player_score",
            Request::MapInfo(_) => "map_info",
            Request::FindMap(_) => "find_map",
            Request::Finish(_) => "finish",
            Request::ShowRank(_) => "show_rank",
            Request::ShowTeamRank(_) => "show_team_rank",
            Request::ShowTimes(_) => "show_times",
            Request::ShowTop(_) => "show_top",
            Request::ShowTeamTop(_) => "show_team_top",
            Request::ShowPoints(_) => "show_points",
            Request::ShowTopPoints(_) => "show_top_points",
            Request::RandomMap(_) => "random_map",
            Request::RandomUnfinishedMap(_) => "random_unfinished_map",
            Request::SaveTeam(_) => "save_team",
            Request::LoadTeam(_) => "load_team",
            Request::LoadingTeamDone(_) => "loading_team_done",
        }
    }

    /// Whether the verb changes state on the database side.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Request::Finish(_) | Request::SaveTeam(_) | Request::LoadingTeamDone(_)
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Response {
    Time(Time),
    Birthday(Birthday),
    PlayerScore(PlayerScore),
    Text(Text),
    MapFound(MapFound),
    RandomMap(RandomMap),
    FinishChat(FinishChat),
    TeamSave(TeamSave),
    Ack,
}

/// Error status reported by the database.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Status {
    NotFound,
    Unavailable(String),
    Internal(String),
}

/// Envelope for calls over a database connection. Each frame is preceded
/// on the stream by its body length as a little-endian `u32`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Frame {
    Call { id: u64, request: Request },
    Reply { id: u64, result: Result<Response, Status> },
}

pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Prefixes an encoded body with its length.
pub fn encode_length_prefixed(body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(body);
    buf
}
