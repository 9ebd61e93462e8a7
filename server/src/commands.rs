//! Chat commands understood by the server.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Rank(Option<String>),
    TeamRank(Option<String>),
    Times(Option<String>),
    Top5(i32),
    TeamTop5(i32),
    Points(Option<String>),
    TopPoints(i32),
    /// Map to look up, `None` for the current one.
    MapInfo(Option<String>),
    Map(String),
    Random(i32),
    RandomUnfinished(i32),
    Save(String),
    Load(String),
    Team(u8),
    Lock(bool),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommandError {
    #[error("Unknown command: /{0}")]
    Unknown(String),
    #[error("Usage: {0}")]
    Usage(&'static str),
}

/// Parses a chat message. Returns `None` for plain chat.
pub fn parse(message: &str) -> Option<Result<Command, CommandError>> {
    let body = message.trim().strip_prefix('/')?;
    let (name, rest) = match body.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (body, ""),
    };
    let arg = (!rest.is_empty()).then(|| rest.to_string());

    let command = match name.to_ascii_lowercase().as_str() {
        "rank" => Ok(Command::Rank(arg)),
        "teamrank" => Ok(Command::TeamRank(arg)),
        "times" => Ok(Command::Times(arg)),
        "top5" => offset(rest, "/top5 [offset]").map(Command::Top5),
        "teamtop5" => offset(rest, "/teamtop5 [offset]").map(Command::TeamTop5),
        "points" => Ok(Command::Points(arg)),
        "toppoints" => offset(rest, "/toppoints [offset]").map(Command::TopPoints),
        "mapinfo" => Ok(Command::MapInfo(arg)),
        "map" => arg.map(Command::Map).ok_or(CommandError::Usage("/map <name>")),
        "random" => stars(rest, "/random [stars]").map(Command::Random),
        "randomunfinished" => {
            stars(rest, "/randomunfinished [stars]").map(Command::RandomUnfinished)
        }
        "save" => Ok(Command::Save(rest.to_string())),
        "load" => arg.map(Command::Load).ok_or(CommandError::Usage("/load <code>")),
        "team" => rest
            .parse()
            .map(Command::Team)
            .map_err(|_| CommandError::Usage("/team <0-63>")),
        "lock" => Ok(Command::Lock(true)),
        "unlock" => Ok(Command::Lock(false)),
        other => Err(CommandError::Unknown(other.to_string())),
    };
    Some(command)
}

fn offset(rest: &str, usage: &'static str) -> Result<i32, CommandError> {
    if rest.is_empty() {
        return Ok(1);
    }
    rest.parse().map_err(|_| CommandError::Usage(usage))
}

fn stars(rest: &str, usage: &'static str) -> Result<i32, CommandError> {
    if rest.is_empty() {
        return Ok(-1);
    }
    match rest.parse() {
        Ok(stars) if (0..=5).contains(&stars) => Ok(stars),
        _ => Err(CommandError::Usage(usage)),
    }
}
