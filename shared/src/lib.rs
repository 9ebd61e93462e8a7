use serde::{Deserialize, Serialize};

pub mod rpc;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_CLIENTS: usize = 64;
pub const NUM_CHECKPOINTS: usize = 25;
pub const MAX_NAME_LENGTH: usize = 16;

/// Packets exchanged between game clients and the server over UDP.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    Connect {
        client_version: u32,
        name: String,
    },
    Chat {
        message: String,
    },
    RaceStart,
    Finish {
        checkpoints: Vec<f32>,
    },
    Disconnect,

    Connected {
        client_id: u32,
    },
    ChatLine {
        from: Option<u32>,
        text: String,
    },
    Broadcast {
        text: String,
    },
    Disconnected {
        reason: String,
    },
}

/// Trims a requested player name to what the server accepts.
pub fn sanitize_name(name: &str) -> String {
    let trimmed: String = name
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_NAME_LENGTH)
        .collect();
    let trimmed = trimmed.trim();
    if trimmed.is_empty() {
        "nameless tee".to_string()
    } else {
        trimmed.to_string()
    }
}
