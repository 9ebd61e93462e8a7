//! Score-related server settings.

use clap::ValueEnum;

/// How teams are handled on this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TeamMode {
    /// Players may race alone or join teams 1-63.
    Optional,
    /// Players must join a team before racing.
    Mandatory,
    /// Every player races in their own team; saves work from any team.
    Solo,
}

#[derive(Debug, Clone)]
pub struct ScoreConfig {
    pub map_name: String,
    pub server_type: String,
    /// Answer rank requests privately instead of in public chat.
    pub hide_score: bool,
    /// Load per-checkpoint best times together with the player's score.
    pub checkpoint_save: bool,
    pub team_mode: TeamMode,
    pub tick_rate: u32,
    /// Seconds a player must wait after joining and between own votes.
    pub vote_delay_secs: u64,
    /// Seconds between two map votes on the server.
    pub map_vote_delay_secs: u64,
    /// Seconds a process-scoped call may stay unresolved. `None` waits forever.
    pub pending_deadline_secs: Option<u64>,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            map_name: "Tutorial".to_string(),
            server_type: "Novice".to_string(),
            hide_score: false,
            checkpoint_save: true,
            team_mode: TeamMode::Optional,
            tick_rate: 50,
            vote_delay_secs: 3,
            map_vote_delay_secs: 10,
            pending_deadline_secs: Some(300),
        }
    }
}

impl ScoreConfig {
    /// Tick rate, never below one tick per second.
    pub fn ticks_per_sec(&self) -> u32 {
        self.tick_rate.max(1)
    }

    pub fn secs_to_ticks(&self, secs: u64) -> u64 {
        secs * self.ticks_per_sec() as u64
    }

    pub fn vote_delay_ticks(&self) -> u64 {
        self.secs_to_ticks(self.vote_delay_secs)
    }

    pub fn map_vote_delay_ticks(&self) -> u64 {
        self.secs_to_ticks(self.map_vote_delay_secs)
    }

    pub fn process_deadline_ticks(&self) -> Option<u64> {
        self.pending_deadline_secs
            .map(|secs| self.secs_to_ticks(secs))
    }
}
