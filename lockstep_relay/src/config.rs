// Server-side configuration.
//
// `ServerConfig` wraps the shared `LockstepConfig` with the settings only
// the server needs: the start/end barriers, empty-turn flushing, command
// validation bounds, and the opaque game parameters forwarded to every
// client in `ClientSetup`. `RelayConfig` adds the TCP listen port for the
// dedicated relay host.

use lockstep_protocol::config::LockstepConfig;
use serde::{Deserialize, Serialize};

use crate::error::{LockstepError, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub lockstep: LockstepConfig,
    /// The match starts once this many players are ready.
    pub max_players: u8,
    /// Delay between the start barrier and turn 0.
    pub start_delay_ms: u32,
    /// End the match as soon as any ready client disconnects.
    pub finish_on_client_disconnection: bool,
    /// A held run of empty turns is flushed once it reaches this length.
    /// Must stay below `max_execution_turn_anticipation`, or idle clients
    /// stall waiting for turns the server is still holding.
    pub max_empty_turn_streak: u32,
    /// Commands targeting more than this many turns past the server's next
    /// turn are treated as malformed.
    pub max_command_lead_turns: u32,
    /// Identifier passed to the matchmaker, if one is installed.
    pub match_id: Option<String>,
    pub game_params: Vec<u8>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            lockstep: LockstepConfig::default(),
            max_players: 2,
            start_delay_ms: 1000,
            finish_on_client_disconnection: false,
            max_empty_turn_streak: 4,
            max_command_lead_turns: 32,
            match_id: None,
            game_params: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        self.lockstep
            .validate()
            .map_err(LockstepError::InvalidConfig)?;
        if self.max_players == 0 {
            return Err(LockstepError::InvalidConfig(
                "max_players must be positive".into(),
            ));
        }
        if self.max_empty_turn_streak == 0 {
            return Err(LockstepError::InvalidConfig(
                "max_empty_turn_streak must be positive".into(),
            ));
        }
        if self.max_empty_turn_streak >= self.lockstep.max_execution_turn_anticipation {
            return Err(LockstepError::InvalidConfig(format!(
                "max_empty_turn_streak ({}) must be below max_execution_turn_anticipation ({})",
                self.max_empty_turn_streak, self.lockstep.max_execution_turn_anticipation
            )));
        }
        Ok(())
    }
}

/// Configuration for the dedicated TCP relay host.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub bind: String,
    /// Listen port; 0 lets the OS pick one.
    pub port: u16,
    pub server: ServerConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 7878,
            server: ServerConfig::default(),
        }
    }
}
