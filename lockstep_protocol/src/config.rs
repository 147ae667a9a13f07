// Lockstep timing configuration shared from server to every client.
//
// The server sends one `LockstepConfig` inside `ClientSetup` and both sides
// derive all turn timing from it. It is immutable for the lifetime of a
// match.
//
// Timing model: a turn lasts `simulation_step_ms * command_step_factor`
// milliseconds. Commands are collected per turn; the simulation advances in
// `command_step_factor` fixed steps per turn.
//
// Anticipation: a client tags new commands with
// `clock_turn + execution_turn_anticipation`. If its clock runs
// `max_execution_turn_anticipation` turns ahead of the confirmed stream it
// stalls; if the remaining margin drops below
// `min_execution_turn_anticipation` new commands are flagged as at risk of
// arriving after the server has finalized their turn.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockstepConfig {
    /// Duration of one deterministic simulation step.
    pub simulation_step_ms: u32,
    /// Simulation steps per command turn.
    pub command_step_factor: u32,
    pub min_execution_turn_anticipation: u32,
    /// Target anticipation used when tagging new commands.
    pub execution_turn_anticipation: u32,
    pub max_execution_turn_anticipation: u32,
    /// How many times a client re-sends a command the server dropped.
    pub max_retries: u32,
}

impl Default for LockstepConfig {
    fn default() -> Self {
        Self {
            simulation_step_ms: 100,
            command_step_factor: 1,
            min_execution_turn_anticipation: 1,
            execution_turn_anticipation: 2,
            max_execution_turn_anticipation: 10,
            max_retries: 3,
        }
    }
}

impl LockstepConfig {
    /// Milliseconds covered by one turn.
    pub fn turn_duration_ms(&self) -> u64 {
        u64::from(self.simulation_step_ms) * u64::from(self.command_step_factor)
    }

    /// Check internal consistency. Returns a description of the first
    /// problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.simulation_step_ms == 0 {
            return Err("simulation_step_ms must be positive".into());
        }
        if self.command_step_factor == 0 {
            return Err("command_step_factor must be positive".into());
        }
        if self.min_execution_turn_anticipation > self.execution_turn_anticipation {
            return Err(format!(
                "min anticipation {} exceeds target {}",
                self.min_execution_turn_anticipation, self.execution_turn_anticipation
            ));
        }
        if self.execution_turn_anticipation > self.max_execution_turn_anticipation {
            return Err(format!(
                "target anticipation {} exceeds max {}",
                self.execution_turn_anticipation, self.max_execution_turn_anticipation
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = LockstepConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.turn_duration_ms(), 100);
    }

    #[test]
    fn turn_duration_scales_with_factor() {
        let config = LockstepConfig {
            simulation_step_ms: 33,
            command_step_factor: 3,
            ..LockstepConfig::default()
        };
        assert_eq!(config.turn_duration_ms(), 99);
    }

    #[test]
    fn rejects_zero_step() {
        let config = LockstepConfig {
            simulation_step_ms: 0,
            ..LockstepConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_anticipation() {
        let config = LockstepConfig {
            min_execution_turn_anticipation: 5,
            execution_turn_anticipation: 2,
            ..LockstepConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.contains("min anticipation"), "{err}");

        let config = LockstepConfig {
            execution_turn_anticipation: 12,
            max_execution_turn_anticipation: 10,
            ..LockstepConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
