// Protocol messages for client-server lockstep communication.
//
// Two enums define the full protocol vocabulary:
// - `ClientMessage`: sent by game clients to the lockstep server.
// - `ServerMessage`: sent by the lockstep server to game clients.
//
// Handshake order: connect → `ClientSetup` → (`Ping`/`Pong`) →
// `PlayerReady` → `ClientStart` + history replay → `Command` / `Turn` /
// `EmptyTurns` during play → `PlayerFinish` → `ClientEnd`.
//
// Command payloads and game parameters are opaque byte vectors. Results are
// opaque too; the server only stores and forwards them.

use serde::{Deserialize, Serialize};

use crate::config::LockstepConfig;
use crate::turn::{Command, Turn, TurnUpdate};
use crate::types::{PlayerId, PlayerSlot, TurnNumber};

/// Messages sent by a client to the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Clock probe; `sent_at` is the client's local time in ms.
    Ping { sent_at: u64 },
    /// Client is set up and wants to join. `confirmed_turns` is the number
    /// of turns it already holds (0 for a fresh join).
    PlayerReady {
        player_id: PlayerId,
        confirmed_turns: u32,
    },
    /// A single pending command.
    Command { command: Command },
    /// Replay the turn stream from `from` after a detected gap.
    ResyncRequest { from: TurnNumber },
    /// Game-defined match result for this player.
    PlayerFinish { result: Vec<u8> },
}

/// Messages sent by the server to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Sent on connect. The client may not send `PlayerReady` before this.
    ClientSetup {
        config: LockstepConfig,
        game_params: Vec<u8>,
    },
    /// Answer to `Ping`.
    Pong { sent_at: u64, server_timestamp: u64 },
    /// The join was refused.
    Rejected { reason: String },
    /// Start (or resume) local execution.
    ClientStart {
        player_slot: PlayerSlot,
        /// Server clock when this message was produced.
        server_timestamp: u64,
        /// Server clock at which turn 0 begins.
        start_timestamp: u64,
        /// Player ids ordered by slot.
        players: Vec<PlayerId>,
    },
    /// One confirmed turn.
    Turn { turn: Turn },
    /// `count` confirmed empty turns starting at `from`.
    EmptyTurns { from: TurnNumber, count: u32 },
    /// A peer disconnected or reconnected.
    ClientConnectionStatus { player: PlayerSlot, connected: bool },
    /// The match is over for this client.
    ClientEnd { outcome: MatchOutcome },
}

impl From<TurnUpdate> for ServerMessage {
    fn from(update: TurnUpdate) -> Self {
        match update {
            TurnUpdate::Turn(turn) => ServerMessage::Turn { turn },
            TurnUpdate::Empty { from, count } => ServerMessage::EmptyTurns { from, count },
        }
    }
}

/// How a match ended from one player's point of view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MatchOutcome {
    /// Normal end. `result` is this player's final result, if it reported
    /// (or was assigned) one.
    Finished { result: Option<Vec<u8>> },
    /// The host or a collaborator aborted the match.
    Aborted { reason: String },
}
