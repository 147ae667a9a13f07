// lockstep_protocol — wire protocol and data model for deterministic lockstep.
//
// This crate defines the ids, timing configuration, command/turn data
// model, message enums, and framing shared by the lockstep server and its
// clients (`lockstep_relay`). It has no dependency on any controller or
// transport implementation.
//
// Module overview:
// - `types.rs`:    Id newtypes: `PlayerId`, `PlayerSlot`, `TurnNumber`,
//                  `CommandId`, `ConnectionId`.
// - `config.rs`:   `LockstepConfig`, the immutable timing/anticipation
//                  parameters sent to every client in `ClientSetup`.
// - `turn.rs`:     `Command`, `Turn`, `TurnUpdate` and the empty-turn
//                  `coalesce` / `expand` pair.
// - `message.rs`:  `ClientMessage` / `ServerMessage` plus `MatchOutcome`.
// - `framing.rs`:  4-byte big-endian length prefix + JSON payload over any
//                  `Read`/`Write` stream.
//
// Design decisions:
// - **JSON serialization.** Human-readable on the wire and easy to inspect
//   in logs. Binary framing can be swapped in if bandwidth matters.
// - **Opaque payloads.** Commands, game parameters, and results are
//   `Vec<u8>`; the lockstep layer never interprets them.
// - **No async runtime.** Framing works on blocking `std::io` streams.

pub mod config;
pub mod framing;
pub mod message;
pub mod turn;
pub mod types;

pub use config::LockstepConfig;
pub use framing::{MAX_MESSAGE_SIZE, read_frame, recv_json, send_json, write_frame};
pub use message::{ClientMessage, MatchOutcome, ServerMessage};
pub use turn::{Command, Turn, TurnUpdate, coalesce, expand};
pub use types::{CommandId, ConnectionId, PlayerId, PlayerSlot, TurnNumber};
