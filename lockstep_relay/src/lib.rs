// lockstep_relay — deterministic lockstep server and client runtime.
//
// The server orders player commands into a single canonical sequence of
// fixed-duration turns and broadcasts each finalized turn; every client
// applies the same turns, in the same order, to its own deterministic
// simulation. The server never runs the simulation.
//
// Module overview:
// - `server_lockstep.rs`:  Authoritative turn timeline: command admission,
//                          turn finalization, empty-turn coalescing, and
//                          history replay.
// - `client_lockstep.rs`:  Client timeline: in-order confirmation, turn
//                          application to a `Simulation`, anticipation,
//                          stalls, and command retries.
// - `session.rs`:          `ServerSession`: handshake, player slots, start
//                          and end barriers, reconnect replay, and the
//                          optional matchmaker. Driven by `server.rs` or by
//                          an embedding host.
// - `client_session.rs`:   `ClientSession`: the client half of the
//                          handshake around `ClientLockstep`.
// - `transport.rs`:        `ServerTransport` / `ClientTransport` seams and
//                          `ClientEndpoint`.
// - `server.rs`:           TCP listener, reader threads (one per client),
//                          and the main event loop (`start_relay`).
// - `client.rs`:           `NetClient`, the TCP `ClientTransport`.
// - `local.rs`:            In-process pseudo-client for a listen-server
//                          host.
// - `clock.rs`:            Monotonic clock and `Ping`/`Pong` delay estimate.
// - `matchmaking.rs`:      `Matchmaker` hooks and `PlayerResult`.
// - `config.rs`:           `ServerConfig` and `RelayConfig`.
// - `error.rs`:            `LockstepError`.
//
// Dependencies: `lockstep_protocol` (shared message types and framing).
//
// The relay can run as a standalone binary (`main.rs`) or be embedded in a
// game process via the library API (`start_relay`, or a `ServerSession`
// over a custom transport).

pub mod client;
pub mod client_lockstep;
pub mod client_session;
pub mod clock;
pub mod config;
pub mod error;
pub mod local;
pub mod matchmaking;
pub mod server;
pub mod server_lockstep;
pub mod session;
pub mod transport;

pub use client::{NetClient, NetEvent, connect_session};
pub use client_lockstep::{ClientEvent, ClientLockstep, ClientPhase, Confirmation, Simulation};
pub use client_session::ClientSession;
pub use config::{RelayConfig, ServerConfig};
pub use error::{LockstepError, Result};
pub use local::{LocalTransport, connect_local, pump_local};
pub use matchmaking::{Matchmaker, PlayerResult};
pub use server::{RelayHandle, start_relay};
pub use server_lockstep::{Admission, ServerLockstep};
pub use session::{MatchPhase, ServerEvent, ServerSession};
pub use transport::{ClientEndpoint, ClientTransport, ServerTransport};
