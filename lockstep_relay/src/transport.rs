// Transport seams between the sessions and the network.
//
// The sessions never touch sockets. `ServerSession` writes through a
// `ServerTransport` keyed by `ConnectionId`; `ClientSession` writes through
// a `ClientTransport`. Inbound traffic is pushed into the sessions by the
// host (`on_connected` / `on_message` / `on_disconnected`), so the same
// session code runs over TCP (`server.rs`, `client.rs`), over the in-process
// local queue (`local.rs`), or over a test double.
//
// A server-side peer is a `ClientEndpoint`: either a remote connection or
// the single local pseudo-client hosted in the server process. Messages to
// the local endpoint never reach the transport; the session queues them
// as typed values.

use std::fmt;

use lockstep_protocol::message::{ClientMessage, ServerMessage};
use lockstep_protocol::types::ConnectionId;

use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClientEndpoint {
    /// The player running inside the server process.
    Local,
    Remote(ConnectionId),
}

impl fmt::Display for ClientEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientEndpoint::Local => write!(f, "local"),
            ClientEndpoint::Remote(conn) => write!(f, "{conn}"),
        }
    }
}

pub trait ServerTransport {
    /// Deliver one message to a remote connection. Errors are reported
    /// back to the host as events; the connection's own reader notices the
    /// broken link and reports the disconnect.
    fn send(&mut self, to: ConnectionId, message: &ServerMessage) -> Result<()>;

    /// Server clock in ms, used for `Pong` and `ClientStart` stamps.
    fn now_ms(&self) -> u64;
}

pub trait ClientTransport {
    fn send(&mut self, message: &ClientMessage) -> Result<()>;

    /// Local clock in ms, used for `Ping` round trips.
    fn now_ms(&self) -> u64;
}
