// Error type for the lockstep relay.
//
// Only two kinds of failure are ever returned as `Err`: host contract
// violations (starting twice, readying before setup) and transport or
// serialization failures on the host's own calls. Misbehaving peers never
// produce an `Err`; their messages are logged and dropped so one bad client
// cannot unwind the server. Network and matchmaking failures observed
// asynchronously are wrapped in this type and delivered through the
// `Error` variants of `ServerEvent` / `ClientEvent`.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockstepError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("lockstep already started")]
    AlreadyStarted,
    #[error("lockstep is not running")]
    NotRunning,
    #[error("client has not received its setup yet")]
    NotSetUp,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("join rejected: {0}")]
    Rejected(String),
    #[error("matchmaking error {code}: {message}")]
    Matchmaking { code: i32, message: String },
    #[error("match aborted: {0}")]
    Aborted(String),
}

pub type Result<T> = std::result::Result<T, LockstepError>;
