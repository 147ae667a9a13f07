// Optional matchmaking hooks for the server session.
//
// When a `Matchmaker` is installed, the session asks it for match info once
// every expected player is ready and only starts the timeline after the
// host feeds the reply back with `ServerSession::on_match_info`. At the end
// barrier the session submits the collected per-player results and waits
// for `ServerSession::on_match_results` before sending `ClientEnd`.
//
// Both calls are fire-and-forget: the matchmaker service replies
// asynchronously through the host, never through a return value. Failures
// come back through `ServerSession::on_matchmaking_error`.

use lockstep_protocol::types::{PlayerId, PlayerSlot};

/// One player's end-of-match report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayerResult {
    pub slot: PlayerSlot,
    pub player: PlayerId,
    /// Opaque result from `PlayerFinish`; `None` if the player never sent one.
    pub result: Option<Vec<u8>>,
}

pub trait Matchmaker: Send {
    /// Request match info for the ready roster, in slot order.
    fn load_info(&mut self, match_id: &str, players: &[PlayerId]);

    /// Submit the collected results for validation or rating.
    fn submit_results(&mut self, match_id: &str, results: &[PlayerResult]);
}
