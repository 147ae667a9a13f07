// Server session: connection handling around the server lockstep controller.
//
// `ServerSession` is the central data structure that `server.rs` drives. It
// owns the `ServerLockstep` timeline, the player roster, and the match
// barriers, and turns inbound `ClientMessage`s into outbound
// `ServerMessage`s. All mutation happens through methods called from the
// host's single-threaded loop. No internal locking.
//
// Players live in an arena indexed by `PlayerSlot`. A slot is assigned on
// the first `PlayerReady` for a given `PlayerId` and never reused, so a
// reconnecting player always gets its old slot back. Connections map to
// slots through `endpoints`; a connection that has not sent `PlayerReady`
// maps to `None`.
//
// Handshake per connection:
//   connect → ClientSetup → (Ping → Pong)* → PlayerReady
//     → new id, lobby open, slot free:  assign slot, check start barrier
//     → known id:                       rebind slot, notify peers, and if
//                                       the match is running send
//                                       ClientStart plus history replay
//     → otherwise:                      Rejected
//
// Start barrier: every expected player is ready. With a matchmaker
// installed the session first asks it for match info and waits for
// `on_match_info`; a ready player dropping meanwhile reopens the lobby. End barrier: every ready player has sent
// `PlayerFinish` (and at least one is ready). With
// `finish_on_client_disconnection`, any disconnect of a ready player ends
// the match at once with the results collected so far.
//
// Before a player becomes ready, any held run of empty turns is flushed to
// the players already ready. The newcomer's replay then covers exactly the
// finalized history, so the replay and the live stream never overlap.
//
// Messages for `ClientEndpoint::Local` are queued as typed values and
// drained with `take_local_messages()`; they never touch the transport.
// Misbehaving peers are logged and ignored; host-visible outcomes are
// queued as `ServerEvent`s and drained with `poll_events()`.

use std::collections::HashMap;

use lockstep_protocol::message::{ClientMessage, MatchOutcome, ServerMessage};
use lockstep_protocol::turn::{Command, TurnUpdate};
use lockstep_protocol::types::{PlayerId, PlayerSlot, TurnNumber};
use log::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{LockstepError, Result};
use crate::matchmaking::{Matchmaker, PlayerResult};
use crate::server_lockstep::ServerLockstep;
use crate::transport::{ClientEndpoint, ServerTransport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchPhase {
    /// Collecting ready players.
    Lobby,
    /// Start barrier reached; waiting for the matchmaker's match info.
    AwaitingMatchInfo,
    Running,
    /// End barrier reached; waiting for the matchmaker to accept results.
    AwaitingResults,
    Finished,
}

/// Notifications for the host.
#[derive(Debug)]
pub enum ServerEvent {
    PlayerReady {
        slot: PlayerSlot,
        player: PlayerId,
        reconnected: bool,
    },
    PlayerDisconnected {
        slot: PlayerSlot,
        player: PlayerId,
    },
    PlayerFinished {
        slot: PlayerSlot,
    },
    MatchStarted {
        start_timestamp: u64,
    },
    MatchFinished {
        results: Vec<PlayerResult>,
    },
    MatchAborted {
        reason: String,
    },
    Error(LockstepError),
}

struct PlayerRecord {
    id: PlayerId,
    /// Connection currently bound to this slot; `Some` means ready.
    endpoint: Option<ClientEndpoint>,
    result: Option<Vec<u8>>,
}

pub struct ServerSession<T: ServerTransport> {
    config: ServerConfig,
    transport: T,
    lockstep: ServerLockstep,
    phase: MatchPhase,
    players: Vec<PlayerRecord>,
    slots_by_id: HashMap<PlayerId, PlayerSlot>,
    endpoints: HashMap<ClientEndpoint, Option<PlayerSlot>>,
    start_timestamp: Option<u64>,
    matchmaker: Option<Box<dyn Matchmaker>>,
    match_info: Option<Vec<u8>>,
    local_inbox: Vec<ServerMessage>,
    events: Vec<ServerEvent>,
}

impl<T: ServerTransport> ServerSession<T> {
    pub fn new(config: ServerConfig, transport: T) -> Result<Self> {
        config.validate()?;
        let lockstep = ServerLockstep::new(&config);
        Ok(Self {
            config,
            transport,
            lockstep,
            phase: MatchPhase::Lobby,
            players: Vec::new(),
            slots_by_id: HashMap::new(),
            endpoints: HashMap::new(),
            start_timestamp: None,
            matchmaker: None,
            match_info: None,
            local_inbox: Vec::new(),
            events: Vec::new(),
        })
    }

    /// Install a matchmaker. The match then waits for `on_match_info`
    /// before starting and for `on_match_results` before ending.
    pub fn with_matchmaker(mut self, matchmaker: Box<dyn Matchmaker>) -> Self {
        self.matchmaker = Some(matchmaker);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn phase(&self) -> MatchPhase {
        self.phase
    }

    pub fn lockstep(&self) -> &ServerLockstep {
        &self.lockstep
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Server clock at which turn 0 begins, once the match started.
    pub fn start_timestamp(&self) -> Option<u64> {
        self.start_timestamp
    }

    pub fn match_info(&self) -> Option<&[u8]> {
        self.match_info.as_deref()
    }

    pub fn player_slot(&self, player: &PlayerId) -> Option<PlayerSlot> {
        self.slots_by_id.get(player).copied()
    }

    /// Player ids ordered by slot.
    pub fn roster(&self) -> Vec<PlayerId> {
        self.players.iter().map(|p| p.id.clone()).collect()
    }

    pub fn ready_player_count(&self) -> usize {
        self.players.iter().filter(|p| p.endpoint.is_some()).count()
    }

    pub fn finished_player_count(&self) -> usize {
        self.players
            .iter()
            .filter(|p| p.endpoint.is_some() && p.result.is_some())
            .count()
    }

    /// Drain queued events.
    pub fn poll_events(&mut self) -> Vec<ServerEvent> {
        std::mem::take(&mut self.events)
    }

    /// Drain messages addressed to the local pseudo-client.
    pub fn take_local_messages(&mut self) -> Vec<ServerMessage> {
        std::mem::take(&mut self.local_inbox)
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    pub fn on_connected(&mut self, endpoint: ClientEndpoint) {
        if self.endpoints.contains_key(&endpoint) {
            warn!("{endpoint} connected twice, ignoring");
            return;
        }
        debug!("{endpoint} connected");
        self.endpoints.insert(endpoint, None);
        let setup = ServerMessage::ClientSetup {
            config: self.config.lockstep.clone(),
            game_params: self.config.game_params.clone(),
        };
        self.send(endpoint, &setup);
    }

    pub fn on_disconnected(&mut self, endpoint: ClientEndpoint) {
        let Some(bound) = self.endpoints.remove(&endpoint) else {
            return;
        };
        let Some(slot) = bound else {
            debug!("{endpoint} disconnected before ready");
            return;
        };
        let record = &mut self.players[slot.index()];
        record.endpoint = None;
        let player = record.id.clone();
        self.lockstep.remove_player(slot);
        info!("player {player} (slot {}) disconnected", slot.0);

        self.broadcast(&ServerMessage::ClientConnectionStatus {
            player: slot,
            connected: false,
        });
        self.events
            .push(ServerEvent::PlayerDisconnected { slot, player });

        match self.phase {
            MatchPhase::AwaitingMatchInfo => {
                // The start barrier no longer holds. Any match info already
                // requested is ignored; the barrier asks again once the
                // roster is complete.
                info!("start barrier lost, back to lobby");
                self.phase = MatchPhase::Lobby;
            }
            MatchPhase::Running if self.config.finish_on_client_disconnection => {
                self.end_match();
            }
            MatchPhase::Running => self.check_end_barrier(),
            _ => {}
        }
    }

    pub fn on_message(&mut self, endpoint: ClientEndpoint, message: ClientMessage) {
        if !self.endpoints.contains_key(&endpoint) {
            warn!("message from unknown endpoint {endpoint}, dropping");
            return;
        }
        match message {
            ClientMessage::Ping { sent_at } => {
                let pong = ServerMessage::Pong {
                    sent_at,
                    server_timestamp: self.transport.now_ms(),
                };
                self.send(endpoint, &pong);
            }
            ClientMessage::PlayerReady {
                player_id,
                confirmed_turns,
            } => self.handle_ready(endpoint, player_id, TurnNumber(confirmed_turns)),
            ClientMessage::Command { command } => self.handle_command(endpoint, command),
            ClientMessage::ResyncRequest { from } => self.handle_resync(endpoint, from),
            ClientMessage::PlayerFinish { result } => self.handle_finish(endpoint, result),
        }
    }

    /// Advance the match clock and broadcast newly confirmed turns.
    pub fn update(&mut self, dt_ms: u64) {
        let updates = self.lockstep.update(dt_ms);
        self.broadcast_updates(updates);
    }

    /// Abort the match and tell every ready client.
    pub fn fail(&mut self, reason: &str) {
        if self.phase == MatchPhase::Finished {
            return;
        }
        let updates = self.lockstep.stop();
        self.broadcast_updates(updates);
        self.phase = MatchPhase::Finished;
        warn!("match aborted: {reason}");
        self.broadcast(&ServerMessage::ClientEnd {
            outcome: MatchOutcome::Aborted {
                reason: reason.to_owned(),
            },
        });
        self.events.push(ServerEvent::MatchAborted {
            reason: reason.to_owned(),
        });
    }

    // -----------------------------------------------------------------------
    // Matchmaker replies
    // -----------------------------------------------------------------------

    pub fn on_match_info(&mut self, info: Vec<u8>) {
        if self.phase != MatchPhase::AwaitingMatchInfo {
            warn!("unexpected match info in phase {:?}", self.phase);
            return;
        }
        self.match_info = Some(info);
        self.start_match();
    }

    pub fn on_match_results(&mut self, results: Vec<PlayerResult>) {
        if self.phase != MatchPhase::AwaitingResults {
            warn!("unexpected match results in phase {:?}", self.phase);
            return;
        }
        self.finish_with(results);
    }

    /// Surface a matchmaker failure. The host decides whether to `fail()`.
    pub fn on_matchmaking_error(&mut self, code: i32, message: String) {
        warn!("matchmaking error {code}: {message}");
        self.events
            .push(ServerEvent::Error(LockstepError::Matchmaking { code, message }));
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    fn ready_slot(&self, endpoint: ClientEndpoint) -> Option<PlayerSlot> {
        self.endpoints.get(&endpoint).copied().flatten()
    }

    fn handle_ready(&mut self, endpoint: ClientEndpoint, player_id: PlayerId, from: TurnNumber) {
        if let Some(slot) = self.ready_slot(endpoint) {
            debug!("{endpoint} already ready as slot {}, ignoring", slot.0);
            return;
        }
        if self.phase == MatchPhase::Finished {
            self.reject(endpoint, "match is over");
            return;
        }

        let (slot, reconnected) = match self.slots_by_id.get(&player_id) {
            Some(&slot) => {
                if let Some(previous) = self.players[slot.index()].endpoint {
                    warn!("player {player_id} moved from {previous} to {endpoint}");
                    self.endpoints.insert(previous, None);
                }
                (slot, true)
            }
            None => {
                if self.phase != MatchPhase::Lobby {
                    self.reject(endpoint, "match already started");
                    return;
                }
                if self.players.len() >= usize::from(self.config.max_players) {
                    self.reject(endpoint, "match is full");
                    return;
                }
                let slot = PlayerSlot(self.players.len() as u8);
                self.players.push(PlayerRecord {
                    id: player_id.clone(),
                    endpoint: None,
                    result: None,
                });
                self.slots_by_id.insert(player_id.clone(), slot);
                (slot, false)
            }
        };

        self.flush_empty_turns(None);
        if reconnected {
            self.broadcast(&ServerMessage::ClientConnectionStatus {
                player: slot,
                connected: true,
            });
        }

        self.players[slot.index()].endpoint = Some(endpoint);
        self.endpoints.insert(endpoint, Some(slot));
        self.lockstep.add_player(slot);
        info!(
            "player {player_id} ready in slot {} via {endpoint}{}",
            slot.0,
            if reconnected { " (reconnect)" } else { "" }
        );
        self.events.push(ServerEvent::PlayerReady {
            slot,
            player: player_id,
            reconnected,
        });

        if self.start_timestamp.is_some() {
            self.send_start(slot);
            self.replay(endpoint, from);
        } else {
            self.check_start_barrier();
        }
    }

    fn handle_command(&mut self, endpoint: ClientEndpoint, command: Command) {
        let Some(slot) = self.ready_slot(endpoint) else {
            debug!("command from {endpoint} before ready, dropping");
            return;
        };
        if command.player != slot {
            warn!(
                "{endpoint} (slot {}) sent a command for slot {}, dropping",
                slot.0, command.player.0
            );
            return;
        }
        self.lockstep.add_command(command);
    }

    fn handle_resync(&mut self, endpoint: ClientEndpoint, from: TurnNumber) {
        let Some(slot) = self.ready_slot(endpoint) else {
            debug!("resync from {endpoint} before ready, dropping");
            return;
        };
        debug!("resync for slot {} from turn {from}", slot.0);
        self.flush_empty_turns(Some(slot));
        self.replay(endpoint, from);
    }

    fn handle_finish(&mut self, endpoint: ClientEndpoint, result: Vec<u8>) {
        let Some(slot) = self.ready_slot(endpoint) else {
            debug!("finish from {endpoint} before ready, dropping");
            return;
        };
        if self.phase != MatchPhase::Running {
            debug!("finish from slot {} in phase {:?}, dropping", slot.0, self.phase);
            return;
        }
        let record = &mut self.players[slot.index()];
        if record.result.is_some() {
            debug!("slot {} finished twice, keeping the first result", slot.0);
            return;
        }
        record.result = Some(result);
        info!("slot {} finished", slot.0);
        self.events.push(ServerEvent::PlayerFinished { slot });
        self.check_end_barrier();
    }

    fn reject(&mut self, endpoint: ClientEndpoint, reason: &str) {
        info!("rejecting {endpoint}: {reason}");
        self.send(
            endpoint,
            &ServerMessage::Rejected {
                reason: reason.to_owned(),
            },
        );
    }

    // -----------------------------------------------------------------------
    // Barriers
    // -----------------------------------------------------------------------

    fn check_start_barrier(&mut self) {
        if self.phase != MatchPhase::Lobby
            || self.ready_player_count() < usize::from(self.config.max_players)
        {
            return;
        }
        let roster = self.roster();
        if let Some(matchmaker) = self.matchmaker.as_mut() {
            let match_id = self.config.match_id.as_deref().unwrap_or_default();
            info!("all {} players ready, loading match info", roster.len());
            self.phase = MatchPhase::AwaitingMatchInfo;
            matchmaker.load_info(match_id, &roster);
            return;
        }
        self.start_match();
    }

    fn start_match(&mut self) {
        if let Err(e) = self.lockstep.start(self.config.start_delay_ms) {
            self.events.push(ServerEvent::Error(e));
            return;
        }
        let start_timestamp = self.transport.now_ms() + u64::from(self.config.start_delay_ms);
        self.start_timestamp = Some(start_timestamp);
        self.phase = MatchPhase::Running;
        info!(
            "match started with {} players, turn 0 at {start_timestamp}ms",
            self.players.len()
        );
        self.events
            .push(ServerEvent::MatchStarted { start_timestamp });

        for slot in self.ready_slots() {
            self.send_start(slot);
        }
    }

    fn check_end_barrier(&mut self) {
        if self.phase != MatchPhase::Running {
            return;
        }
        let ready = self.ready_player_count();
        if ready > 0 && self.finished_player_count() == ready {
            self.end_match();
        }
    }

    fn end_match(&mut self) {
        let updates = self.lockstep.stop();
        self.broadcast_updates(updates);

        let results: Vec<PlayerResult> = self
            .players
            .iter()
            .enumerate()
            .map(|(i, p)| PlayerResult {
                slot: PlayerSlot(i as u8),
                player: p.id.clone(),
                result: p.result.clone(),
            })
            .collect();
        info!(
            "match ended after {} turns, {} of {} players reported",
            self.lockstep.turn_count(),
            results.iter().filter(|r| r.result.is_some()).count(),
            results.len()
        );

        if let Some(matchmaker) = self.matchmaker.as_mut() {
            let match_id = self.config.match_id.as_deref().unwrap_or_default();
            self.phase = MatchPhase::AwaitingResults;
            matchmaker.submit_results(match_id, &results);
            return;
        }
        self.finish_with(results);
    }

    fn finish_with(&mut self, results: Vec<PlayerResult>) {
        self.phase = MatchPhase::Finished;
        for slot in self.ready_slots() {
            let Some(endpoint) = self.players[slot.index()].endpoint else {
                continue;
            };
            let result = results
                .iter()
                .find(|r| r.slot == slot)
                .and_then(|r| r.result.clone());
            self.send(
                endpoint,
                &ServerMessage::ClientEnd {
                    outcome: MatchOutcome::Finished { result },
                },
            );
        }
        self.events.push(ServerEvent::MatchFinished { results });
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    fn ready_slots(&self) -> Vec<PlayerSlot> {
        self.players
            .iter()
            .enumerate()
            .filter(|(_, p)| p.endpoint.is_some())
            .map(|(i, _)| PlayerSlot(i as u8))
            .collect()
    }

    fn send_start(&mut self, slot: PlayerSlot) {
        let (Some(start_timestamp), Some(endpoint)) =
            (self.start_timestamp, self.players[slot.index()].endpoint)
        else {
            return;
        };
        let start = ServerMessage::ClientStart {
            player_slot: slot,
            server_timestamp: self.transport.now_ms(),
            start_timestamp,
            players: self.roster(),
        };
        self.send(endpoint, &start);
    }

    fn replay(&mut self, endpoint: ClientEndpoint, from: TurnNumber) {
        for update in self.lockstep.replay_from(from) {
            self.send(endpoint, &update.into());
        }
    }

    fn flush_empty_turns(&mut self, except: Option<PlayerSlot>) {
        if let Some(update) = self.lockstep.flush_empty_turns() {
            self.broadcast_except(&update.into(), except);
        }
    }

    fn broadcast_updates(&mut self, updates: Vec<TurnUpdate>) {
        for update in updates {
            self.broadcast(&update.into());
        }
    }

    fn broadcast(&mut self, message: &ServerMessage) {
        self.broadcast_except(message, None);
    }

    fn broadcast_except(&mut self, message: &ServerMessage, except: Option<PlayerSlot>) {
        for slot in self.ready_slots() {
            if Some(slot) == except {
                continue;
            }
            if let Some(endpoint) = self.players[slot.index()].endpoint {
                self.send(endpoint, message);
            }
        }
    }

    fn send(&mut self, endpoint: ClientEndpoint, message: &ServerMessage) {
        match endpoint {
            ClientEndpoint::Local => self.local_inbox.push(message.clone()),
            ClientEndpoint::Remote(conn) => {
                if let Err(e) = self.transport.send(conn, message) {
                    warn!("send to {conn} failed: {e}");
                    self.events.push(ServerEvent::Error(e));
                }
            }
        }
    }
}
