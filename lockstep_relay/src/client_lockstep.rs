// Client lockstep controller: consumes the confirmed turn stream in order.
//
// `ClientLockstep` keeps a private copy of the confirmed turns, applies
// them to the local deterministic `Simulation` once the local clock has
// reached each turn's start, and turns local input into commands tagged
// with the anticipated execution turn.
//
// Phases: Created → AwaitingSetup → SetUp → ReadySent → Running → Stopped.
// A disconnect while not stopped drops back to Created but keeps every
// confirmed turn, so a reconnect only needs the missing suffix replayed.
//
// Ordering: `confirm_turn` / `confirm_empty_turns` accept only the next
// expected index. Earlier indices are duplicates (at-least-once delivery)
// and are ignored; later ones are gaps, reported as `Confirmation::Gap` so
// the session can request a resync. Nothing is ever resequenced.
//
// Anticipation, with `d` the turn duration and
// `lag = clock_turn - confirmed_turns`:
// - New commands target `clock_turn + execution_turn_anticipation` (never
//   below the next unconfirmed turn).
// - `lag >= max_execution_turn_anticipation` freezes the local clock until
//   confirmations catch up.
// - Commands are flagged `at_risk` while the clock is stalled, or when
//   their target leads the server's known cutoff
//   (`max(clock_turn, confirmed_turns)`) by less than
//   `min_execution_turn_anticipation`.
// - An own command missing from its confirmed target turn was dropped by
//   the server; it is re-targeted and re-sent with the same id up to
//   `max_retries` times.
//
// Events are queued and drained by the owner with `poll_events()`.

use std::collections::VecDeque;

use lockstep_protocol::config::LockstepConfig;
use lockstep_protocol::message::MatchOutcome;
use lockstep_protocol::turn::{Command, Turn};
use lockstep_protocol::types::{CommandId, PlayerId, PlayerSlot, TurnNumber};
use log::{debug, trace, warn};

use crate::error::{LockstepError, Result};

/// The game's deterministic simulation, driven one turn at a time.
pub trait Simulation {
    /// Apply one confirmed command. An `Err` marks the command invalid; the
    /// turn continues with the remaining commands.
    fn apply_command(&mut self, command: &Command) -> std::result::Result<(), String>;

    /// Advance by one fixed simulation step.
    fn simulate(&mut self, step_ms: u32);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClientPhase {
    Created,
    AwaitingSetup,
    SetUp,
    ReadySent,
    Running,
    Stopped,
}

/// Result of offering a confirmed turn (or run of empty turns).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Confirmation {
    Accepted,
    Duplicate,
    /// Delivered turn is ahead of `expected`; one or more turns are missing.
    Gap { expected: TurnNumber },
    /// The client is stopped.
    Ignored,
}

/// Notifications for the host and the client session.
#[derive(Debug)]
pub enum ClientEvent {
    /// `ClientSetup` arrived; the host may send `PlayerReady` once the game
    /// is loaded.
    SetupReceived { game_params: Vec<u8> },
    /// A command must be sent to the server (new or retried).
    CommandPending { command: Command, at_risk: bool },
    /// The simulation advanced by exactly this turn.
    TurnApplied { turn: TurnNumber, commands: usize },
    /// The simulation rejected a confirmed command.
    CommandFailed {
        turn: TurnNumber,
        command: CommandId,
        player: PlayerSlot,
        reason: String,
    },
    /// An own command was not accepted within `max_retries` re-sends.
    CommandDropped { command: CommandId },
    MatchStarted {
        slot: PlayerSlot,
        players: Vec<PlayerId>,
    },
    PeerConnection { player: PlayerSlot, connected: bool },
    MatchEnded(MatchOutcome),
    Error(LockstepError),
}

#[derive(Clone, Debug)]
struct PendingCommand {
    command: Command,
    retries: u32,
}

pub struct ClientLockstep {
    config: LockstepConfig,
    phase: ClientPhase,
    local_slot: Option<PlayerSlot>,
    clock_ms: i64,
    stalled: bool,
    /// Confirmed turns not yet applied, in index order.
    confirmed: VecDeque<Turn>,
    confirmed_count: u32,
    applied_count: u32,
    pending: Vec<PendingCommand>,
    next_command_id: u32,
    events: Vec<ClientEvent>,
}

impl Default for ClientLockstep {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientLockstep {
    pub fn new() -> Self {
        Self {
            config: LockstepConfig::default(),
            phase: ClientPhase::Created,
            local_slot: None,
            clock_ms: 0,
            stalled: false,
            confirmed: VecDeque::new(),
            confirmed_count: 0,
            applied_count: 0,
            pending: Vec::new(),
            next_command_id: 0,
            events: Vec::new(),
        }
    }

    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    pub fn config(&self) -> &LockstepConfig {
        &self.config
    }

    pub fn local_slot(&self) -> Option<PlayerSlot> {
        self.local_slot
    }

    /// Number of turns confirmed so far (the next expected index).
    pub fn confirmed_turns(&self) -> u32 {
        self.confirmed_count
    }

    pub fn applied_turns(&self) -> u32 {
        self.applied_count
    }

    /// Local match clock in ms; negative before turn 0 starts.
    pub fn clock_ms(&self) -> i64 {
        self.clock_ms
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// Own commands sent but not yet seen in a confirmed turn.
    pub fn pending_commands(&self) -> usize {
        self.pending.len()
    }

    /// Drain queued events.
    pub fn poll_events(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.events)
    }

    /// The transport connected (or reconnected).
    pub fn connected(&mut self) {
        if self.phase != ClientPhase::Stopped {
            self.phase = ClientPhase::AwaitingSetup;
        }
    }

    /// The transport dropped. Confirmed turns are kept for the reconnect.
    pub fn disconnected(&mut self) {
        if self.phase != ClientPhase::Stopped {
            self.phase = ClientPhase::Created;
            self.stalled = false;
        }
    }

    /// Store the server's configuration.
    pub fn setup(&mut self, config: LockstepConfig) -> Result<()> {
        if self.phase == ClientPhase::Stopped {
            return Err(LockstepError::NotRunning);
        }
        config.validate().map_err(LockstepError::InvalidConfig)?;
        self.config = config;
        self.phase = ClientPhase::SetUp;
        Ok(())
    }

    /// Record that `PlayerReady` went out.
    pub fn mark_ready(&mut self) -> Result<()> {
        match self.phase {
            ClientPhase::SetUp => {
                self.phase = ClientPhase::ReadySent;
                Ok(())
            }
            ClientPhase::Stopped => Err(LockstepError::NotRunning),
            _ => Err(LockstepError::NotSetUp),
        }
    }

    /// Begin executing. `clock_ms` is the current match time as seen by
    /// this client (already corrected for transport delay); negative values
    /// delay turn 0.
    pub fn start(&mut self, local_slot: PlayerSlot, clock_ms: i64) -> Result<()> {
        match self.phase {
            ClientPhase::ReadySent => {}
            ClientPhase::Running => return Err(LockstepError::AlreadyStarted),
            ClientPhase::Stopped => return Err(LockstepError::NotRunning),
            _ => return Err(LockstepError::NotSetUp),
        }
        self.phase = ClientPhase::Running;
        self.local_slot = Some(local_slot);
        self.clock_ms = clock_ms;
        self.stalled = false;
        debug!("client started as {local_slot:?} at match time {clock_ms}ms");
        Ok(())
    }

    pub fn stop(&mut self) {
        self.phase = ClientPhase::Stopped;
        self.pending.clear();
        self.stalled = false;
    }

    fn turn_ms(&self) -> i64 {
        self.config.turn_duration_ms() as i64
    }

    /// Turn the local clock is currently in (0 before the match starts).
    pub fn clock_turn(&self) -> TurnNumber {
        TurnNumber((self.clock_ms.max(0) / self.turn_ms()) as u32)
    }

    /// How many turns the local clock runs ahead of the confirmed stream.
    pub fn lag(&self) -> i64 {
        i64::from(self.clock_turn().0) - i64::from(self.confirmed_count)
    }

    /// Turn a command created now would target.
    pub fn anticipated_turn(&self) -> TurnNumber {
        let target = self
            .clock_turn()
            .offset(self.config.execution_turn_anticipation);
        target.max(TurnNumber(self.confirmed_count))
    }

    /// The server has finalized at least `confirmed_turns` turns and, with
    /// synced clocks, every turn before `clock_turn`. A command whose target
    /// leads that cutoff by less than `min_execution_turn_anticipation`, or
    /// one created while the clock is stalled, is likely to arrive late.
    /// Unconfirmed lag alone is not a risk: the server holds back runs of
    /// empty turns.
    fn at_risk(&self) -> bool {
        let cutoff = self.clock_turn().max(TurnNumber(self.confirmed_count));
        let lead = i64::from(self.anticipated_turn().0) - i64::from(cutoff.0);
        self.stalled || lead < i64::from(self.config.min_execution_turn_anticipation)
    }

    /// Create a local command for the anticipated turn and queue it for
    /// sending.
    pub fn add_command(&mut self, payload: Vec<u8>) -> Result<Command> {
        if self.phase != ClientPhase::Running {
            return Err(LockstepError::NotRunning);
        }
        let player = self.local_slot.ok_or(LockstepError::NotSetUp)?;
        let command = Command {
            turn: self.anticipated_turn(),
            id: CommandId(self.next_command_id),
            player,
            payload,
        };
        self.next_command_id += 1;

        let at_risk = self.at_risk();
        if at_risk {
            debug!(
                "command {:?} for turn {} is at risk (lag {})",
                command.id,
                command.turn,
                self.lag()
            );
        }
        self.pending.push(PendingCommand {
            command: command.clone(),
            retries: 0,
        });
        self.events.push(ClientEvent::CommandPending {
            command: command.clone(),
            at_risk,
        });
        Ok(command)
    }

    /// Offer one confirmed turn.
    pub fn confirm_turn(&mut self, turn: Turn) -> Confirmation {
        if self.phase == ClientPhase::Stopped {
            return Confirmation::Ignored;
        }
        let expected = TurnNumber(self.confirmed_count);
        if turn.number < expected {
            trace!("duplicate turn {}", turn.number);
            return Confirmation::Duplicate;
        }
        if turn.number > expected {
            warn!("turn {} delivered, expected {expected}", turn.number);
            return Confirmation::Gap { expected };
        }
        self.push_confirmed(turn);
        Confirmation::Accepted
    }

    /// Offer `count` confirmed empty turns starting at `from`. A run that
    /// partially overlaps what is already confirmed contributes its new
    /// suffix.
    pub fn confirm_empty_turns(&mut self, from: TurnNumber, count: u32) -> Confirmation {
        if self.phase == ClientPhase::Stopped {
            return Confirmation::Ignored;
        }
        let expected = TurnNumber(self.confirmed_count);
        if from > expected {
            warn!("empty turns from {from} delivered, expected {expected}");
            return Confirmation::Gap { expected };
        }
        let end = from.offset(count);
        if end <= expected {
            trace!("duplicate empty turns {from}..{end}");
            return Confirmation::Duplicate;
        }
        for n in expected.0..end.0 {
            self.push_confirmed(Turn::empty(TurnNumber(n)));
        }
        Confirmation::Accepted
    }

    fn push_confirmed(&mut self, turn: Turn) {
        let number = turn.number;
        if let Some(slot) = self.local_slot {
            for command in turn.commands.iter().filter(|c| c.player == slot) {
                self.pending.retain(|p| p.command.id != command.id);
            }
        }
        self.confirmed.push_back(turn);
        self.confirmed_count += 1;
        self.retry_missed(number);
    }

    /// Re-send own commands whose target turn is confirmed without them.
    fn retry_missed(&mut self, confirmed: TurnNumber) {
        if !self.pending.iter().any(|p| p.command.turn <= confirmed) {
            return;
        }
        let retarget = self.anticipated_turn();
        let at_risk = self.at_risk();
        let max_retries = self.config.max_retries;
        let mut kept = Vec::with_capacity(self.pending.len());

        for mut pending in std::mem::take(&mut self.pending) {
            if pending.command.turn > confirmed {
                kept.push(pending);
                continue;
            }
            if pending.retries >= max_retries {
                warn!(
                    "command {:?} dropped after {} retries",
                    pending.command.id, pending.retries
                );
                self.events.push(ClientEvent::CommandDropped {
                    command: pending.command.id,
                });
                continue;
            }
            pending.retries += 1;
            pending.command.turn = retarget;
            debug!(
                "retrying command {:?} for turn {retarget} (attempt {})",
                pending.command.id, pending.retries
            );
            self.events.push(ClientEvent::CommandPending {
                command: pending.command.clone(),
                at_risk,
            });
            kept.push(pending);
        }
        self.pending = kept;
    }

    /// Advance the local clock by `dt_ms` (subject to the anticipation
    /// stall) and apply every confirmed turn whose start time has passed.
    pub fn update<S: Simulation + ?Sized>(&mut self, dt_ms: u64, sim: &mut S) {
        if self.phase != ClientPhase::Running {
            return;
        }
        let turn_ms = self.turn_ms();
        let limit = (i64::from(self.confirmed_count)
            + i64::from(self.config.max_execution_turn_anticipation)
            + 1)
            * turn_ms
            - 1;
        let wanted = self.clock_ms.saturating_add(dt_ms as i64);
        self.stalled = wanted > limit;
        if self.stalled {
            trace!("clock stalled at lag {}", self.lag());
        }
        self.clock_ms = self.clock_ms.max(wanted.min(limit));

        while let Some(turn) = self.confirmed.front() {
            if self.clock_ms < i64::from(turn.number.0) * turn_ms {
                break;
            }
            if let Some(turn) = self.confirmed.pop_front() {
                self.apply_turn(turn, sim);
            }
        }
    }

    fn apply_turn<S: Simulation + ?Sized>(&mut self, turn: Turn, sim: &mut S) {
        for command in &turn.commands {
            if let Err(reason) = sim.apply_command(command) {
                warn!(
                    "command {:?} from {:?} failed in turn {}: {reason}",
                    command.id, command.player, turn.number
                );
                self.events.push(ClientEvent::CommandFailed {
                    turn: turn.number,
                    command: command.id,
                    player: command.player,
                    reason,
                });
            }
        }
        for _ in 0..self.config.command_step_factor {
            sim.simulate(self.config.simulation_step_ms);
        }
        self.applied_count += 1;
        self.events.push(ClientEvent::TurnApplied {
            turn: turn.number,
            commands: turn.commands.len(),
        });
    }
}
