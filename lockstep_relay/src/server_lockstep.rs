// Server lockstep controller: the canonical turn timeline of a match.
//
// `ServerLockstep` owns the authoritative, append-only turn history. It
// collects commands from active players, advances a match clock on every
// `update(dt)`, and finalizes one turn each time the clock crosses a turn
// boundary. Finalized turns are returned as `TurnUpdate`s for the session to
// broadcast; runs of empty turns are held back and coalesced into one
// `TurnUpdate::Empty` until a non-empty turn, the streak limit, an explicit
// flush (new client, resync), or `stop()` releases them.
//
// Timing: turn `t` covers match time `[t*d, (t+1)*d)` and is finalized once
// the clock reaches `(t+1)*d`. `start(delay)` sets the clock to `-delay` so
// turn 0 begins `delay` ms after the start barrier.
//
// Command admission never fails loudly. Commands from inactive slots, for
// finalized turns, too far in the future, or repeated `(slot, id)` pairs are
// dropped with a `debug!` line and an `Admission` value the caller may
// ignore. Accepted commands are sorted by `(slot, id)` when their turn is
// finalized, so every client sees the same order.
//
// No internal locking: the session calls every method from its single
// event loop.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use lockstep_protocol::config::LockstepConfig;
use lockstep_protocol::turn::{Command, Turn, TurnUpdate, coalesce};
use lockstep_protocol::types::{CommandId, PlayerSlot, TurnNumber};
use log::{debug, trace};

use crate::config::ServerConfig;
use crate::error::{LockstepError, Result};

/// What `add_command` did with a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Scheduled,
    NotRunning,
    UnknownPlayer,
    /// The target turn has already been finalized.
    TurnFinalized,
    TooFarAhead,
    Duplicate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TimelineState {
    Idle,
    Running,
    Stopped,
}

pub struct ServerLockstep {
    config: LockstepConfig,
    max_empty_turn_streak: u32,
    max_command_lead_turns: u32,
    state: TimelineState,
    clock_ms: i64,
    history: Vec<Turn>,
    scheduled: BTreeMap<TurnNumber, Vec<Command>>,
    seen: HashSet<(PlayerSlot, CommandId)>,
    active: BTreeSet<PlayerSlot>,
    /// Held run of empty turns: (first turn, count).
    empty_run: Option<(TurnNumber, u32)>,
}

impl ServerLockstep {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            config: config.lockstep.clone(),
            max_empty_turn_streak: config.max_empty_turn_streak.max(1),
            max_command_lead_turns: config.max_command_lead_turns,
            state: TimelineState::Idle,
            clock_ms: 0,
            history: Vec::new(),
            scheduled: BTreeMap::new(),
            seen: HashSet::new(),
            active: BTreeSet::new(),
            empty_run: None,
        }
    }

    pub fn config(&self) -> &LockstepConfig {
        &self.config
    }

    /// Allow commands from `slot`.
    pub fn add_player(&mut self, slot: PlayerSlot) {
        self.active.insert(slot);
    }

    /// Stop accepting commands from `slot`. Already scheduled commands stay.
    pub fn remove_player(&mut self, slot: PlayerSlot) {
        self.active.remove(&slot);
    }

    pub fn is_active(&self, slot: PlayerSlot) -> bool {
        self.active.contains(&slot)
    }

    pub fn is_running(&self) -> bool {
        self.state == TimelineState::Running
    }

    pub fn is_stopped(&self) -> bool {
        self.state == TimelineState::Stopped
    }

    /// Match clock in ms; negative during the start delay.
    pub fn clock_ms(&self) -> i64 {
        self.clock_ms
    }

    /// The next turn to be finalized. Commands for earlier turns are dropped.
    pub fn next_turn(&self) -> TurnNumber {
        TurnNumber(self.history.len() as u32)
    }

    /// Number of finalized turns.
    pub fn turn_count(&self) -> u32 {
        self.history.len() as u32
    }

    /// Begin advancing the timeline. Turn 0 starts `start_delay_ms` from now.
    pub fn start(&mut self, start_delay_ms: u32) -> Result<()> {
        if self.state != TimelineState::Idle {
            return Err(LockstepError::AlreadyStarted);
        }
        self.state = TimelineState::Running;
        self.clock_ms = -i64::from(start_delay_ms);
        debug!("lockstep timeline started, turn 0 in {start_delay_ms}ms");
        Ok(())
    }

    /// Stop advancing. History stays available for replay. Returns the
    /// flushed empty-turn run, if one was held.
    pub fn stop(&mut self) -> Vec<TurnUpdate> {
        if self.state == TimelineState::Stopped {
            return Vec::new();
        }
        self.state = TimelineState::Stopped;
        self.scheduled.clear();
        debug!("lockstep timeline stopped after {} turns", self.history.len());
        self.flush_empty_turns().into_iter().collect()
    }

    /// Schedule a command into its target turn.
    pub fn add_command(&mut self, command: Command) -> Admission {
        let admission = self.admit(&command);
        if admission == Admission::Scheduled {
            trace!(
                "scheduled command {:?} from {:?} for turn {}",
                command.id, command.player, command.turn
            );
            self.seen.insert((command.player, command.id));
            self.scheduled.entry(command.turn).or_default().push(command);
        } else {
            debug!(
                "dropped command {:?} from {:?} for turn {}: {admission:?}",
                command.id, command.player, command.turn
            );
        }
        admission
    }

    fn admit(&self, command: &Command) -> Admission {
        if self.state != TimelineState::Running {
            return Admission::NotRunning;
        }
        if !self.active.contains(&command.player) {
            return Admission::UnknownPlayer;
        }
        let next = self.next_turn();
        if command.turn < next {
            return Admission::TurnFinalized;
        }
        if command.turn > next.offset(self.max_command_lead_turns) {
            return Admission::TooFarAhead;
        }
        if self.seen.contains(&(command.player, command.id)) {
            return Admission::Duplicate;
        }
        Admission::Scheduled
    }

    /// Advance the match clock by `dt_ms` and finalize every turn whose
    /// window has closed. Returns the updates to broadcast, in order.
    pub fn update(&mut self, dt_ms: u64) -> Vec<TurnUpdate> {
        let mut updates = Vec::new();
        if self.state != TimelineState::Running {
            return updates;
        }
        self.clock_ms = self.clock_ms.saturating_add(dt_ms as i64);
        let turn_ms = self.config.turn_duration_ms() as i64;
        while self.clock_ms >= (i64::from(self.next_turn().0) + 1) * turn_ms {
            self.finalize_turn(&mut updates);
        }
        updates
    }

    fn finalize_turn(&mut self, updates: &mut Vec<TurnUpdate>) {
        let number = self.next_turn();
        let mut commands = self.scheduled.remove(&number).unwrap_or_default();
        commands.sort_by_key(|c| (c.player, c.id));
        let turn = Turn { number, commands };

        if turn.is_empty() {
            let count = match &mut self.empty_run {
                Some((_, count)) => {
                    *count += 1;
                    *count
                }
                None => {
                    self.empty_run = Some((number, 1));
                    1
                }
            };
            if count >= self.max_empty_turn_streak {
                updates.extend(self.flush_empty_turns());
            }
        } else {
            trace!("turn {number} finalized with {} commands", turn.commands.len());
            updates.extend(self.flush_empty_turns());
            updates.push(TurnUpdate::Turn(turn.clone()));
        }
        self.history.push(turn);
    }

    /// Release the held empty-turn run, if any.
    pub fn flush_empty_turns(&mut self) -> Option<TurnUpdate> {
        self.empty_run
            .take()
            .map(|(from, count)| TurnUpdate::Empty { from, count })
    }

    /// Lazily iterate finalized turns from `from` onward. The iterator is
    /// `Clone`, so it can be restarted from the same point.
    pub fn turns_from(&self, from: TurnNumber) -> impl Iterator<Item = &Turn> + Clone {
        self.history.get(from.0 as usize..).unwrap_or(&[]).iter()
    }

    /// Coalesced history from `from`, ready to send to one client. Flush any
    /// held empty run first so the replay and the live stream do not overlap.
    pub fn replay_from(&self, from: TurnNumber) -> Vec<TurnUpdate> {
        coalesce(self.turns_from(from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> ServerLockstep {
        let config = ServerConfig {
            lockstep: LockstepConfig {
                simulation_step_ms: 100,
                command_step_factor: 1,
                ..LockstepConfig::default()
            },
            max_empty_turn_streak: 10,
            max_command_lead_turns: 8,
            ..ServerConfig::default()
        };
        let mut server = ServerLockstep::new(&config);
        server.add_player(PlayerSlot(0));
        server.add_player(PlayerSlot(1));
        server
    }

    fn command(player: u8, id: u32, turn: u32) -> Command {
        Command {
            turn: TurnNumber(turn),
            id: CommandId(id),
            player: PlayerSlot(player),
            payload: vec![player, id as u8],
        }
    }

    #[test]
    fn start_twice_is_a_contract_violation() {
        let mut server = server();
        server.start(0).unwrap();
        assert!(matches!(server.start(0), Err(LockstepError::AlreadyStarted)));
    }

    #[test]
    fn no_turns_before_start_or_during_delay() {
        let mut server = server();
        assert!(server.update(1000).is_empty());
        assert_eq!(server.turn_count(), 0);

        server.start(250).unwrap();
        server.update(300);
        assert_eq!(server.turn_count(), 0, "clock is at 50ms, turn 0 still open");
        server.update(50);
        assert_eq!(server.turn_count(), 1);
    }

    #[test]
    fn commands_rejected_before_start() {
        let mut server = server();
        assert_eq!(server.add_command(command(0, 0, 1)), Admission::NotRunning);
    }

    #[test]
    fn command_attaches_to_its_turn_exactly_once() {
        let mut server = server();
        server.start(0).unwrap();
        assert_eq!(server.add_command(command(0, 0, 2)), Admission::Scheduled);
        assert_eq!(server.add_command(command(0, 0, 2)), Admission::Duplicate);

        let updates = server.update(300);
        let turns: Vec<&Turn> = server.turns_from(TurnNumber(0)).collect();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[2].commands, vec![command(0, 0, 2)]);

        assert_eq!(
            updates,
            vec![
                TurnUpdate::Empty {
                    from: TurnNumber(0),
                    count: 2
                },
                TurnUpdate::Turn(turns[2].clone()),
            ]
        );
    }

    #[test]
    fn command_for_finalized_turn_is_dropped() {
        let mut server = server();
        server.start(0).unwrap();
        server.update(300);
        assert_eq!(server.next_turn(), TurnNumber(3));
        assert_eq!(
            server.add_command(command(0, 0, 2)),
            Admission::TurnFinalized
        );
        server.update(500);
        assert!(server.turns_from(TurnNumber(0)).all(Turn::is_empty));
    }

    #[test]
    fn unknown_or_removed_player_dropped() {
        let mut server = server();
        server.start(0).unwrap();
        assert_eq!(
            server.add_command(command(5, 0, 1)),
            Admission::UnknownPlayer
        );
        server.remove_player(PlayerSlot(1));
        assert_eq!(
            server.add_command(command(1, 0, 1)),
            Admission::UnknownPlayer
        );
    }

    #[test]
    fn command_too_far_ahead_dropped() {
        let mut server = server();
        server.start(0).unwrap();
        assert_eq!(server.add_command(command(0, 0, 8)), Admission::Scheduled);
        assert_eq!(
            server.add_command(command(0, 1, 9)),
            Admission::TooFarAhead
        );
    }

    #[test]
    fn turn_contents_sorted_by_slot_then_id() {
        let mut server = server();
        server.start(0).unwrap();
        server.add_command(command(1, 0, 0));
        server.add_command(command(0, 3, 0));
        server.add_command(command(0, 1, 0));
        let updates = server.update(100);
        let TurnUpdate::Turn(turn) = &updates[0] else {
            panic!("expected a full turn, got {updates:?}");
        };
        let order: Vec<(u8, u32)> = turn.commands.iter().map(|c| (c.player.0, c.id.0)).collect();
        assert_eq!(order, vec![(0, 1), (0, 3), (1, 0)]);
    }

    #[test]
    fn empty_run_held_across_updates() {
        let mut server = server();
        server.start(0).unwrap();
        assert!(server.update(100).is_empty());
        assert!(server.update(100).is_empty());
        assert!(server.update(100).is_empty());
        server.add_command(command(0, 0, 3));
        let updates = server.update(100);
        assert_eq!(updates.len(), 2);
        assert_eq!(
            updates[0],
            TurnUpdate::Empty {
                from: TurnNumber(0),
                count: 3
            }
        );
        assert!(matches!(&updates[1], TurnUpdate::Turn(t) if t.number == TurnNumber(3)));
    }

    #[test]
    fn empty_run_flushed_at_streak_limit() {
        let config = ServerConfig {
            max_empty_turn_streak: 3,
            ..ServerConfig::default()
        };
        let mut server = ServerLockstep::new(&config);
        server.start(0).unwrap();
        let turn_ms = config.lockstep.turn_duration_ms();
        let updates = server.update(turn_ms * 7);
        assert_eq!(
            updates,
            vec![
                TurnUpdate::Empty {
                    from: TurnNumber(0),
                    count: 3
                },
                TurnUpdate::Empty {
                    from: TurnNumber(3),
                    count: 3
                },
            ]
        );
        assert_eq!(
            server.flush_empty_turns(),
            Some(TurnUpdate::Empty {
                from: TurnNumber(6),
                count: 1
            })
        );
        assert_eq!(server.flush_empty_turns(), None);
    }

    #[test]
    fn stop_flushes_and_keeps_history() {
        let mut server = server();
        server.start(0).unwrap();
        server.update(200);
        let flushed = server.stop();
        assert_eq!(
            flushed,
            vec![TurnUpdate::Empty {
                from: TurnNumber(0),
                count: 2
            }]
        );
        assert!(server.update(1000).is_empty());
        assert_eq!(server.turns_from(TurnNumber(0)).count(), 2);
        assert!(server.stop().is_empty());
        assert!(matches!(server.start(0), Err(LockstepError::AlreadyStarted)));
    }

    #[test]
    fn replay_is_restartable_and_matches_history() {
        let mut server = server();
        server.start(0).unwrap();
        server.add_command(command(0, 0, 1));
        server.add_command(command(1, 0, 4));
        server.update(600);

        let iter = server.turns_from(TurnNumber(2));
        let first: Vec<TurnNumber> = iter.clone().map(|t| t.number).collect();
        let second: Vec<TurnNumber> = iter.map(|t| t.number).collect();
        assert_eq!(first, second);
        assert_eq!(first.first(), Some(&TurnNumber(2)));
        assert_eq!(first.len(), 4);

        let replay = server.replay_from(TurnNumber(0));
        let rebuilt = lockstep_protocol::turn::expand(&replay);
        let history: Vec<Turn> = server.turns_from(TurnNumber(0)).cloned().collect();
        assert_eq!(rebuilt, history);

        assert_eq!(server.turns_from(TurnNumber(99)).count(), 0);
    }
}
