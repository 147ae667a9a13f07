// Command and turn data model.
//
// A `Command` is one player action targeting a specific turn. A `Turn` is
// the server's frozen, canonically ordered set of commands for one turn
// index. Once a turn is confirmed it never changes; every client that
// receives it must reconstruct the same bytes.
//
// `TurnUpdate` is the wire unit for the turn stream. Runs of empty turns
// collapse into a single `Empty { from, count }` entry. `from` makes
// duplicate or overlapping delivery detectable on the client, so replaying
// history to a reconnecting client is idempotent.
//
// `coalesce()` and `expand()` convert between a turn slice and its minimal
// update sequence; `expand(coalesce(turns)) == turns` for every gap-free
// slice.

use serde::{Deserialize, Serialize};

use crate::types::{CommandId, PlayerSlot, TurnNumber};

/// A player-originated action scheduled for a specific turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub turn: TurnNumber,
    pub id: CommandId,
    pub player: PlayerSlot,
    /// Game-defined payload. Never inspected by the lockstep layer.
    pub payload: Vec<u8>,
}

/// One finalized turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub number: TurnNumber,
    pub commands: Vec<Command>,
}

impl Turn {
    pub fn empty(number: TurnNumber) -> Self {
        Self {
            number,
            commands: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// A unit of the confirmed turn stream as sent on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnUpdate {
    Turn(Turn),
    /// `count` consecutive empty turns starting at `from`.
    Empty { from: TurnNumber, count: u32 },
}

impl TurnUpdate {
    pub fn first_turn(&self) -> TurnNumber {
        match self {
            TurnUpdate::Turn(turn) => turn.number,
            TurnUpdate::Empty { from, .. } => *from,
        }
    }

    /// Number of turns this update confirms.
    pub fn turn_count(&self) -> u32 {
        match self {
            TurnUpdate::Turn(_) => 1,
            TurnUpdate::Empty { count, .. } => *count,
        }
    }

    /// Index one past the last turn covered.
    pub fn end_turn(&self) -> TurnNumber {
        self.first_turn().offset(self.turn_count())
    }
}

/// Collapse a gap-free slice of turns into the minimal update sequence.
pub fn coalesce<'a>(turns: impl IntoIterator<Item = &'a Turn>) -> Vec<TurnUpdate> {
    let mut updates = Vec::new();
    let mut run: Option<(TurnNumber, u32)> = None;

    for turn in turns {
        if turn.is_empty() {
            match &mut run {
                Some((_, count)) => *count += 1,
                None => run = Some((turn.number, 1)),
            }
            continue;
        }
        if let Some((from, count)) = run.take() {
            updates.push(TurnUpdate::Empty { from, count });
        }
        updates.push(TurnUpdate::Turn(turn.clone()));
    }
    if let Some((from, count)) = run {
        updates.push(TurnUpdate::Empty { from, count });
    }
    updates
}

/// Rebuild the individual turns described by an update sequence.
pub fn expand<'a>(updates: impl IntoIterator<Item = &'a TurnUpdate>) -> Vec<Turn> {
    let mut turns = Vec::new();
    for update in updates {
        match update {
            TurnUpdate::Turn(turn) => turns.push(turn.clone()),
            TurnUpdate::Empty { from, count } => {
                turns.extend((0..*count).map(|i| Turn::empty(from.offset(i))));
            }
        }
    }
    turns
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(turn: u32, id: u32) -> Command {
        Command {
            turn: TurnNumber(turn),
            id: CommandId(id),
            player: PlayerSlot(0),
            payload: vec![id as u8],
        }
    }

    fn turn_with(number: u32, ids: &[u32]) -> Turn {
        Turn {
            number: TurnNumber(number),
            commands: ids.iter().map(|id| command(number, *id)).collect(),
        }
    }

    #[test]
    fn three_empty_then_full() {
        let turns = vec![
            Turn::empty(TurnNumber(0)),
            Turn::empty(TurnNumber(1)),
            Turn::empty(TurnNumber(2)),
            turn_with(3, &[7]),
        ];
        let updates = coalesce(&turns);
        assert_eq!(
            updates,
            vec![
                TurnUpdate::Empty {
                    from: TurnNumber(0),
                    count: 3
                },
                TurnUpdate::Turn(turn_with(3, &[7])),
            ]
        );

        let rebuilt = expand(&updates);
        assert_eq!(rebuilt.len(), 4);
        assert!(rebuilt[..3].iter().all(Turn::is_empty));
        assert_eq!(rebuilt, turns);
    }

    #[test]
    fn trailing_empty_run_is_kept() {
        let turns = vec![
            turn_with(5, &[1]),
            Turn::empty(TurnNumber(6)),
            Turn::empty(TurnNumber(7)),
        ];
        let updates = coalesce(&turns);
        assert_eq!(updates.len(), 2);
        assert_eq!(
            updates[1],
            TurnUpdate::Empty {
                from: TurnNumber(6),
                count: 2
            }
        );
        assert_eq!(updates[1].end_turn(), TurnNumber(8));
        assert_eq!(expand(&updates), turns);
    }

    #[test]
    fn consecutive_full_turns_stay_separate() {
        let turns = vec![turn_with(0, &[1]), turn_with(1, &[2, 3])];
        let updates = coalesce(&turns);
        assert_eq!(updates.len(), 2);
        assert!(updates.iter().all(|u| matches!(u, TurnUpdate::Turn(_))));
    }

    #[test]
    fn empty_input() {
        assert!(coalesce(&Vec::<Turn>::new()).is_empty());
        assert!(expand(&Vec::<TurnUpdate>::new()).is_empty());
    }
}
