// Client session: protocol glue around the client lockstep controller.
//
// `ClientSession` turns `ServerMessage`s into `ClientLockstep` calls and
// sends whatever the controller needs back through a `ClientTransport`:
// the `Ping` clock probe after setup, `PlayerReady`, pending commands
// (fresh and retried), `ResyncRequest` on a detected gap, and
// `PlayerFinish`.
//
// Reconnects: once the host called `ready()`, a later `ClientSetup` (after
// a reconnect) re-sends `PlayerReady` automatically with the number of
// turns already confirmed, so the server only replays the missing suffix.
//
// A gap asks for exactly one resync per expected turn; later out-of-order
// messages for the same gap are dropped until the replay fills it.

use lockstep_protocol::config::LockstepConfig;
use lockstep_protocol::message::{ClientMessage, MatchOutcome, ServerMessage};
use lockstep_protocol::turn::Command;
use lockstep_protocol::types::{PlayerId, TurnNumber};
use log::{debug, info, warn};

use crate::client_lockstep::{ClientEvent, ClientLockstep, ClientPhase, Confirmation, Simulation};
use crate::clock::ClockSync;
use crate::error::{LockstepError, Result};
use crate::transport::ClientTransport;

pub struct ClientSession<T: ClientTransport> {
    player_id: PlayerId,
    transport: T,
    lockstep: ClientLockstep,
    clock: ClockSync,
    game_params: Vec<u8>,
    players: Vec<PlayerId>,
    outcome: Option<MatchOutcome>,
    /// Host has asked to join; re-sent automatically after a reconnect.
    joined: bool,
    resync_requested: Option<TurnNumber>,
    events: Vec<ClientEvent>,
}

impl<T: ClientTransport> ClientSession<T> {
    pub fn new(player_id: PlayerId, transport: T) -> Self {
        Self {
            player_id,
            transport,
            lockstep: ClientLockstep::new(),
            clock: ClockSync::default(),
            game_params: Vec::new(),
            players: Vec::new(),
            outcome: None,
            joined: false,
            resync_requested: None,
            events: Vec::new(),
        }
    }

    pub fn player_id(&self) -> &PlayerId {
        &self.player_id
    }

    pub fn lockstep(&self) -> &ClientLockstep {
        &self.lockstep
    }

    pub fn clock_sync(&self) -> &ClockSync {
        &self.clock
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn game_params(&self) -> &[u8] {
        &self.game_params
    }

    /// Player ids ordered by slot, from the last `ClientStart`.
    pub fn players(&self) -> &[PlayerId] {
        &self.players
    }

    pub fn outcome(&self) -> Option<&MatchOutcome> {
        self.outcome.as_ref()
    }

    /// Drain queued events.
    pub fn poll_events(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn on_connected(&mut self) {
        debug!("{} connected", self.player_id);
        self.lockstep.connected();
    }

    pub fn on_disconnected(&mut self) {
        info!(
            "{} disconnected with {} turns confirmed",
            self.player_id,
            self.lockstep.confirmed_turns()
        );
        self.lockstep.disconnected();
        self.resync_requested = None;
    }

    /// Join the match. Only valid once `ClientSetup` has arrived.
    pub fn ready(&mut self) -> Result<()> {
        self.send_ready()?;
        self.joined = true;
        Ok(())
    }

    fn send_ready(&mut self) -> Result<()> {
        self.lockstep.mark_ready()?;
        let ready = ClientMessage::PlayerReady {
            player_id: self.player_id.clone(),
            confirmed_turns: self.lockstep.confirmed_turns(),
        };
        self.transport.send(&ready)
    }

    /// Create a command for the anticipated turn and send it.
    pub fn add_command(&mut self, payload: Vec<u8>) -> Result<Command> {
        let command = self.lockstep.add_command(payload)?;
        self.flush_lockstep_events();
        Ok(command)
    }

    /// Report this player's result. The server ends the match once every
    /// ready player has reported.
    pub fn finish(&mut self, result: Vec<u8>) -> Result<()> {
        if self.lockstep.phase() != ClientPhase::Running {
            return Err(LockstepError::NotRunning);
        }
        self.transport.send(&ClientMessage::PlayerFinish { result })
    }

    /// Advance the local clock and apply due turns to `sim`.
    pub fn update<S: Simulation + ?Sized>(&mut self, dt_ms: u64, sim: &mut S) {
        self.lockstep.update(dt_ms, sim);
        self.flush_lockstep_events();
    }

    pub fn on_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::ClientSetup {
                config,
                game_params,
            } => self.handle_setup(config, game_params),
            ServerMessage::Pong { sent_at, .. } => {
                self.clock
                    .record_round_trip(sent_at, self.transport.now_ms());
                debug!("clock probe: delay {}ms", self.clock.delay_ms());
            }
            ServerMessage::Rejected { reason } => {
                warn!("{} rejected: {reason}", self.player_id);
                self.lockstep.stop();
                self.events
                    .push(ClientEvent::Error(LockstepError::Rejected(reason)));
            }
            ServerMessage::ClientStart {
                player_slot,
                server_timestamp,
                start_timestamp,
                players,
            } => {
                let clock_ms = self.clock.match_clock(server_timestamp, start_timestamp);
                match self.lockstep.start(player_slot, clock_ms) {
                    Ok(()) => {
                        info!(
                            "{} started in slot {} at match time {clock_ms}ms",
                            self.player_id, player_slot.0
                        );
                        self.players = players.clone();
                        self.events.push(ClientEvent::MatchStarted {
                            slot: player_slot,
                            players,
                        });
                    }
                    Err(e) => self.events.push(ClientEvent::Error(e)),
                }
            }
            ServerMessage::Turn { turn } => {
                let confirmation = self.lockstep.confirm_turn(turn);
                self.after_confirmation(confirmation);
            }
            ServerMessage::EmptyTurns { from, count } => {
                let confirmation = self.lockstep.confirm_empty_turns(from, count);
                self.after_confirmation(confirmation);
            }
            ServerMessage::ClientConnectionStatus { player, connected } => {
                self.events
                    .push(ClientEvent::PeerConnection { player, connected });
            }
            ServerMessage::ClientEnd { outcome } => {
                info!("{} match ended: {outcome:?}", self.player_id);
                self.lockstep.stop();
                self.outcome = Some(outcome.clone());
                self.events.push(ClientEvent::MatchEnded(outcome));
            }
        }
        self.flush_lockstep_events();
    }

    fn handle_setup(&mut self, config: LockstepConfig, game_params: Vec<u8>) {
        if let Err(e) = self.lockstep.setup(config) {
            warn!("{} refused setup: {e}", self.player_id);
            self.events.push(ClientEvent::Error(e));
            return;
        }
        self.game_params = game_params.clone();
        let ping = ClientMessage::Ping {
            sent_at: self.transport.now_ms(),
        };
        self.send(&ping);

        if self.joined {
            if let Err(e) = self.send_ready() {
                self.events.push(ClientEvent::Error(e));
            }
        } else {
            self.events
                .push(ClientEvent::SetupReceived { game_params });
        }
    }

    fn after_confirmation(&mut self, confirmation: Confirmation) {
        match confirmation {
            Confirmation::Accepted => self.resync_requested = None,
            Confirmation::Gap { expected } => {
                if self.resync_requested != Some(expected) {
                    self.resync_requested = Some(expected);
                    self.send(&ClientMessage::ResyncRequest { from: expected });
                }
            }
            Confirmation::Duplicate | Confirmation::Ignored => {}
        }
    }

    /// Forward controller events to the host, sending pending commands on
    /// the way.
    fn flush_lockstep_events(&mut self) {
        for event in self.lockstep.poll_events() {
            if let ClientEvent::CommandPending { command, .. } = &event {
                let message = ClientMessage::Command {
                    command: command.clone(),
                };
                self.send(&message);
            }
            self.events.push(event);
        }
    }

    fn send(&mut self, message: &ClientMessage) {
        if let Err(e) = self.transport.send(message) {
            warn!("{} send failed: {e}", self.player_id);
            self.events.push(ClientEvent::Error(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use lockstep_protocol::turn::Turn;
    use lockstep_protocol::types::PlayerSlot;

    use super::*;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Vec<ClientMessage>,
        now: u64,
    }

    impl ClientTransport for RecordingTransport {
        fn send(&mut self, message: &ClientMessage) -> Result<()> {
            self.sent.push(message.clone());
            Ok(())
        }

        fn now_ms(&self) -> u64 {
            self.now
        }
    }

    #[derive(Default)]
    struct CountingSim {
        commands: Vec<Vec<u8>>,
    }

    impl Simulation for CountingSim {
        fn apply_command(&mut self, command: &Command) -> std::result::Result<(), String> {
            self.commands.push(command.payload.clone());
            Ok(())
        }

        fn simulate(&mut self, _step_ms: u32) {}
    }

    fn lockstep_config() -> LockstepConfig {
        LockstepConfig {
            simulation_step_ms: 100,
            command_step_factor: 1,
            ..LockstepConfig::default()
        }
    }

    fn setup() -> ServerMessage {
        ServerMessage::ClientSetup {
            config: lockstep_config(),
            game_params: vec![3, 1, 4],
        }
    }

    fn start(slot: u8, server_timestamp: u64, start_timestamp: u64) -> ServerMessage {
        ServerMessage::ClientStart {
            player_slot: PlayerSlot(slot),
            server_timestamp,
            start_timestamp,
            players: vec!["alice".into(), "bob".into()],
        }
    }

    fn client() -> ClientSession<RecordingTransport> {
        let mut client = ClientSession::new("alice".into(), RecordingTransport::default());
        client.on_connected();
        client
    }

    fn running_client() -> ClientSession<RecordingTransport> {
        let mut client = client();
        client.on_message(setup());
        client.ready().unwrap();
        client.on_message(start(0, 1000, 1000));
        client.transport_mut().sent.clear();
        client.poll_events();
        client
    }

    #[test]
    fn setup_sends_ping_and_waits_for_host() {
        let mut client = client();
        client.transport_mut().now = 77;
        client.on_message(setup());

        assert_eq!(client.game_params(), &[3, 1, 4]);
        assert_eq!(
            client.transport().sent,
            vec![ClientMessage::Ping { sent_at: 77 }]
        );
        assert!(matches!(
            client.poll_events().as_slice(),
            [ClientEvent::SetupReceived { .. }]
        ));

        client.ready().unwrap();
        assert_eq!(
            client.transport().sent.last(),
            Some(&ClientMessage::PlayerReady {
                player_id: "alice".into(),
                confirmed_turns: 0,
            })
        );
    }

    #[test]
    fn ready_before_setup_is_refused() {
        let mut client = client();
        assert!(matches!(client.ready(), Err(LockstepError::NotSetUp)));
        assert!(client.transport().sent.is_empty());
    }

    #[test]
    fn start_clock_corrects_for_measured_delay() {
        let mut client = client();
        client.transport_mut().now = 100;
        client.on_message(setup());
        client.ready().unwrap();
        client.transport_mut().now = 140;
        client.on_message(ServerMessage::Pong {
            sent_at: 100,
            server_timestamp: 9_999,
        });
        assert_eq!(client.clock_sync().delay_ms(), 20);

        client.on_message(start(1, 5_000, 5_500));
        assert_eq!(client.lockstep().clock_ms(), -480);
        assert_eq!(client.lockstep().local_slot(), Some(PlayerSlot(1)));
        assert_eq!(client.players().len(), 2);
    }

    #[test]
    fn commands_are_sent_when_created() {
        let mut client = running_client();
        let command = client.add_command(vec![5]).unwrap();
        assert_eq!(command.turn, TurnNumber(2));
        assert_eq!(
            client.transport().sent,
            vec![ClientMessage::Command { command }]
        );
    }

    #[test]
    fn gap_requests_one_resync() {
        let mut client = running_client();
        client.on_message(ServerMessage::EmptyTurns {
            from: TurnNumber(3),
            count: 2,
        });
        client.on_message(ServerMessage::Turn {
            turn: Turn::empty(TurnNumber(5)),
        });
        assert_eq!(
            client.transport().sent,
            vec![ClientMessage::ResyncRequest {
                from: TurnNumber(0)
            }]
        );

        client.on_message(ServerMessage::EmptyTurns {
            from: TurnNumber(0),
            count: 6,
        });
        assert_eq!(client.lockstep().confirmed_turns(), 6);
    }

    #[test]
    fn confirmed_turns_reach_the_simulation() {
        let mut client = running_client();
        let command = client.add_command(vec![8]).unwrap();
        client.on_message(ServerMessage::EmptyTurns {
            from: TurnNumber(0),
            count: 2,
        });
        client.on_message(ServerMessage::Turn {
            turn: Turn {
                number: TurnNumber(2),
                commands: vec![command],
            },
        });
        let mut sim = CountingSim::default();
        client.update(250, &mut sim);
        assert_eq!(sim.commands, vec![vec![8]]);
        assert_eq!(client.lockstep().pending_commands(), 0);
    }

    #[test]
    fn reconnect_rejoins_with_confirmed_count() {
        let mut client = running_client();
        client.on_message(ServerMessage::EmptyTurns {
            from: TurnNumber(0),
            count: 4,
        });
        client.on_disconnected();
        client.on_connected();
        client.transport_mut().sent.clear();

        client.on_message(setup());
        assert_eq!(
            client.transport().sent.last(),
            Some(&ClientMessage::PlayerReady {
                player_id: "alice".into(),
                confirmed_turns: 4,
            })
        );
        client.on_message(start(0, 3_000, 1_000));
        assert_eq!(client.lockstep().phase(), ClientPhase::Running);
        assert_eq!(client.lockstep().confirmed_turns(), 4);
    }

    #[test]
    fn finish_and_end() {
        let mut client = running_client();
        client.finish(vec![1, 2]).unwrap();
        assert_eq!(
            client.transport().sent,
            vec![ClientMessage::PlayerFinish { result: vec![1, 2] }]
        );

        let outcome = MatchOutcome::Finished {
            result: Some(vec![1, 2]),
        };
        client.on_message(ServerMessage::ClientEnd {
            outcome: outcome.clone(),
        });
        assert_eq!(client.outcome(), Some(&outcome));
        assert_eq!(client.lockstep().phase(), ClientPhase::Stopped);
        assert!(matches!(client.finish(vec![]), Err(LockstepError::NotRunning)));
        assert!(matches!(
            client.add_command(vec![]),
            Err(LockstepError::NotRunning)
        ));
    }

    #[test]
    fn rejection_stops_the_client() {
        let mut client = client();
        client.on_message(setup());
        client.ready().unwrap();
        client.poll_events();
        client.on_message(ServerMessage::Rejected {
            reason: "match is full".into(),
        });
        assert_eq!(client.lockstep().phase(), ClientPhase::Stopped);
        assert!(matches!(
            client.poll_events().as_slice(),
            [ClientEvent::Error(LockstepError::Rejected(_))]
        ));
    }

    #[test]
    fn peer_status_is_forwarded() {
        let mut client = running_client();
        client.on_message(ServerMessage::ClientConnectionStatus {
            player: PlayerSlot(1),
            connected: false,
        });
        assert!(matches!(
            client.poll_events().as_slice(),
            [ClientEvent::PeerConnection {
                player: PlayerSlot(1),
                connected: false
            }]
        ));
    }
}
