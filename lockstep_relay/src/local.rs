// In-process pseudo-client for a player hosted by the server itself.
//
// A listen-server host runs its own `ClientSession` next to the
// `ServerSession`. Both directions are plain queues of typed messages: the
// server queues messages for `ClientEndpoint::Local` in its local inbox,
// and `LocalTransport` queues the client's messages. `pump_local()` moves
// them across until both queues are empty. Nothing is serialized.

use lockstep_protocol::message::ClientMessage;

use crate::client_session::ClientSession;
use crate::clock::MonotonicClock;
use crate::error::Result;
use crate::session::ServerSession;
use crate::transport::{ClientEndpoint, ClientTransport, ServerTransport};

#[derive(Debug, Default)]
pub struct LocalTransport {
    outbox: Vec<ClientMessage>,
    clock: MonotonicClock,
}

impl LocalTransport {
    pub fn take_outgoing(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.outbox)
    }
}

impl ClientTransport for LocalTransport {
    fn send(&mut self, message: &ClientMessage) -> Result<()> {
        self.outbox.push(message.clone());
        Ok(())
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }
}

/// Attach the local client to the server and run the setup exchange.
pub fn connect_local<S: ServerTransport>(
    server: &mut ServerSession<S>,
    client: &mut ClientSession<LocalTransport>,
) {
    client.on_connected();
    server.on_connected(ClientEndpoint::Local);
    pump_local(server, client);
}

/// Deliver queued messages in both directions until nothing is left.
pub fn pump_local<S: ServerTransport>(
    server: &mut ServerSession<S>,
    client: &mut ClientSession<LocalTransport>,
) {
    loop {
        let to_server = client.transport_mut().take_outgoing();
        let to_client = server.take_local_messages();
        if to_server.is_empty() && to_client.is_empty() {
            break;
        }
        for message in to_server {
            server.on_message(ClientEndpoint::Local, message);
        }
        for message in to_client {
            client.on_message(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use lockstep_protocol::config::LockstepConfig;
    use lockstep_protocol::message::{MatchOutcome, ServerMessage};
    use lockstep_protocol::turn::Command;
    use lockstep_protocol::types::{ConnectionId, PlayerSlot};

    use super::*;
    use crate::client_lockstep::{ClientEvent, Simulation};
    use crate::config::ServerConfig;
    use crate::session::MatchPhase;

    /// Server transport for a match with no remote players.
    struct NoRemotes;

    impl ServerTransport for NoRemotes {
        fn send(&mut self, to: ConnectionId, _message: &ServerMessage) -> Result<()> {
            panic!("unexpected send to {to}");
        }

        fn now_ms(&self) -> u64 {
            10_000
        }
    }

    #[derive(Default)]
    struct SumSim {
        total: u32,
        steps: u32,
    }

    impl Simulation for SumSim {
        fn apply_command(&mut self, command: &Command) -> std::result::Result<(), String> {
            self.total += command.payload.iter().map(|b| u32::from(*b)).sum::<u32>();
            Ok(())
        }

        fn simulate(&mut self, _step_ms: u32) {
            self.steps += 1;
        }
    }

    #[test]
    fn local_player_runs_a_whole_match() {
        let config = ServerConfig {
            lockstep: LockstepConfig {
                simulation_step_ms: 100,
                command_step_factor: 1,
                ..LockstepConfig::default()
            },
            max_players: 1,
            start_delay_ms: 0,
            ..ServerConfig::default()
        };
        let mut server = ServerSession::new(config, NoRemotes).unwrap();
        let mut client = ClientSession::new("host".into(), LocalTransport::default());

        connect_local(&mut server, &mut client);
        assert!(matches!(
            client.poll_events().as_slice(),
            [ClientEvent::SetupReceived { .. }]
        ));
        assert!(client.clock_sync().rtt_ms().is_some());

        client.ready().unwrap();
        pump_local(&mut server, &mut client);
        assert_eq!(server.phase(), MatchPhase::Running);
        assert_eq!(client.lockstep().local_slot(), Some(PlayerSlot(0)));

        let command = client.add_command(vec![4, 5]).unwrap();
        assert_eq!(command.turn.0, 2);
        pump_local(&mut server, &mut client);

        server.update(300);
        pump_local(&mut server, &mut client);
        assert_eq!(client.lockstep().confirmed_turns(), 3);

        let mut sim = SumSim::default();
        client.update(300, &mut sim);
        assert_eq!(sim.total, 9);
        assert_eq!(sim.steps, 3);

        client.finish(vec![1]).unwrap();
        pump_local(&mut server, &mut client);
        assert_eq!(server.phase(), MatchPhase::Finished);
        assert_eq!(
            client.outcome(),
            Some(&MatchOutcome::Finished {
                result: Some(vec![1])
            })
        );
    }
}
