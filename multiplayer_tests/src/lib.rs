// Test-only game client for lockstep integration tests.
//
// Wraps a real `ClientSession<NetClient>` (from `lockstep_relay`) and a
// small deterministic `TestSim` to provide a synchronous, test-friendly API
// for exercising the full pipeline:
// connect → setup → ready → start → command → turn → simulate → compare.
//
// The only test-specific code here is the blocking polling wrappers
// (loops around `ClientSession::pump_network()` and `update()`) and the
// toy simulation. All networking and lockstep logic uses the same code
// paths as a real game.
//
// See also: `tests/full_pipeline.rs` for the integration test scenarios.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use lockstep_protocol::message::MatchOutcome;
use lockstep_protocol::turn::Command;
use lockstep_relay::client::{NetClient, connect_session};
use lockstep_relay::client_lockstep::{ClientEvent, ClientPhase, Simulation};
use lockstep_relay::client_session::ClientSession;

/// Default timeout for blocking poll operations.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Payload byte marking a command the simulation rejects.
pub const INVALID_COMMAND: u8 = 0xFF;

/// Deterministic toy simulation: a running total moved by commands and a
/// checksum folded over every step.
#[derive(Debug, Default)]
pub struct TestSim {
    pub total: i64,
    pub steps: u64,
    checksum: u64,
    /// Checksum after each simulation step.
    pub history: Vec<u64>,
    pub rejected: usize,
}

impl TestSim {
    fn mix(&mut self, value: u64) {
        self.checksum = self.checksum.wrapping_mul(0x100_0000_01b3).wrapping_add(value);
    }
}

impl Simulation for TestSim {
    fn apply_command(&mut self, command: &Command) -> Result<(), String> {
        match command.payload.first() {
            Some(&INVALID_COMMAND) => {
                self.rejected += 1;
                Err("invalid command".into())
            }
            Some(&delta) => {
                self.total += i64::from(delta);
                self.mix((u64::from(command.player.0) << 8) | u64::from(delta));
                Ok(())
            }
            None => Err("empty payload".into()),
        }
    }

    fn simulate(&mut self, step_ms: u32) {
        self.steps += 1;
        self.mix(u64::from(step_ms) ^ self.total as u64);
        self.history.push(self.checksum);
    }
}

/// A test game client wrapping a real `ClientSession` over TCP.
pub struct TestGameClient {
    addr: String,
    pub session: ClientSession<NetClient>,
    pub sim: TestSim,
    pub events: Vec<ClientEvent>,
    last_update: Instant,
}

impl TestGameClient {
    /// Connect to a relay. The session waits for `ClientSetup`.
    pub fn connect(addr: SocketAddr, name: &str) -> Self {
        let addr = addr.to_string();
        let session = connect_session(&addr, name.into()).expect("connect failed");
        Self {
            addr,
            session,
            sim: TestSim::default(),
            events: Vec::new(),
            last_update: Instant::now(),
        }
    }

    /// Pump the network and advance the local clock by the wall time since
    /// the previous tick.
    pub fn tick(&mut self) {
        self.session.pump_network();
        let elapsed_ms = self.last_update.elapsed().as_millis() as u64;
        if elapsed_ms > 0 {
            self.last_update += Duration::from_millis(elapsed_ms);
            self.session.update(elapsed_ms, &mut self.sim);
        }
        self.events.extend(self.session.poll_events());
    }

    /// Tick until `done` holds, panicking after `POLL_TIMEOUT`.
    pub fn tick_until(&mut self, what: &str, mut done: impl FnMut(&Self) -> bool) {
        let start = Instant::now();
        loop {
            self.tick();
            if done(&*self) {
                return;
            }
            assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn phase(&self) -> ClientPhase {
        self.session.lockstep().phase()
    }

    /// Wait for `ClientSetup`, then send `PlayerReady`.
    pub fn ready(&mut self) {
        self.tick_until("setup", |c| c.phase() == ClientPhase::SetUp);
        self.session.ready().expect("ready failed");
    }

    pub fn wait_for_start(&mut self) {
        self.tick_until("start", |c| c.phase() == ClientPhase::Running);
    }

    /// Queue a command moving the total by `delta`.
    pub fn send_delta(&mut self, delta: u8) -> Command {
        self.session.add_command(vec![delta]).expect("add_command failed")
    }

    /// Tick until at least `turns` turns have been applied.
    pub fn run_turns(&mut self, turns: u32) {
        self.tick_until("turns", |c| c.session.lockstep().applied_turns() >= turns);
    }

    pub fn finish(&mut self, result: Vec<u8>) {
        self.session.finish(result).expect("finish failed");
    }

    pub fn wait_for_end(&mut self) -> MatchOutcome {
        self.tick_until("match end", |c| c.session.outcome().is_some());
        self.session.outcome().cloned().expect("outcome set")
    }

    /// Drop the connection and wait until the session noticed.
    pub fn disconnect(&mut self) {
        self.session.transport_mut().close();
        self.tick_until("disconnect", |c| c.phase() == ClientPhase::Created);
    }

    /// Reconnect to the same relay; the session rejoins on its own.
    pub fn reconnect(&mut self) {
        let addr = self.addr.clone();
        self.session.reconnect(&addr).expect("reconnect failed");
        self.wait_for_start();
    }

    pub fn peer_status_changes(&self) -> Vec<(u8, bool)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ClientEvent::PeerConnection { player, connected } => Some((player.0, *connected)),
                _ => None,
            })
            .collect()
    }
}
