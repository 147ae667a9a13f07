// End-to-end integration tests for the lockstep pipeline.
//
// Each test starts a real relay server, connects real `ClientSession`s over
// TCP (via `TestGameClient`), and verifies the full path:
// connect → ready → start → command → turn → simulate → identical state.
//
// Clients compare per-step checksum histories over their common prefix,
// since they never apply exactly the same number of turns at the same
// wall-clock moment.

use lockstep_protocol::config::LockstepConfig;
use lockstep_protocol::message::MatchOutcome;
use lockstep_relay::config::{RelayConfig, ServerConfig};
use lockstep_relay::server::{RelayHandle, start_relay};
use multiplayer_tests::{INVALID_COMMAND, TestGameClient};

/// Turn length for tests. Short enough for fast tests, long enough for the
/// relay's tick to finalize turns on time.
const TEST_STEP_MS: u32 = 25;

fn test_config(finish_on_client_disconnection: bool) -> RelayConfig {
    RelayConfig {
        port: 0,
        server: ServerConfig {
            lockstep: LockstepConfig {
                simulation_step_ms: TEST_STEP_MS,
                command_step_factor: 1,
                min_execution_turn_anticipation: 1,
                execution_turn_anticipation: 4,
                max_execution_turn_anticipation: 12,
                max_retries: 5,
            },
            max_players: 2,
            start_delay_ms: 100,
            finish_on_client_disconnection,
            ..ServerConfig::default()
        },
        ..RelayConfig::default()
    }
}

/// Start a relay, connect two clients, and run the handshake to the start.
fn start_match(
    finish_on_client_disconnection: bool,
) -> (RelayHandle, TestGameClient, TestGameClient) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (handle, addr) = start_relay(test_config(finish_on_client_disconnection)).unwrap();

    let mut alice = TestGameClient::connect(addr, "alice");
    let mut bob = TestGameClient::connect(addr, "bob");
    alice.ready();
    bob.ready();
    alice.wait_for_start();
    bob.wait_for_start();
    (handle, alice, bob)
}

fn assert_same_prefix(a: &TestGameClient, b: &TestGameClient) {
    let n = a.sim.history.len().min(b.sim.history.len());
    assert!(n > 0, "no steps simulated");
    assert_eq!(a.sim.history[..n], b.sim.history[..n], "clients diverged");
}

// ---------------------------------------------------------------------------
// Test scenarios
// ---------------------------------------------------------------------------

#[test]
fn commands_reach_every_simulation() {
    let (handle, mut alice, mut bob) = start_match(false);
    assert_ne!(
        alice.session.lockstep().local_slot(),
        bob.session.lockstep().local_slot()
    );
    assert_eq!(alice.session.players().len(), 2);

    alice.send_delta(7);
    bob.send_delta(5);
    alice.send_delta(1);

    alice.tick_until("commands applied", |c| c.sim.total == 13);
    bob.tick_until("commands applied", |c| c.sim.total == 13);
    assert_eq!(alice.session.lockstep().pending_commands(), 0);
    assert_eq!(bob.session.lockstep().pending_commands(), 0);

    let turns = alice
        .session
        .lockstep()
        .applied_turns()
        .max(bob.session.lockstep().applied_turns());
    alice.run_turns(turns);
    bob.run_turns(turns);
    assert_same_prefix(&alice, &bob);
    handle.stop();
}

#[test]
fn rejected_command_is_skipped_identically() {
    let (handle, mut alice, mut bob) = start_match(false);
    alice.send_delta(INVALID_COMMAND);
    alice.send_delta(3);

    alice.tick_until("commands applied", |c| c.sim.total == 3);
    bob.tick_until("commands applied", |c| c.sim.total == 3);
    assert_eq!(alice.sim.rejected, 1);
    assert_eq!(bob.sim.rejected, 1);
    assert_same_prefix(&alice, &bob);
    handle.stop();
}

#[test]
fn reconnecting_player_keeps_slot_and_catches_up() {
    let (handle, mut alice, mut bob) = start_match(false);
    let bob_slot = bob.session.lockstep().local_slot().unwrap();
    bob.run_turns(4);

    bob.disconnect();
    alice.tick_until("peer disconnect notice", |c| {
        c.peer_status_changes().last() == Some(&(bob_slot.0, false))
    });
    alice.send_delta(9);
    alice.tick_until("command applied", |c| c.sim.total == 9);
    let alice_turns = alice.session.lockstep().applied_turns();

    bob.reconnect();
    assert_eq!(bob.session.lockstep().local_slot(), Some(bob_slot));
    bob.run_turns(alice_turns);
    assert_eq!(bob.sim.total, 9);
    assert_same_prefix(&alice, &bob);

    alice.tick_until("peer reconnect notice", |c| {
        c.peer_status_changes().last() == Some(&(bob_slot.0, true))
    });
    handle.stop();
}

#[test]
fn match_ends_when_everyone_finished() {
    let (handle, mut alice, mut bob) = start_match(false);
    alice.run_turns(2);
    alice.finish(b"alice-won".to_vec());
    bob.finish(b"bob-lost".to_vec());

    assert_eq!(
        alice.wait_for_end(),
        MatchOutcome::Finished {
            result: Some(b"alice-won".to_vec())
        }
    );
    assert_eq!(
        bob.wait_for_end(),
        MatchOutcome::Finished {
            result: Some(b"bob-lost".to_vec())
        }
    );
    handle.stop();
}

#[test]
fn disconnect_ends_match_when_configured() {
    let (handle, mut alice, mut bob) = start_match(true);
    alice.run_turns(2);
    bob.disconnect();

    assert_eq!(alice.wait_for_end(), MatchOutcome::Finished { result: None });
    handle.stop();
}

#[test]
fn stopping_the_relay_aborts_the_match() {
    let (handle, mut alice, _bob) = start_match(false);
    handle.stop();
    assert!(matches!(alice.wait_for_end(), MatchOutcome::Aborted { .. }));
}
