// CLI entry point for the dedicated lockstep relay.
//
// Starts a standalone relay that game clients connect to. The relay orders
// commands into turns and broadcasts them; it never runs the game
// simulation. Runs one match, then exits once the match has finished or
// been aborted. See `server.rs` for the networking architecture and
// `session.rs` for the match state.
//
// Logging goes through `env_logger`; set `RUST_LOG` to override the default
// `info` filter.

use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::Parser;
use lockstep_protocol::config::LockstepConfig;
use lockstep_relay::config::{RelayConfig, ServerConfig};
use lockstep_relay::server::start_relay;
use lockstep_relay::session::ServerEvent;

#[derive(Parser)]
#[command(name = "lockstep-relay")]
#[command(about = "Dedicated deterministic lockstep relay")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = 7878)]
    port: u16,

    #[arg(short, long, default_value_t = 2, help = "Players required to start")]
    max_players: u8,

    #[arg(long, default_value_t = 100, help = "Simulation step in ms")]
    step_ms: u32,

    #[arg(long, default_value_t = 1, help = "Simulation steps per turn")]
    command_step_factor: u32,

    #[arg(long, default_value_t = 1000, help = "Delay before turn 0 in ms")]
    start_delay_ms: u32,

    #[arg(long, help = "End the match when any ready player disconnects")]
    finish_on_disconnect: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = RelayConfig {
        bind: args.bind,
        port: args.port,
        server: ServerConfig {
            lockstep: LockstepConfig {
                simulation_step_ms: args.step_ms,
                command_step_factor: args.command_step_factor,
                ..LockstepConfig::default()
            },
            max_players: args.max_players,
            start_delay_ms: args.start_delay_ms,
            finish_on_client_disconnection: args.finish_on_disconnect,
            ..ServerConfig::default()
        },
    };

    let (handle, addr) = match start_relay(config) {
        Ok(result) => result,
        Err(e) => {
            log::error!("failed to start relay: {e}");
            return ExitCode::FAILURE;
        }
    };
    log::info!("waiting for {} players on {addr}", args.max_players);

    loop {
        thread::sleep(Duration::from_millis(100));
        let done = handle.poll_events().into_iter().any(|event| {
            matches!(
                event,
                ServerEvent::MatchFinished { .. } | ServerEvent::MatchAborted { .. }
            )
        });
        if done {
            break;
        }
    }

    // Give the final ClientEnd messages a moment to drain.
    thread::sleep(Duration::from_millis(200));
    handle.stop();
    ExitCode::SUCCESS
}
