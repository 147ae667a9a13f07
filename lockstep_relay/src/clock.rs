// Clock helpers: a monotonic millisecond clock and one-shot delay estimation.
//
// The server stamps `Pong` and `ClientStart` with its own monotonic clock.
// A client measures the round trip of one `Ping`/`Pong` exchange and uses
// half of it as the one-way delay when converting `ClientStart` into a
// local match time:
//
//   match_clock = server_timestamp + delay - start_timestamp
//
// This is computed once per `ClientStart`; there is no continuous clock
// correction.

use std::time::Instant;

/// Milliseconds since construction.
#[derive(Clone, Copy, Debug)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// Round-trip based delay estimate.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClockSync {
    /// Best (lowest) round trip seen so far.
    rtt_ms: Option<u64>,
}

impl ClockSync {
    /// Record a `Pong` for a `Ping` sent at `sent_at`, received at
    /// `received_at` (both local ms).
    pub fn record_round_trip(&mut self, sent_at: u64, received_at: u64) {
        let rtt = received_at.saturating_sub(sent_at);
        self.rtt_ms = Some(self.rtt_ms.map_or(rtt, |best| best.min(rtt)));
    }

    pub fn rtt_ms(&self) -> Option<u64> {
        self.rtt_ms
    }

    /// Estimated one-way delay; 0 until a round trip was measured.
    pub fn delay_ms(&self) -> u64 {
        self.rtt_ms.map_or(0, |rtt| rtt / 2)
    }

    /// Current match time as seen by this client when a `ClientStart`
    /// stamped `server_timestamp` arrives. Negative while waiting for turn 0.
    pub fn match_clock(&self, server_timestamp: u64, start_timestamp: u64) -> i64 {
        server_timestamp as i64 + self.delay_ms() as i64 - start_timestamp as i64
    }
}
