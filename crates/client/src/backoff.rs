//! Reconnect delay ladder for the session reader loop.

use std::time::Duration;

/// Upper bound of the randomized tail, in seconds.
const SPREAD_MAX_SECS: u64 = 600;
/// Lower bound of the randomized tail, in seconds.
const SPREAD_MIN_SECS: u64 = 60;

/// Delay schedule applied between reconnect attempts: 0, 1, 2, … 10 seconds
/// in +1 steps, then +10 steps up to 60, then a random value between 60 and
/// 600 seconds to spread reconnect storms across many clients.
///
/// A successfully received message resets the ladder to zero.
#[derive(Debug)]
pub struct ReconnectSchedule {
    delay_secs: u64,
    nonce: u64,
}

impl Default for ReconnectSchedule {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconnectSchedule {
    pub fn new() -> Self {
        Self {
            delay_secs: 0,
            nonce: std::time::UNIX_EPOCH
                .elapsed()
                .map(|d| d.subsec_nanos() as u64)
                .unwrap_or_default(),
        }
    }

    /// Reset the ladder; the next wait returns immediately.
    pub fn reset(&mut self) {
        self.delay_secs = 0;
    }

    /// The delay the next [`wait`](Self::wait) will sleep for.
    pub fn current(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    /// Sleep for the current delay, then advance the ladder.
    pub async fn wait(&mut self) {
        if self.delay_secs > 0 {
            tokio::time::sleep(Duration::from_secs(self.delay_secs)).await;
        }
        self.advance();
    }

    fn advance(&mut self) {
        self.nonce = self.nonce.wrapping_add(1);
        self.delay_secs = if self.delay_secs < 10 {
            self.delay_secs + 1
        } else if self.delay_secs < 60 {
            self.delay_secs + 10
        } else {
            spread(self.nonce)
        };
    }
}

/// Cheap deterministic "random" value in `60..=600` based on a nonce.
/// Not cryptographically secure — just enough to spread reconnect storms.
fn spread(nonce: u64) -> u64 {
    let hash = (nonce as u32).wrapping_mul(2654435761); // Knuth multiplicative hash
    SPREAD_MIN_SECS + (hash as u64) % (SPREAD_MAX_SECS - SPREAD_MIN_SECS + 1)
}
