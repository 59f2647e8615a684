//! Bandwidth limiter for replica pushes.
//!
//! [`Throttle`] keeps background replication from starving client writes.
//! It tracks a theoretical arrival time (TAT): every push moves the TAT
//! forward by the time its bytes take at the configured rate, and a push may
//! start once the TAT is less than one burst window ahead of now. This is the
//! token bucket expressed as a single timestamp.

use std::sync::{Arc, Mutex};

use tokio::time::{Duration, Instant};
use tracing::debug;

/// How far ahead of the clock reservations may run before callers wait.
const BURST_WINDOW: Duration = Duration::from_secs(1);

/// Rate limiter shared by all pushes of one replicator.
pub struct Throttle {
    /// Bytes per second. Zero disables limiting.
    bytes_per_sec: u64,
    tat: Mutex<Instant>,
}

impl Throttle {
    /// A throttle admitting `bytes_per_sec`, with one second of burst.
    pub fn new(bytes_per_sec: u64) -> Arc<Self> {
        Arc::new(Self {
            bytes_per_sec,
            tat: Mutex::new(Instant::now()),
        })
    }

    /// The configured rate in bytes per second.
    pub fn rate(&self) -> u64 {
        self.bytes_per_sec
    }

    /// Reserve `bytes` and sleep until the reservation is due.
    ///
    /// Returns how long the caller waited. A request larger than the burst
    /// window costs one full window, so a single big replica never blocks
    /// forever.
    pub async fn acquire(&self, bytes: u64) -> Duration {
        let Some(ready_at) = self.reserve(bytes, true) else {
            return Duration::ZERO;
        };
        let now = Instant::now();
        if ready_at <= now {
            return Duration::ZERO;
        }
        let wait = ready_at - now;
        debug!(wait_ms = wait.as_millis() as u64, bytes, "replication throttled");
        tokio::time::sleep_until(ready_at).await;
        wait
    }

    /// Reserve `bytes` only if that needs no waiting.
    pub fn try_acquire(&self, bytes: u64) -> bool {
        match self.reserve(bytes, false) {
            None => true,
            Some(ready_at) => ready_at <= Instant::now(),
        }
    }

    /// Move the TAT forward and return when the reservation may proceed.
    ///
    /// With `force == false` the TAT is left alone if the caller would have
    /// to wait. `None` means the throttle is disabled.
    fn reserve(&self, bytes: u64, force: bool) -> Option<Instant> {
        if self.bytes_per_sec == 0 {
            return None;
        }
        let cost = self.cost(bytes);
        let now = Instant::now();
        let mut tat = self.tat.lock().expect("throttle lock poisoned");
        let next = (*tat).max(now) + cost;
        let ready_at = next.checked_sub(BURST_WINDOW).unwrap_or(now);
        if force || ready_at <= now {
            *tat = next;
        }
        Some(ready_at)
    }

    fn cost(&self, bytes: u64) -> Duration {
        let secs = bytes as f64 / self.bytes_per_sec as f64;
        Duration::from_secs_f64(secs).min(BURST_WINDOW)
    }
}
