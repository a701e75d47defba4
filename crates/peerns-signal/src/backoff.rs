use std::time::Duration;

use rand::Rng;

/// Reconnect backoff: exponential 1s, 2s, 4s, ... capped at 30s, with ±1s of
/// jitter so a fleet of clients does not stampede the service in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    base: Duration,
    cap: Duration,
    jitter: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: Duration::from_secs(1),
        }
    }

    /// Delay before the next attempt, advancing the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32 << self.attempt.min(5))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_ms = self.jitter.as_millis() as i64;
        let offset = rand::thread_rng().gen_range(-jitter_ms..=jitter_ms);
        let ms = (exp.as_millis() as i64 + offset).max(0) as u64;
        Duration::from_millis(ms)
    }

    /// Reset after a successful reconnect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let mut b = Backoff::new();
        let delays: Vec<Duration> = (0..8).map(|_| b.next_delay()).collect();

        // Nominal schedule is 1,2,4,8,16,30,30,30 (±1s jitter each)
        let nominal = [1u64, 2, 4, 8, 16, 30, 30, 30];
        for (d, n) in delays.iter().zip(nominal) {
            let ms = d.as_millis() as i64;
            assert!(
                (ms - (n as i64) * 1000).abs() <= 1000,
                "delay {ms}ms not within 1s of {n}s"
            );
        }
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut b = Backoff::new();
        for _ in 0..6 {
            b.next_delay();
        }
        b.reset();
        let d = b.next_delay().as_millis() as i64;
        assert!((d - 1000).abs() <= 1000, "post-reset delay {d}ms not ~1s");
    }

    #[test]
    fn never_negative() {
        let mut b = Backoff::new();
        for _ in 0..50 {
            // gen_range can draw -1s against a 1s base; must clamp at zero
            let _ = b.next_delay();
        }
    }
}
