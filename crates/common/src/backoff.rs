use std::{
    cmp,
    hint,
    thread,
    time::Duration,
};

use rand::Rng;

/// Exponential backoff with jitter for retry loops that may wait a while,
/// e.g. a transaction retrying after an OCC abort.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial_backoff: Duration,
    max_backoff: Duration,
    num_failures: u32,
}

impl Backoff {
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            num_failures: 0,
        }
    }

    pub fn reset(&mut self) {
        self.num_failures = 0;
    }

    pub fn fail(&mut self, rng: &mut impl Rng) -> Duration {
        let p = 2u32.checked_pow(self.num_failures).unwrap_or(u32::MAX);
        self.num_failures += 1;
        let jitter = rng.random::<f32>();
        let backoff = self
            .initial_backoff
            .checked_mul(p)
            .unwrap_or(self.max_backoff);
        cmp::min(backoff, self.max_backoff).mul_f32(jitter)
    }

    pub fn failures(&self) -> u32 {
        self.num_failures
    }
}

/// Bounded spin for waits expected to resolve in tens of nanoseconds
/// (per-record lock bits, version words). Spins with `spin_loop` a growing
/// number of times, then starts yielding the thread.
#[derive(Default)]
pub struct SpinWait {
    counter: u32,
}

const SPIN_LIMIT: u32 = 6;

impl SpinWait {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.counter = 0;
    }

    pub fn spin(&mut self) {
        if self.counter <= SPIN_LIMIT {
            for _ in 0..(1 << self.counter) {
                hint::spin_loop();
            }
            self.counter += 1;
        } else {
            thread::yield_now();
        }
    }
}
