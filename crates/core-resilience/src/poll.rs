//! Generic "retry until ready, error, or bound" loop
//!
//! A `PollLoop` calls a step function repeatedly, sleeping a fixed interval
//! between attempts. The step decides whether it is done (`Poll::Ready`),
//! should be retried (`Poll::Pending`), or must abort (`Err`). Two optional
//! bounds stop the loop: a maximum attempt count and a wall-clock deadline.
//! With neither set, the loop retries forever.

use super::error::PollError;
use std::thread;
use std::time::{Duration, Instant};

/// Outcome of a single poll step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll<T> {
    /// The awaited condition holds; stop with this value
    Ready(T),
    /// Not yet; sleep and try again
    Pending,
}

/// Configuration for poll loop behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    /// Fixed sleep between attempts
    pub interval: Duration,
    /// Maximum number of attempts (None = unbounded)
    pub max_attempts: Option<u64>,
    /// Maximum wall-clock time (None = unbounded)
    pub deadline: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: None,
            deadline: None,
        }
    }
}

impl PollConfig {
    /// Unbounded polling at a fixed interval
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }

    /// Cap the number of attempts
    pub fn with_max_attempts(mut self, max_attempts: Option<u64>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Stop once this much time has elapsed since the loop started
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Fixed-interval retry loop
#[derive(Debug, Clone)]
pub struct PollLoop {
    config: PollConfig,
}

impl PollLoop {
    pub fn new(config: PollConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Run `step` until it is ready, errors, or a bound is hit
    ///
    /// The step receives the zero-based attempt number. The deadline is
    /// checked before every attempt, so a slow step can overrun it by at most
    /// one attempt.
    pub fn run<T, E, F>(&self, mut step: F) -> Result<T, PollError<E>>
    where
        F: FnMut(u64) -> Result<Poll<T>, E>,
    {
        let start = Instant::now();
        let mut attempt: u64 = 0;

        loop {
            if let Some(deadline) = self.config.deadline {
                if attempt > 0 && start.elapsed() >= deadline {
                    return Err(PollError::DeadlineElapsed {
                        deadline,
                        attempts: attempt,
                    });
                }
            }

            match step(attempt).map_err(PollError::Aborted)? {
                Poll::Ready(value) => return Ok(value),
                Poll::Pending => {}
            }

            attempt += 1;

            if let Some(max) = self.config.max_attempts {
                if attempt >= max {
                    return Err(PollError::Exhausted { attempts: attempt });
                }
            }

            if !self.config.interval.is_zero() {
                thread::sleep(self.config.interval);
            }
        }
    }
}
