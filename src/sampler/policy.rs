//! Restart policy
//!
//! A sampler configured with a sample-count ceiling exits on its own after emitting that
//! many samples; that exit is planned and restarts immediately. Any other exit restarts
//! after an exponential backoff, and too many of those in a short window mark the sampler
//! as flapping.

use crate::config::{RestartConfig, SamplerConfig};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// How a sampler process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    /// Process exited with status 0
    pub success: bool,
    /// Records read from this process
    pub samples: u64,
}

/// What to do after an exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Planned exit at the sample ceiling
    Immediate,
    /// Unexpected exit, restart after `delay`
    Backoff { delay: Duration, flapping: bool },
}

/// Exponential backoff with a ceiling
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Current delay, doubling the one after it
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Counts failures inside a sliding time window
#[derive(Debug, Clone)]
pub struct FlapDetector {
    threshold: usize,
    window: Duration,
    failures: VecDeque<Instant>,
}

impl FlapDetector {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            threshold,
            window,
            failures: VecDeque::new(),
        }
    }

    /// Record a failure and report whether the sampler is now flapping
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.failures.push_back(now);
        self.is_flapping(now)
    }

    pub fn is_flapping(&mut self, now: Instant) -> bool {
        while let Some(&first) = self.failures.front() {
            if now.saturating_duration_since(first) < self.window {
                break;
            }
            self.failures.pop_front();
        }
        self.failures.len() >= self.threshold
    }
}

/// Exit classification plus backoff and flap state
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    max_sample_count: u64,
    backoff: Backoff,
    flaps: FlapDetector,
}

impl RestartPolicy {
    pub fn new(sampler: &SamplerConfig, restart: &RestartConfig) -> Self {
        Self {
            max_sample_count: sampler.max_sample_count,
            backoff: Backoff::new(restart.backoff_initial(), restart.backoff_max()),
            flaps: FlapDetector::new(restart.flap_threshold, restart.flap_window()),
        }
    }

    pub fn decide(&mut self, exit: ExitReport, now: Instant) -> RestartDecision {
        let planned =
            self.max_sample_count > 0 && exit.success && exit.samples >= self.max_sample_count;
        if planned {
            self.backoff.reset();
            return RestartDecision::Immediate;
        }

        // a process that produced data earns a fresh backoff sequence
        if exit.samples > 0 {
            self.backoff.reset();
        }
        RestartDecision::Backoff {
            delay: self.backoff.next_delay(),
            flapping: self.flaps.record_failure(now),
        }
    }

    /// Re-evaluate flapping as failures age out of the window
    pub fn is_flapping(&mut self, now: Instant) -> bool {
        self.flaps.is_flapping(now)
    }
}
