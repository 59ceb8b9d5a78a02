use std::fmt;

use crate::probe::PingResult;

/// Aggregate of the rounds of one run. Latencies are whole milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
    pub sent: u64,
    pub ok: u64,
    pub failed: u64,
    pub min: u64,
    pub max: u64,
    pub total: u64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, result: &PingResult) {
        self.sent += 1;
        match result {
            Ok(reply) => self.add_sample(reply.millis()),
            Err(_) => self.failed += 1,
        }
    }

    fn add_sample(&mut self, ms: u64) {
        if self.ok == 0 || ms < self.min {
            self.min = ms;
        }
        if ms > self.max {
            self.max = ms;
        }
        self.total += ms;
        self.ok += 1;
    }

    /// Mean latency truncated to whole milliseconds.
    pub fn average(&self) -> u64 {
        if self.ok == 0 {
            0
        } else {
            self.total / self.ok
        }
    }

    /// Whole percent of rounds that failed.
    pub fn failure_percent(&self) -> u64 {
        if self.sent == 0 {
            0
        } else {
            100 * self.failed / self.sent
        }
    }

    /// At least one round ran and none failed.
    pub fn is_clean(&self) -> bool {
        self.sent > 0 && self.failed == 0
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\n\tsent = {}, ok = {}, failed = {} ({}%)",
            self.sent,
            self.ok,
            self.failed,
            self.failure_percent()
        )?;
        if self.ok > 0 {
            write!(
                f,
                "\n\tmin = {} ms, max = {} ms, avg = {} ms",
                self.min,
                self.max,
                self.average()
            )?;
        }
        Ok(())
    }
}
