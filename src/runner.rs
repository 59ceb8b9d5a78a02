use std::io::{self, Write};
use std::time::Duration;

use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::PingError;
use crate::probe::{describe, Probe};
use crate::stats::Statistics;

/// How many rounds to run and how far apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunConfig {
    pub count: u64,
    /// Run until interrupted; `count` is ignored.
    pub infinite: bool,
    pub interval: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            count: 4,
            infinite: false,
            interval: Duration::from_secs(1),
        }
    }
}

impl RunConfig {
    fn is_last(&self, round: u64) -> bool {
        !self.infinite && round >= self.count
    }
}

/// Drives a probe round after round and keeps the statistics.
#[derive(Debug)]
pub struct Runner {
    config: RunConfig,
    interrupt: CancellationToken,
}

impl Runner {
    pub fn new(config: RunConfig, interrupt: CancellationToken) -> Self {
        Self { config, interrupt }
    }

    /// Run the configured rounds, writing one line per round and then the
    /// summary to `out`. Round failures end up in the statistics; only a
    /// failing writer is an error.
    pub async fn run(&self, probe: &mut dyn Probe, out: &mut impl Write) -> io::Result<Statistics> {
        let mut stats = Statistics::new();

        // Unreported first round; the address lookup happens here.
        if self.config.infinite || self.config.count > 1 {
            let warmup = tokio::select! {
                _ = self.interrupt.cancelled() => None,
                result = probe.ping() => Some(result),
            };
            match warmup {
                None => return self.finish(stats, out),
                Some(Err(e)) => debug!("warm-up round failed: {}", e),
                Some(Ok(_)) => {}
            }
        }

        let mut round = 0u64;
        while !self.config.is_last(round) {
            if self.interrupt.is_cancelled() {
                break;
            }
            round += 1;

            let cancel = self.interrupt.child_token();
            let result = tokio::select! {
                biased;
                _ = self.interrupt.cancelled() => None,
                result = probe.ping_context(&cancel) => Some(result),
            };
            // A round that saw the child token fire belongs to the interrupt.
            let result = result.filter(|r| !matches!(r, Err(PingError::Cancelled)));
            let Some(result) = result else {
                info!("round {} interrupted", round);
                break;
            };

            writeln!(
                out,
                "{} [{}] {}",
                Local::now().format("%H:%M:%S"),
                round,
                describe(&result)
            )?;
            out.flush()?;
            stats.append(&result);

            if self.config.is_last(round) {
                break;
            }
            let interrupted = tokio::select! {
                _ = self.interrupt.cancelled() => true,
                _ = tokio::time::sleep(self.config.interval) => false,
            };
            if interrupted {
                info!("interrupted while waiting for round {}", round + 1);
                break;
            }
        }

        self.finish(stats, out)
    }

    fn finish(&self, stats: Statistics, out: &mut impl Write) -> io::Result<Statistics> {
        if stats.sent > 0 {
            writeln!(out, "{}", stats)?;
            out.flush()?;
        }
        Ok(stats)
    }
}
