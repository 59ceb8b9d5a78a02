//! Latency prober for TCP, TLS, HTTP, DNS, QUIC and ICMP.
//!
//! A [`probe::Probe`] runs one timed round against a target; the
//! [`runner::Runner`] repeats it and aggregates [`stats::Statistics`].

pub mod cli;
pub mod error;
pub mod icmp;
pub mod probe;
pub mod resolver;
pub mod runner;
pub mod stats;

pub use error::{ErrorKind, PingError};
pub use probe::{Detail, PingResult, Probe, Reply};
pub use runner::{RunConfig, Runner};
pub use stats::Statistics;
