//! UDP round-trip latency measurement with kernel software timestamps.
//!
//! A measurer paces 8-byte probes at a fixed cadence toward a mirror,
//! which echoes every datagram back. Both directions are stamped by the
//! kernel: the transmit time is collected off the probe socket's error
//! queue, the receive time arrives as a control message on the reply
//! socket, so neither leg includes userspace scheduling noise. A fixed
//! ring ([`ledger`]) correlates the two stamps by probe identifier, and
//! completed measurements stream through a pipe to a writer thread that
//! renders them ([`roles`]).
//!
//! [`pipeline::run`] drives a whole measurement, either single-threaded
//! on one poll or with one thread per role. The `udplat` binary wraps it
//! in argument parsing and signal handling; `udplat-mirror` is the
//! matching reflector.

pub mod config;
pub mod ledger;
pub mod net;
pub mod pipeline;
pub mod results;
pub mod roles;
pub mod time;

mod trace;

pub use config::{Config, ConfigError, OutputFormat, ResultMode, Strategy};
pub use pipeline::{Outcome, PipelineError, Report, ShutdownToken};
pub use trace::init_tracing;
