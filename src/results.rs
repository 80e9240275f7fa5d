//! Measurement records and the batched pipe toward the writer.
//!
//! Producers stage [`Record`]s in memory and transfer whole batches
//! through an OS pipe with a single nonblocking write. The pipe is the
//! only coupling between measurement roles and the writer thread: if the
//! writer falls behind and the pipe fills, the batch is dropped and
//! counted as a miss rather than stalling the measurement path.

use std::io;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use rustix::fs::OFlags;
use rustix::pipe::PipeFlags;
use thiserror::Error;

use crate::pipeline::Stats;
use crate::time::Stamp;
use crate::trace::{debug, trace};

/// Bytes per serialized record: identifier, seconds, nanoseconds.
pub const RECORD_SIZE: usize = 24;

/// One measurement headed for the writer.
///
/// A zero latency is the error marker; the writer prints it as a failed
/// probe instead of a duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub id: u64,
    pub latency: Stamp,
}

impl Record {
    #[inline]
    #[must_use]
    pub const fn new(id: u64, latency: Stamp) -> Self {
        Self { id, latency }
    }

    /// Serialized form. Native byte order: the pipe never leaves the host.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[..8].copy_from_slice(&self.id.to_ne_bytes());
        out[8..16].copy_from_slice(&self.latency.sec.to_ne_bytes());
        out[16..].copy_from_slice(&self.latency.nsec.to_ne_bytes());
        out
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8; RECORD_SIZE]) -> Self {
        let mut id = [0u8; 8];
        let mut sec = [0u8; 8];
        let mut nsec = [0u8; 8];
        id.copy_from_slice(&bytes[..8]);
        sec.copy_from_slice(&bytes[8..16]);
        nsec.copy_from_slice(&bytes[16..]);
        Self {
            id: u64::from_ne_bytes(id),
            latency: Stamp::new(i64::from_ne_bytes(sec), i64::from_ne_bytes(nsec)),
        }
    }
}

/// Failures that must stop the run.
#[derive(Debug, Error)]
pub enum ResultError {
    #[error("result pipe write failed: {0}")]
    Pipe(#[from] io::Error),
    #[error("result pipe accepted a torn record ({written} bytes)")]
    TornRecord { written: usize },
}

/// Staging buffer on the producer side of the result pipe.
pub struct ResultChannel {
    staging: Vec<Record>,
    wire: Vec<u8>,
    batch: usize,
    pipe: OwnedFd,
    stats: Arc<Stats>,
}

impl ResultChannel {
    /// `pipe` must be the nonblocking write end from [`result_pipe`].
    #[must_use]
    pub fn new(pipe: OwnedFd, batch: usize, stats: Arc<Stats>) -> Self {
        Self {
            staging: Vec::with_capacity(batch),
            wire: Vec::with_capacity(batch * RECORD_SIZE),
            batch,
            pipe,
            stats,
        }
    }

    /// Stages one record, transferring the batch once it is full.
    ///
    /// # Errors
    ///
    /// Returns an error when the pipe write fails for any reason other
    /// than backpressure.
    pub fn insert(&mut self, record: Record) -> Result<(), ResultError> {
        trace!(id = record.id, staged = self.staging.len() + 1, "result staged");
        self.staging.push(record);
        if self.staging.len() < self.batch {
            return Ok(());
        }
        self.transfer()
    }

    /// Transfers any partially staged batch immediately.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`ResultChannel::insert`].
    pub fn flush(&mut self) -> Result<(), ResultError> {
        if self.staging.is_empty() {
            return Ok(());
        }
        self.transfer()
    }

    fn transfer(&mut self) -> Result<(), ResultError> {
        self.wire.clear();
        for record in &self.staging {
            self.wire.extend_from_slice(&record.to_bytes());
        }
        self.staging.clear();
        match rustix::io::write(&self.pipe, &self.wire) {
            Ok(n) if n == self.wire.len() => {
                debug!(bytes = n, "batch transferred");
                Ok(())
            }
            // Whole records went through; the torn-off tail is dropped.
            Ok(n) if n % RECORD_SIZE == 0 => Ok(()),
            Ok(n) => Err(ResultError::TornRecord { written: n }),
            Err(rustix::io::Errno::AGAIN) => {
                self.stats.result_miss();
                Ok(())
            }
            Err(errno) => Err(ResultError::Pipe(io::Error::from(errno))),
        }
    }
}

/// Creates the result pipe: blocking read end for the writer, nonblocking
/// write end for the producers.
///
/// # Errors
///
/// Returns an error if the pipe cannot be created or flagged.
pub fn result_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let (read_end, write_end) = rustix::pipe::pipe_with(PipeFlags::CLOEXEC)?;
    let flags = rustix::fs::fcntl_getfl(&write_end)?;
    rustix::fs::fcntl_setfl(&write_end, flags | OFlags::NONBLOCK)?;
    Ok((read_end, write_end))
}
