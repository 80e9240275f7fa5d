//! Reply collector: validates mirrored probes and completes round trips.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::sync::{Arc, Mutex};

use mio::Interest;
use nix::sys::socket::MsgFlags;

use crate::ledger::{read_probe_id, Ledger};
use crate::net::{Dgram, DgramReader, UdpSocket};
use crate::pipeline::{PipelineError, Role, Stats, Step};
use crate::results::{Record, ResultChannel};
use crate::time::Stamp;
use crate::trace::{debug, trace};

/// Reply datagrams carry the 8-byte probe payload; anything longer is
/// foreign traffic and gets truncated before the identifier check.
const REPLY_CAPACITY: usize = 64;

/// Receives mirrored probes and closes the loop on their measurements.
///
/// A reply only counts when its identifier maps to the slot that still
/// owns it, the slot has its transmit stamp, the slot was not already
/// completed and the round trip fits the latency window. Every rejection
/// is counted by cause.
pub struct ReplyCollector {
    socket: UdpSocket,
    reader: DgramReader,
    ledger: Arc<Ledger>,
    stats: Arc<Stats>,
    /// Immediate-mode sink; deferred mode reports at recycling instead.
    results: Option<Arc<Mutex<ResultChannel>>>,
    boundary: u64,
    max_latency: Stamp,
}

impl ReplyCollector {
    pub fn new(
        socket: UdpSocket,
        ledger: Arc<Ledger>,
        stats: Arc<Stats>,
        results: Option<Arc<Mutex<ResultChannel>>>,
        max_latency: Stamp,
    ) -> Self {
        Self {
            socket,
            reader: DgramReader::new(REPLY_CAPACITY),
            boundary: ledger.id_boundary(),
            ledger,
            stats,
            results,
            max_latency,
        }
    }
}

impl Role for ReplyCollector {
    const NAME: &'static str = "replies";

    fn poll_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }

    fn interest(&self) -> Interest {
        Interest::READABLE
    }

    fn on_ready(&mut self) -> Result<Step, PipelineError> {
        loop {
            let dgram = match self.reader.recv(self.socket.as_raw_fd(), MsgFlags::empty()) {
                Ok(Some(dgram)) => dgram,
                Ok(None) => return Ok(Step::Continue),
                Err(_e) => {
                    debug!(error = ?_e, "reply read failed");
                    return Ok(Step::Continue);
                }
            };

            let Dgram { payload, stamp } = dgram;
            let Some(id) = read_probe_id(payload) else {
                self.stats.short_payload();
                continue;
            };
            if id >= self.boundary {
                self.stats.stale_id();
                continue;
            }
            let Some(recv_ts) = stamp else {
                self.stats.missing_stamp();
                continue;
            };

            let latency = {
                let mut ledger = self.ledger.lock();
                let mut slot = ledger.lookup(id);
                if slot.id() != id {
                    self.stats.stale_id();
                    continue;
                }
                if slot.is_received() {
                    self.stats.duplicate();
                    continue;
                }
                if !slot.is_timestamped() {
                    self.stats.uncorrelated();
                    continue;
                }
                let latency = recv_ts.since(slot.send_ts());
                if self.max_latency < latency {
                    self.stats.expired();
                    continue;
                }
                slot.mark_received(recv_ts);
                latency
            };

            self.stats.round_trip(latency.as_nanos());
            trace!("probe {id} round trip {}.{:09}", latency.sec, latency.nsec);

            if let Some(results) = &self.results {
                results
                    .lock()
                    .expect("result channel poisoned")
                    .insert(Record::new(id, latency))?;
            }
        }
    }
}
