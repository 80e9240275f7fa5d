//! Transmit-stamp collector: drains the probe socket's error queue.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::sync::Arc;

use mio::Interest;
use nix::sys::socket::MsgFlags;

use crate::ledger::{read_probe_id, Ledger};
use crate::net::{Dgram, DgramReader, UdpSocket};
use crate::pipeline::{PipelineError, Role, Stats, Step};
use crate::trace::{debug, trace};

/// Bytes of link, IP and UDP headers ahead of the probe payload in a
/// looped-back frame (14 + 20 + 8, IPv4 without options).
const LOOPBACK_HEADER_LEN: usize = 42;

/// Largest looped-back frame worth keeping: the headers plus the probe
/// payload.
const FRAME_CAPACITY: usize = LOOPBACK_HEADER_LEN + 8;

/// Matches kernel transmit timestamps back to their ledger slots.
///
/// The kernel queues a copy of each timestamped frame on the probe
/// socket's error queue; the payload inside still carries the probe
/// identifier, which is all the correlation needed.
pub struct Stamper {
    socket: Arc<UdpSocket>,
    reader: DgramReader,
    ledger: Arc<Ledger>,
    stats: Arc<Stats>,
}

impl Stamper {
    pub fn new(socket: Arc<UdpSocket>, ledger: Arc<Ledger>, stats: Arc<Stats>) -> Self {
        Self {
            socket,
            reader: DgramReader::new(FRAME_CAPACITY),
            ledger,
            stats,
        }
    }
}

impl Role for Stamper {
    const NAME: &'static str = "stamper";

    fn poll_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }

    fn interest(&self) -> Interest {
        Interest::PRIORITY
    }

    fn on_ready(&mut self) -> Result<Step, PipelineError> {
        loop {
            let dgram = match self
                .reader
                .recv(self.socket.as_raw_fd(), MsgFlags::MSG_ERRQUEUE)
            {
                Ok(Some(dgram)) => dgram,
                Ok(None) => return Ok(Step::Continue),
                Err(_e) => {
                    debug!(error = ?_e, "error queue read failed");
                    return Ok(Step::Continue);
                }
            };

            let Dgram { payload, stamp } = dgram;
            let Some(send_ts) = stamp else {
                self.stats.missing_stamp();
                continue;
            };
            let Some(id) = read_probe_id(payload.get(LOOPBACK_HEADER_LEN..).unwrap_or(&[]))
            else {
                self.stats.short_payload();
                continue;
            };

            let mut ledger = self.ledger.lock();
            let mut slot = ledger.lookup(id);
            if slot.id() != id {
                self.stats.stale_id();
                continue;
            }
            slot.mark_timestamped(send_ts);
            self.stats.timestamp_stored();
            trace!("probe {id} left at {}.{:09}", send_ts.sec, send_ts.nsec);
        }
    }
}
