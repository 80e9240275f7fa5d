//! Datagram receives with timestamp control messages.
//!
//! [`DgramReader`] owns reusable payload and ancillary buffers and pulls
//! the software timestamp out of the `SCM_TIMESTAMPING` control message
//! the kernel attaches to timestamped deliveries. The same reader serves
//! both regular traffic and the error queue (`MSG_ERRQUEUE`), where the
//! kernel loops transmitted probes back with their scheduler timestamps.

use std::io::{self, IoSliceMut};
use std::os::fd::RawFd;

use nix::errno::Errno;
use nix::sys::socket::{ControlMessageOwned, MsgFlags, RecvMsg, SockaddrStorage, recvmsg};

use crate::time::Stamp;

/// Room for ancillary data on every receive.
const CONTROL_CAPACITY: usize = 1024;

/// One received datagram and its kernel timestamp, if present.
#[derive(Debug)]
pub struct Dgram<'a> {
    /// Payload bytes as received.
    pub payload: &'a [u8],
    /// Software timestamp from `SCM_TIMESTAMPING`, when delivered.
    pub stamp: Option<Stamp>,
}

/// Reusable receive context for one socket's datagram stream.
pub struct DgramReader {
    payload: Box<[u8]>,
    control: Vec<u8>,
}

impl DgramReader {
    /// `payload_capacity` bounds a single datagram; larger ones truncate.
    #[must_use]
    pub fn new(payload_capacity: usize) -> Self {
        Self {
            payload: vec![0u8; payload_capacity].into_boxed_slice(),
            control: Vec::with_capacity(CONTROL_CAPACITY),
        }
    }

    /// Receives one datagram from `fd` without blocking.
    ///
    /// Returns `Ok(None)` when the queue is empty. Pass
    /// [`MsgFlags::MSG_ERRQUEUE`] to read looped-back transmit timestamps
    /// instead of regular traffic.
    ///
    /// # Errors
    ///
    /// Returns an error on receive failures other than an empty queue.
    pub fn recv(&mut self, fd: RawFd, flags: MsgFlags) -> io::Result<Option<Dgram<'_>>> {
        self.control.clear();
        let (len, stamp) = {
            let mut iov = [IoSliceMut::new(&mut self.payload)];
            let msg = match recvmsg::<SockaddrStorage>(fd, &mut iov, Some(&mut self.control), flags)
            {
                Ok(msg) => msg,
                Err(Errno::EAGAIN) => return Ok(None),
                Err(errno) => return Err(io::Error::from(errno)),
            };
            (msg.bytes, software_stamp(&msg))
        };
        Ok(Some(Dgram {
            payload: &self.payload[..len],
            stamp,
        }))
    }
}

fn software_stamp<S>(msg: &RecvMsg<'_, '_, S>) -> Option<Stamp> {
    let cmsgs = msg.cmsgs().ok()?;
    for cmsg in cmsgs {
        if let ControlMessageOwned::ScmTimestampsns(stamps) = cmsg {
            return Some(Stamp::new(stamps.system.tv_sec(), stamps.system.tv_nsec()));
        }
    }
    None
}
