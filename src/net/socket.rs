//! UDP sockets with kernel software timestamping enabled.
//!
//! Two socket personalities exist:
//!
//! - the reply socket stamps inbound datagrams on delivery
//!   (`SOF_TIMESTAMPING_RX_SOFTWARE`), and
//! - the probe socket stamps outbound datagrams as they enter the packet
//!   scheduler (`SOF_TIMESTAMPING_TX_SCHED`), looping each stamp back on
//!   the socket error queue as a control message. `SO_SELECT_ERR_QUEUE`
//!   reports those loopbacks as exceptional readiness (`POLLPRI`), keeping
//!   them distinct from regular readable wakeups.

use std::io::{self, ErrorKind};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use mio::net::UdpSocket as MioUdpSocket;

use super::Endpoint;

// From linux/net_tstamp.h; libc does not export the full flag set.
const SOF_TIMESTAMPING_RX_SOFTWARE: libc::c_uint = 1 << 3;
const SOF_TIMESTAMPING_SOFTWARE: libc::c_uint = 1 << 4;
const SOF_TIMESTAMPING_TX_SCHED: libc::c_uint = 1 << 8;
const SOF_TIMESTAMPING_OPT_CMSG: libc::c_uint = 1 << 10;

// From asm-generic/socket.h; absent from libc.
const SO_SELECT_ERR_QUEUE: libc::c_int = 45;

/// A non-blocking UDP socket.
///
/// Wraps a mio UDP socket; use with mio's [`Poll`] for readiness
/// notification.
///
/// [`Poll`]: mio::Poll
pub struct UdpSocket {
    inner: MioUdpSocket,
}

impl UdpSocket {
    /// Creates a new UDP socket bound to the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound (e.g., address in
    /// use).
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        let inner = MioUdpSocket::bind(endpoint.into())?;
        Ok(Self { inner })
    }

    /// Binds a reply socket that timestamps datagrams on delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails or the kernel rejects the
    /// timestamping options.
    pub fn bind_rx_timestamped(endpoint: Endpoint) -> io::Result<Self> {
        let socket = Self::bind(endpoint)?;
        socket.set_timestamping(SOF_TIMESTAMPING_SOFTWARE | SOF_TIMESTAMPING_RX_SOFTWARE)?;
        Ok(socket)
    }

    /// Binds a probe socket (ephemeral port) that loops scheduler
    /// timestamps back on its error queue and signals them as `POLLPRI`.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails or the kernel rejects the
    /// timestamping options.
    pub fn bind_tx_timestamped() -> io::Result<Self> {
        let socket = Self::bind(Endpoint::any(0))?;
        socket.set_select_err_queue()?;
        socket.set_timestamping(
            SOF_TIMESTAMPING_SOFTWARE | SOF_TIMESTAMPING_OPT_CMSG | SOF_TIMESTAMPING_TX_SCHED,
        )?;
        Ok(socket)
    }

    /// Returns the local address this socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Sends a datagram to the specified endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if the socket would block.
    pub fn send_to(&self, buf: &[u8], dest: Endpoint) -> io::Result<usize> {
        self.inner.send_to(buf, dest.into())
    }

    /// Receives a datagram from the socket.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if the socket would block.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Endpoint)> {
        self.inner
            .recv_from(buf)
            .map(|(n, addr)| (n, Endpoint::from(addr)))
    }

    /// Attempts to send, returning `Ok(None)` instead of `WouldBlock`.
    pub fn try_send_to(&self, buf: &[u8], dest: Endpoint) -> io::Result<Option<usize>> {
        match self.send_to(buf, dest) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Attempts to receive, returning `Ok(None)` instead of `WouldBlock`.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Endpoint)>> {
        match self.recv_from(buf) {
            Ok((n, endpoint)) => Ok(Some((n, endpoint))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn set_timestamping(&self, flags: libc::c_uint) -> io::Result<()> {
        set_option(
            self.inner.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_TIMESTAMPING,
            flags as libc::c_int,
        )
    }

    fn set_select_err_queue(&self) -> io::Result<()> {
        set_option(self.inner.as_raw_fd(), libc::SOL_SOCKET, SO_SELECT_ERR_QUEUE, 1)
    }
}

// mio does not expose these options; set them through libc directly.
fn set_option(fd: RawFd, level: libc::c_int, option: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            &value as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl AsFd for UdpSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl AsRawFd for UdpSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
