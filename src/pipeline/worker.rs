//! Generic event loop driving a single role.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::Arc;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use super::shutdown::ShutdownToken;
use super::PipelineError;
use crate::trace::debug;

const WAKE: Token = Token(0);
const READY: Token = Token(1);

/// What a role's readiness handler decided about the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Keep polling.
    Continue,
    /// The run is complete; tear the pipeline down.
    Finished,
}

/// A unit of pipeline work bound to one file descriptor.
///
/// The worker loop owns the poll; a role only describes what to watch and
/// reacts when it turns ready. Readiness is edge-triggered, so
/// [`on_ready`](Self::on_ready) must drain its descriptor before
/// returning.
pub trait Role {
    /// Thread and log name.
    const NAME: &'static str;

    /// Descriptor to poll.
    fn poll_fd(&self) -> BorrowedFd<'_>;

    /// Readiness to poll for.
    fn interest(&self) -> Interest;

    /// Runs once before the first poll, after the descriptor is
    /// registered.
    fn on_start(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Handles one readiness edge.
    fn on_ready(&mut self) -> Result<Step, PipelineError>;
}

/// Requests shutdown when dropped, so one role ending a run (or dying)
/// takes the others with it.
pub(super) struct RequestOnExit(Arc<ShutdownToken>);

impl RequestOnExit {
    pub(super) fn new(shutdown: Arc<ShutdownToken>) -> Self {
        Self(shutdown)
    }
}

impl Drop for RequestOnExit {
    fn drop(&mut self) {
        self.0.request();
    }
}

/// Polls `role` until it finishes, fails, or shutdown is requested.
pub fn run<R: Role>(mut role: R, shutdown: Arc<ShutdownToken>) -> Result<(), PipelineError> {
    let _guard = RequestOnExit::new(Arc::clone(&shutdown));

    let mut poll = Poll::new().map_err(PipelineError::Poll)?;
    let waker = Waker::new(poll.registry(), WAKE).map_err(PipelineError::Poll)?;
    shutdown.register_waker(waker);

    let raw = role.poll_fd().as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&raw), READY, role.interest())
        .map_err(PipelineError::Poll)?;

    role.on_start()?;
    debug!("{} running", R::NAME);

    let mut events = Events::with_capacity(4);
    loop {
        if shutdown.is_requested() {
            debug!("{} stopping", R::NAME);
            return Ok(());
        }

        if let Err(err) = poll.poll(&mut events, None) {
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(PipelineError::Poll(err));
        }

        if shutdown.is_requested() {
            debug!("{} stopping", R::NAME);
            return Ok(());
        }

        if events.iter().any(|event| event.token() == READY) {
            match role.on_ready()? {
                Step::Continue => {}
                Step::Finished => {
                    debug!("{} finished", R::NAME);
                    return Ok(());
                }
            }
        }
    }
}
