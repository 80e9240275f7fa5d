//! Single-threaded strategy: every role multiplexed on one poll.

use std::os::fd::AsRawFd;
use std::sync::Arc;

use mio::unix::SourceFd;
use mio::{Events, Poll, Token, Waker};

use super::shutdown::ShutdownToken;
use super::worker::{RequestOnExit, Role, Step};
use super::PipelineError;
use crate::trace::debug;

const WAKE: Token = Token(0);
const TIMER: Token = Token(1);
const STAMPS: Token = Token(2);
const REPLIES: Token = Token(3);

/// Drives all three roles from the calling thread until one finishes,
/// one fails, or shutdown is requested.
///
/// Within a wakeup the emitter runs first so the send cadence holds, and
/// transmit stamps are recorded before replies are validated against
/// them.
pub fn run<E, S, R>(
    mut emitter: E,
    mut stamper: S,
    mut replies: R,
    shutdown: &Arc<ShutdownToken>,
) -> Result<(), PipelineError>
where
    E: Role,
    S: Role,
    R: Role,
{
    let _guard = RequestOnExit::new(Arc::clone(shutdown));

    let mut poll = Poll::new().map_err(PipelineError::Poll)?;
    let waker = Waker::new(poll.registry(), WAKE).map_err(PipelineError::Poll)?;
    shutdown.register_waker(waker);

    let timer_fd = emitter.poll_fd().as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&timer_fd), TIMER, emitter.interest())
        .map_err(PipelineError::Poll)?;
    let stamps_fd = stamper.poll_fd().as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&stamps_fd), STAMPS, stamper.interest())
        .map_err(PipelineError::Poll)?;
    let replies_fd = replies.poll_fd().as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&replies_fd), REPLIES, replies.interest())
        .map_err(PipelineError::Poll)?;

    replies.on_start()?;
    stamper.on_start()?;
    emitter.on_start()?;
    debug!("single-thread pipeline running");

    let mut events = Events::with_capacity(8);
    loop {
        if shutdown.is_requested() {
            return Ok(());
        }

        if let Err(err) = poll.poll(&mut events, None) {
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(PipelineError::Poll(err));
        }

        if shutdown.is_requested() {
            return Ok(());
        }

        let mut timer_ready = false;
        let mut stamps_ready = false;
        let mut replies_ready = false;
        for event in events.iter() {
            match event.token() {
                TIMER => timer_ready = true,
                STAMPS => stamps_ready = true,
                REPLIES => replies_ready = true,
                _ => {}
            }
        }

        if timer_ready && matches!(emitter.on_ready()?, Step::Finished) {
            return Ok(());
        }
        if stamps_ready && matches!(stamper.on_ready()?, Step::Finished) {
            return Ok(());
        }
        if replies_ready && matches!(replies.on_ready()?, Step::Finished) {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

    use mio::Interest;

    use super::*;

    struct Drain {
        read_end: OwnedFd,
        write_end: OwnedFd,
        finish_after: u32,
    }

    impl Drain {
        fn new(finish_after: u32) -> Self {
            let (read_end, write_end) =
                rustix::pipe::pipe_with(rustix::pipe::PipeFlags::CLOEXEC).expect("pipe");
            let flags = rustix::fs::fcntl_getfl(&read_end).expect("getfl");
            rustix::fs::fcntl_setfl(&read_end, flags | rustix::fs::OFlags::NONBLOCK)
                .expect("setfl");
            Self { read_end, write_end, finish_after }
        }

        fn feed(&self, bytes: u32) {
            for _ in 0..bytes {
                rustix::io::write(&self.write_end, &[1u8]).expect("write");
            }
        }
    }

    impl Role for Drain {
        const NAME: &'static str = "drain";

        fn poll_fd(&self) -> BorrowedFd<'_> {
            self.read_end.as_fd()
        }

        fn interest(&self) -> Interest {
            Interest::READABLE
        }

        fn on_ready(&mut self) -> Result<Step, PipelineError> {
            let mut byte = [0u8; 1];
            while rustix::io::read(&self.read_end, &mut byte).is_ok() {
                self.finish_after = self.finish_after.saturating_sub(1);
            }
            if self.finish_after == 0 {
                Ok(Step::Finished)
            } else {
                Ok(Step::Continue)
            }
        }
    }

    #[test]
    fn finishing_role_ends_the_run() {
        let shutdown = Arc::new(ShutdownToken::new());
        let emitter = Drain::new(2);
        emitter.feed(2);

        run(emitter, Drain::new(u32::MAX), Drain::new(u32::MAX), &shutdown)
            .expect("run failed");
        assert!(shutdown.is_requested());
    }

    #[test]
    fn shutdown_request_ends_an_idle_run() {
        let shutdown = Arc::new(ShutdownToken::new());
        let requester = {
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                shutdown.request();
            })
        };

        run(
            Drain::new(u32::MAX),
            Drain::new(u32::MAX),
            Drain::new(u32::MAX),
            &shutdown,
        )
        .expect("run failed");
        requester.join().expect("requester panicked");
    }
}
