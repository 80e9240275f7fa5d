//! Multi-threaded strategy: one worker thread per role.

use std::sync::Arc;
use std::thread;

use super::shutdown::ShutdownToken;
use super::worker::{self, Role};
use super::PipelineError;

/// Runs each role on its own thread and blocks until the run ends.
///
/// Collectors spawn before the emitter so the first probe already has
/// listeners. Whichever worker stops first latches the shutdown token and
/// the rest follow; the first error reported wins, and a panicking worker
/// surfaces as [`PipelineError::WorkerPanic`].
pub fn run<E, S, R>(
    emitter: E,
    stamper: S,
    replies: R,
    shutdown: &Arc<ShutdownToken>,
) -> Result<(), PipelineError>
where
    E: Role + Send + 'static,
    S: Role + Send + 'static,
    R: Role + Send + 'static,
{
    let mut workers = Vec::with_capacity(3);

    let spawned: Result<(), PipelineError> = (|| {
        workers.push(spawn(replies, shutdown)?);
        workers.push(spawn(stamper, shutdown)?);
        workers.push(spawn(emitter, shutdown)?);
        Ok(())
    })();

    match &spawned {
        Ok(()) => shutdown.wait(),
        Err(_) => shutdown.request(),
    }

    let mut first_error = spawned.err();
    while let Some(handle) = workers.pop() {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                first_error.get_or_insert(err);
            }
            Err(_) => {
                first_error.get_or_insert(PipelineError::WorkerPanic);
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn spawn<R: Role + Send + 'static>(
    role: R,
    shutdown: &Arc<ShutdownToken>,
) -> Result<thread::JoinHandle<Result<(), PipelineError>>, PipelineError> {
    let shutdown = Arc::clone(shutdown);
    thread::Builder::new()
        .name(format!("udplat-{}", R::NAME))
        .spawn(move || worker::run(role, shutdown))
        .map_err(PipelineError::Spawn)
}
