//! Run orchestration: wires sockets, ledger, roles and the result pipe
//! together, drives them under the configured strategy and folds the run
//! down to a final [`Outcome`].

use std::io;
use std::sync::{Arc, Mutex};
use std::thread;

use thiserror::Error;

use crate::config::{Config, ConfigError, ResultMode, Strategy};
use crate::ledger::Ledger;
use crate::net::{Endpoint, UdpSocket};
use crate::results::{result_pipe, Record, ResultChannel, ResultError};
use crate::roles::{Emitter, ReplyCollector, Stamper, Writer};
use crate::trace::{debug, info};

mod multi;
mod shutdown;
mod single;
mod stats;
mod worker;

pub use shutdown::ShutdownToken;
pub use stats::{Report, Stats};
pub use worker::{Role, Step};

/// Anything that can end a run early.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    #[error("failed to bind a measurement socket")]
    Bind(#[source] io::Error),
    #[error("failed to drive the probe timer")]
    Timer(#[source] io::Error),
    #[error("result pipe failed")]
    Pipe(#[source] io::Error),
    #[error("failed to open the output sink")]
    Output(#[source] io::Error),
    #[error("failed to spawn a worker thread")]
    Spawn(#[source] io::Error),
    #[error("poll failed")]
    Poll(#[source] io::Error),
    #[error("failed to send a probe")]
    Send(#[source] io::Error),
    #[error("probe send truncated to {sent} of {len} bytes")]
    TruncatedSend { sent: usize, len: usize },
    #[error("probe timer overran: {expirations} expirations in one wakeup")]
    TimerOverrun { expirations: u64 },
    #[error("failed to forward results")]
    Results(#[from] ResultError),
    #[error("failed to write results")]
    Write(#[source] io::Error),
    #[error("a worker thread panicked")]
    WorkerPanic,
}

/// How a run ended: the counters it accumulated, and the error that
/// stopped it when it did not stop cleanly.
#[derive(Debug)]
pub struct Outcome {
    pub report: Report,
    pub error: Option<PipelineError>,
}

/// Runs a measurement until the send limit drains, a role fails, or
/// `shutdown` is requested externally.
///
/// Setup failures surface as `Err`; once the pipeline is running, errors
/// are folded into the [`Outcome`] so the counters collected so far are
/// still reported.
///
/// # Errors
///
/// Returns an error when the configuration is invalid or any socket,
/// timer, pipe, output sink or thread cannot be set up.
pub fn run(config: &Config, shutdown: &Arc<ShutdownToken>) -> Result<Outcome, PipelineError> {
    config.validate()?;

    let stats = Arc::new(Stats::new());
    let ledger = Arc::new(Ledger::new(config.capacity()));
    debug!(
        "ledger holds {} slots, identifiers wrap at {}",
        ledger.capacity(),
        ledger.id_boundary()
    );

    let reply_socket = UdpSocket::bind_rx_timestamped(Endpoint::any(config.mirror.port()))
        .map_err(PipelineError::Bind)?;
    let probe_socket =
        Arc::new(UdpSocket::bind_tx_timestamped().map_err(PipelineError::Bind)?);

    let (pipe_read, pipe_write) = result_pipe().map_err(PipelineError::Pipe)?;
    let writer = Writer::new(config.format, config.output.as_deref(), pipe_read)
        .map_err(PipelineError::Output)?;
    let results = Arc::new(Mutex::new(ResultChannel::new(
        pipe_write,
        config.batch_size,
        Arc::clone(&stats),
    )));

    // Exactly one role reports: replies as they validate, or the emitter
    // as completed slots recycle.
    let (emitter_results, reply_results) = match config.result_mode {
        ResultMode::Immediate => (None, Some(Arc::clone(&results))),
        ResultMode::OnRecycle => (Some(Arc::clone(&results)), None),
    };

    let emitter = Emitter::new(
        Arc::clone(&probe_socket),
        Arc::clone(&ledger),
        Arc::clone(&stats),
        emitter_results,
        config,
    )?;
    let stamper = Stamper::new(
        Arc::clone(&probe_socket),
        Arc::clone(&ledger),
        Arc::clone(&stats),
    );
    let replies = ReplyCollector::new(
        reply_socket,
        Arc::clone(&ledger),
        Arc::clone(&stats),
        reply_results,
        config.max_latency(),
    );

    let writer_thread = {
        let shutdown = Arc::clone(shutdown);
        thread::Builder::new()
            .name("udplat-writer".into())
            .spawn(move || {
                let outcome = writer.run();
                if outcome.is_err() {
                    shutdown.request();
                }
                outcome
            })
            .map_err(PipelineError::Spawn)?
    };

    info!("measuring against {}", config.mirror);
    let driven = match config.strategy {
        Strategy::SingleThread => single::run(emitter, stamper, replies, shutdown),
        Strategy::MultiThread => multi::run(emitter, stamper, replies, shutdown),
    };

    let flushed = finish_results(config, &ledger, &results);
    // Last channel reference: dropping it closes the pipe, and the writer
    // drains to EOF and exits.
    drop(results);
    let written = match writer_thread.join() {
        Ok(result) => result,
        Err(_) => Err(PipelineError::WorkerPanic),
    };

    let error = driven.err().or(flushed.err()).or(written.err());
    Ok(Outcome { report: stats.report(), error })
}

/// Forwards measurements still parked in the ledger (deferred mode only)
/// and pushes out whatever the channel still stages.
fn finish_results(
    config: &Config,
    ledger: &Ledger,
    results: &Mutex<ResultChannel>,
) -> Result<(), PipelineError> {
    let mut channel = results.lock().expect("result channel poisoned");
    if config.result_mode == ResultMode::OnRecycle {
        for measurement in ledger.lock().completed() {
            channel.insert(Record::new(measurement.id, measurement.latency()))?;
        }
    }
    channel.flush()?;
    Ok(())
}
