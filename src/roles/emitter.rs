//! Probe emitter: claims a ledger slot and sends one probe per timer
//! expiration.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::{Arc, Mutex};

use mio::Interest;
use rustix::time::{
    timerfd_create, timerfd_settime, Itimerspec, TimerfdClockId, TimerfdFlags,
    TimerfdTimerFlags, Timespec,
};

use crate::config::Config;
use crate::ledger::{probe_payload, Ledger};
use crate::net::{Endpoint, UdpSocket};
use crate::pipeline::{PipelineError, Role, Stats, Step};
use crate::results::{Record, ResultChannel};
use crate::trace::{debug, trace};

/// Paces probe sends off a timer descriptor.
///
/// Each send first claims the next ring slot under the ledger lock, so by
/// the time the kernel loops the frame back through the error queue the
/// identifier is already registered. With a send limit configured, the
/// emitter re-arms the timer one-shot after the last send and finishes the
/// run once that grace period for straggling replies expires.
pub struct Emitter {
    timer: OwnedFd,
    socket: Arc<UdpSocket>,
    mirror: Endpoint,
    ledger: Arc<Ledger>,
    stats: Arc<Stats>,
    /// Deferred-mode sink for measurements evicted by slot recycling.
    results: Option<Arc<Mutex<ResultChannel>>>,
    boundary: u64,
    interval_ms: u64,
    packets_per_tick: usize,
    max_latency_ms: u64,
    send_limit: Option<u64>,
    sent: u64,
    next_id: u64,
    draining: bool,
}

impl Emitter {
    /// Builds the emitter and its timer descriptor; the timer stays
    /// disarmed until [`Role::on_start`].
    pub fn new(
        socket: Arc<UdpSocket>,
        ledger: Arc<Ledger>,
        stats: Arc<Stats>,
        results: Option<Arc<Mutex<ResultChannel>>>,
        config: &Config,
    ) -> Result<Self, PipelineError> {
        let timer = timerfd_create(
            TimerfdClockId::Monotonic,
            TimerfdFlags::NONBLOCK | TimerfdFlags::CLOEXEC,
        )
        .map_err(|err| PipelineError::Timer(err.into()))?;
        Ok(Self {
            timer,
            socket,
            mirror: config.mirror,
            boundary: ledger.id_boundary(),
            ledger,
            stats,
            results,
            interval_ms: config.interval_ms,
            packets_per_tick: config.packets_per_tick,
            max_latency_ms: config.max_latency_ms,
            send_limit: config.send_limit,
            sent: 0,
            next_id: 0,
            draining: false,
        })
    }

    /// Reads the expiration count; `None` for a wakeup with nothing
    /// behind it.
    fn read_expirations(&self) -> Result<Option<u64>, PipelineError> {
        let mut raw = [0u8; 8];
        match rustix::io::read(&self.timer, &mut raw) {
            Ok(n) if n == raw.len() => Ok(Some(u64::from_ne_bytes(raw))),
            Ok(_) => Ok(None),
            Err(rustix::io::Errno::AGAIN) => Ok(None),
            Err(err) => Err(PipelineError::Timer(err.into())),
        }
    }

    /// Claims the next slot, sends its probe and forwards whatever
    /// completed measurement the claim evicted.
    fn emit_one(&mut self) -> Result<(), PipelineError> {
        let id = self.next_id;
        let recycled = {
            let mut ledger = self.ledger.lock();
            ledger.claim_next(id).recycled
        };

        let payload = probe_payload(id);
        let sent = self
            .socket
            .send_to(&payload, self.mirror)
            .map_err(PipelineError::Send)?;
        if sent != payload.len() {
            return Err(PipelineError::TruncatedSend { sent, len: payload.len() });
        }
        self.stats.probe_sent();
        trace!("probe {id} sent");

        self.next_id += 1;
        if self.next_id == self.boundary {
            self.next_id = 0;
        }

        if let (Some(results), Some(measurement)) = (&self.results, recycled) {
            results
                .lock()
                .expect("result channel poisoned")
                .insert(Record::new(measurement.id, measurement.latency()))?;
        }
        Ok(())
    }

    /// Replaces the periodic cadence with a one-shot deadline that gives
    /// in-flight replies one latency window to land.
    fn arm_drain_deadline(&mut self) -> Result<(), PipelineError> {
        let spec = Itimerspec {
            it_interval: Timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: timespec_from_millis(self.max_latency_ms),
        };
        timerfd_settime(&self.timer, TimerfdTimerFlags::empty(), &spec)
            .map_err(|err| PipelineError::Timer(err.into()))?;
        self.draining = true;
        debug!(
            "send limit reached after {} probes, draining for {} ms",
            self.sent, self.max_latency_ms
        );
        Ok(())
    }
}

impl Role for Emitter {
    const NAME: &'static str = "emitter";

    fn poll_fd(&self) -> BorrowedFd<'_> {
        self.timer.as_fd()
    }

    fn interest(&self) -> Interest {
        Interest::READABLE
    }

    fn on_start(&mut self) -> Result<(), PipelineError> {
        let interval = timespec_from_millis(self.interval_ms);
        let spec = Itimerspec { it_interval: interval, it_value: interval };
        timerfd_settime(&self.timer, TimerfdTimerFlags::empty(), &spec)
            .map_err(|err| PipelineError::Timer(err.into()))?;
        debug!("probe timer armed at {} ms", self.interval_ms);
        Ok(())
    }

    fn on_ready(&mut self) -> Result<Step, PipelineError> {
        let Some(expirations) = self.read_expirations()? else {
            return Ok(Step::Continue);
        };
        if expirations == 0 {
            return Ok(Step::Continue);
        }
        if expirations > 1 {
            return Err(PipelineError::TimerOverrun { expirations });
        }
        if self.draining {
            return Ok(Step::Finished);
        }

        for _ in 0..self.packets_per_tick {
            self.emit_one()?;
            self.sent += 1;
            if self.send_limit.is_some_and(|limit| self.sent >= limit) {
                self.arm_drain_deadline()?;
                break;
            }
        }
        Ok(Step::Continue)
    }
}

fn timespec_from_millis(millis: u64) -> Timespec {
    Timespec {
        tv_sec: (millis / 1_000) as i64,
        tv_nsec: ((millis % 1_000) * 1_000_000) as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResultMode;
    use crate::results::{result_pipe, RECORD_SIZE};
    use crate::time::Stamp;

    fn test_config(mirror: Endpoint) -> Config {
        Config {
            mirror,
            interval_ms: 500,
            max_latency_ms: 500,
            result_mode: ResultMode::OnRecycle,
            ..Config::default()
        }
    }

    #[test]
    fn timer_spec_splits_millis() {
        let spec = timespec_from_millis(2_500);
        assert_eq!(spec.tv_sec, 2);
        assert_eq!(spec.tv_nsec, 500_000_000);
        assert_eq!(timespec_from_millis(1_000).tv_nsec, 0);
    }

    #[test]
    fn emit_claims_a_slot_and_sends_the_probe() {
        let sink = UdpSocket::bind(Endpoint::localhost(0)).expect("sink");
        let mirror = sink.local_addr().expect("sink addr");
        let config = test_config(mirror);

        let ledger = Arc::new(Ledger::new(config.capacity()));
        let stats = Arc::new(Stats::new());
        let socket = Arc::new(UdpSocket::bind_tx_timestamped().expect("probe socket"));
        let mut emitter =
            Emitter::new(socket, Arc::clone(&ledger), Arc::clone(&stats), None, &config)
                .expect("emitter");

        emitter.emit_one().expect("emit");
        assert_eq!(stats.report().sent, 1);
        assert_eq!(ledger.lock().lookup(0).id(), 0);

        let mut buf = [0u8; 16];
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if let Some((n, _)) = sink.try_recv_from(&mut buf).expect("recv") {
                assert_eq!(n, 8);
                assert_eq!(crate::ledger::read_probe_id(&buf[..n]), Some(0));
                break;
            }
            assert!(std::time::Instant::now() < deadline, "probe never arrived");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }

    #[test]
    fn recycling_a_completed_slot_forwards_its_measurement() {
        let sink = UdpSocket::bind(Endpoint::localhost(0)).expect("sink");
        let config = test_config(sink.local_addr().expect("sink addr"));
        assert_eq!(config.capacity(), 2);

        let ledger = Arc::new(Ledger::new(config.capacity()));
        let stats = Arc::new(Stats::new());
        let socket = Arc::new(UdpSocket::bind_tx_timestamped().expect("probe socket"));
        let (pipe_read, pipe_write) = result_pipe().expect("pipe");
        let results = Arc::new(Mutex::new(ResultChannel::new(
            pipe_write,
            1,
            Arc::clone(&stats),
        )));
        let mut emitter = Emitter::new(
            socket,
            Arc::clone(&ledger),
            stats,
            Some(results),
            &config,
        )
        .expect("emitter");

        emitter.emit_one().expect("emit 0");
        {
            let mut guard = ledger.lock();
            let mut slot = guard.lookup(0);
            slot.mark_timestamped(Stamp::new(5, 0));
            slot.mark_received(Stamp::new(5, 750_000));
        }
        emitter.emit_one().expect("emit 1");
        // Probe 2 reuses slot 0 and must evict the finished measurement.
        emitter.emit_one().expect("emit 2");

        let mut raw = [0u8; RECORD_SIZE];
        assert_eq!(rustix::io::read(&pipe_read, &mut raw).expect("read"), RECORD_SIZE);
        let record = Record::from_bytes(&raw);
        assert_eq!(record.id, 0);
        assert_eq!(record.latency, Stamp::new(0, 750_000));
    }
}
