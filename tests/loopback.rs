//! Whole-pipeline runs against the loopback interface.
//!
//! No separate reflector is needed: configuring the mirror as
//! `127.0.0.1:<reply port>` makes every probe land straight in the
//! pipeline's own reply socket, which is indistinguishable from a mirror
//! with zero turnaround.

use std::path::PathBuf;
use std::sync::{Arc, Once};
use std::time::Duration;

use serial_test::serial;

use udplat::net::Endpoint;
use udplat::pipeline::{self, ShutdownToken};
use udplat::{Config, OutputFormat, PipelineError, ResultMode, Strategy};

static TRACE: Once = Once::new();

fn init() {
    TRACE.call_once(udplat::init_tracing);
}

fn free_udp_port() -> u16 {
    let probe = std::net::UdpSocket::bind(("127.0.0.1", 0)).expect("probe bind");
    probe.local_addr().expect("probe addr").port()
}

fn temp_output(tag: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("udplat-loopback-{tag}-{}", std::process::id()));
    let _ = std::fs::remove_file(&path);
    path
}

#[test]
#[serial]
fn bounded_single_thread_run_reports_every_probe() {
    init();
    let output = temp_output("single");
    let config = Config {
        mirror: Endpoint::localhost(free_udp_port()),
        interval_ms: 100,
        max_latency_ms: 200,
        send_limit: Some(5),
        format: OutputFormat::Csv,
        output: Some(output.clone()),
        ..Config::default()
    };

    let shutdown = Arc::new(ShutdownToken::new());
    let outcome = pipeline::run(&config, &shutdown).expect("pipeline setup");

    assert!(outcome.error.is_none(), "run failed: {:?}", outcome.error);
    assert!(shutdown.is_requested());
    let report = outcome.report;
    assert_eq!(report.sent, 5);
    assert_eq!(report.stamped, 5);
    // Replies loop back within the same poll wakeup, and transmit stamps
    // are collected ahead of them, so nothing can miss its correlation.
    assert_eq!(report.valid, 5);
    assert_eq!(report.duplicates, 0);

    let rendered = std::fs::read_to_string(&output).expect("read output");
    assert_eq!(rendered.lines().count() as u64, report.valid);
    for line in rendered.lines() {
        let (id, micros) = line.split_once(',').expect("csv shape");
        assert!(id.parse::<u64>().is_ok(), "bad id in {line:?}");
        let micros: i64 = micros.parse().expect("numeric latency");
        assert!(micros >= 0, "negative loopback latency in {line:?}");
        assert!(micros < 200_000, "latency beyond the window in {line:?}");
    }
    std::fs::remove_file(&output).expect("cleanup");
}

#[test]
#[serial]
fn multi_thread_run_stops_on_external_request() {
    init();
    let output = temp_output("multi");
    let config = Config {
        mirror: Endpoint::localhost(free_udp_port()),
        interval_ms: 50,
        max_latency_ms: 150,
        strategy: Strategy::MultiThread,
        result_mode: ResultMode::OnRecycle,
        format: OutputFormat::Friendly,
        output: Some(output.clone()),
        ..Config::default()
    };

    let shutdown = Arc::new(ShutdownToken::new());
    let requester = {
        let shutdown = Arc::clone(&shutdown);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(400));
            shutdown.request();
        })
    };

    let outcome = pipeline::run(&config, &shutdown).expect("pipeline setup");
    requester.join().expect("requester panicked");

    assert!(outcome.error.is_none(), "run failed: {:?}", outcome.error);
    let report = outcome.report;
    assert!(report.sent >= 1, "no probes left in 400 ms");
    assert!(report.valid <= report.sent);

    // Deferred mode reports each completed slot exactly once, at recycling
    // or in the final ledger sweep.
    let rendered = std::fs::read_to_string(&output).expect("read output");
    assert_eq!(rendered.lines().count() as u64, report.valid);
    for line in rendered.lines() {
        assert!(line.ends_with(" ms"), "unexpected line {line:?}");
    }
    std::fs::remove_file(&output).expect("cleanup");
}

#[test]
#[serial]
fn bounded_on_recycle_run_forwards_evicted_measurements() {
    init();
    let output = temp_output("recycle");
    let config = Config {
        mirror: Endpoint::localhost(free_udp_port()),
        interval_ms: 40,
        max_latency_ms: 80,
        send_limit: Some(8),
        result_mode: ResultMode::OnRecycle,
        format: OutputFormat::Csv,
        output: Some(output.clone()),
        ..Config::default()
    };
    // Eight probes through a three-slot ring forces recycling mid-run.
    assert_eq!(config.capacity(), 3);

    let shutdown = Arc::new(ShutdownToken::new());
    let outcome = pipeline::run(&config, &shutdown).expect("pipeline setup");

    assert!(outcome.error.is_none(), "run failed: {:?}", outcome.error);
    let report = outcome.report;
    assert_eq!(report.sent, 8);
    assert_eq!(report.valid, 8);

    let rendered = std::fs::read_to_string(&output).expect("read output");
    assert_eq!(rendered.lines().count(), 8);
    std::fs::remove_file(&output).expect("cleanup");
}

#[test]
#[serial]
fn setup_failures_surface_before_the_run() {
    init();
    let shutdown = Arc::new(ShutdownToken::new());

    let unbound = Config::default();
    assert!(matches!(
        pipeline::run(&unbound, &shutdown),
        Err(PipelineError::Config(_))
    ));

    let occupied = temp_output("occupied");
    std::fs::write(&occupied, b"already here").expect("seed file");
    let config = Config {
        mirror: Endpoint::localhost(free_udp_port()),
        output: Some(occupied.clone()),
        ..Config::default()
    };
    assert!(matches!(
        pipeline::run(&config, &shutdown),
        Err(PipelineError::Output(_))
    ));
    std::fs::remove_file(&occupied).expect("cleanup");
}
