//! Measurement binary: argument parsing, signal handling, one
//! [`pipeline::run`] and the final report.

use std::fmt::Display;
use std::net::IpAddr;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;

use udplat::net::Endpoint;
use udplat::pipeline::{self, ShutdownToken};
use udplat::Config;

const USAGE: &str = "\
usage: udplat [options] <address> <port>

Measures UDP round-trip latency against a mirror at <address>:<port>
using kernel software timestamps.

options:
  -i, --interval <ms>   probe cadence in milliseconds (default 1000)
  -p, --packets <n>     probes sent per timer tick (default 1)
  -l, --latency <ms>    round-trip latency window in ms (default 500)
  -b, --batch <n>       results per pipe write (default 1)
  -c, --count <n>       stop after n probes; 0 runs until interrupted
  -f, --format <fmt>    output format: friendly, csv or binary
  -o, --output <path>   write results to <path> instead of stdout
  -m, --multi-thread    one thread per role instead of one poll
  -r, --on-recycle      report a slot's measurement when it recycles
  -h, --help            print this help
";

enum ArgsOutcome {
    Run(Box<Config>),
    Help,
}

fn main() -> ExitCode {
    udplat::init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match parse_args(&args) {
        Ok(ArgsOutcome::Run(config)) => config,
        Ok(ArgsOutcome::Help) => {
            print!("{USAGE}");
            return ExitCode::SUCCESS;
        }
        Err(message) => {
            eprintln!("udplat: {message}");
            eprint!("{USAGE}");
            return ExitCode::from(1);
        }
    };

    print_run_header(&config);

    let shutdown = Arc::new(ShutdownToken::new());
    if let Err(err) = spawn_signal_handler(Arc::clone(&shutdown)) {
        eprintln!("udplat: failed to install signal handler: {err}");
        return ExitCode::from(1);
    }

    match pipeline::run(&config, &shutdown) {
        Ok(outcome) => {
            print!("{}", outcome.report);
            match outcome.error {
                None => ExitCode::SUCCESS,
                Some(err) => {
                    eprintln!("udplat: {}", render_error(&err));
                    ExitCode::from(2)
                }
            }
        }
        Err(err) => {
            eprintln!("udplat: {}", render_error(&err));
            ExitCode::from(1)
        }
    }
}

fn parse_args(args: &[String]) -> Result<ArgsOutcome, String> {
    let mut config = Config::default();
    let mut positional = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(ArgsOutcome::Help),
            "-i" | "--interval" => {
                config.interval_ms = numeric(arg, option_value(arg, iter.next())?)?;
            }
            "-p" | "--packets" => {
                config.packets_per_tick = numeric(arg, option_value(arg, iter.next())?)?;
            }
            "-l" | "--latency" => {
                config.max_latency_ms = numeric(arg, option_value(arg, iter.next())?)?;
            }
            "-b" | "--batch" => {
                config.batch_size = numeric(arg, option_value(arg, iter.next())?)?;
            }
            "-c" | "--count" => {
                let count: u64 = numeric(arg, option_value(arg, iter.next())?)?;
                config.send_limit = (count != 0).then_some(count);
            }
            "-f" | "--format" => {
                config.format = option_value(arg, iter.next())?
                    .parse()
                    .map_err(|err: udplat::ConfigError| err.to_string())?;
            }
            "-o" | "--output" => {
                config.output = Some(option_value(arg, iter.next())?.into());
            }
            "-m" | "--multi-thread" => config.strategy = udplat::Strategy::MultiThread,
            "-r" | "--on-recycle" => config.result_mode = udplat::ResultMode::OnRecycle,
            flag if flag.starts_with('-') => return Err(format!("unknown option '{flag}'")),
            _ => positional.push(arg.as_str()),
        }
    }

    let [address, port] = positional.as_slice() else {
        return Err(format!(
            "expected <address> <port>, got {} positional arguments",
            positional.len()
        ));
    };
    let address =
        IpAddr::from_str(address).map_err(|err| format!("invalid address '{address}': {err}"))?;
    config.mirror = Endpoint::new(address, numeric("port", port)?);

    Ok(ArgsOutcome::Run(Box::new(config)))
}

fn option_value<'a>(flag: &str, value: Option<&'a String>) -> Result<&'a str, String> {
    value.map(String::as_str).ok_or_else(|| format!("{flag} needs a value"))
}

fn numeric<T: FromStr>(flag: &str, value: &str) -> Result<T, String>
where
    T::Err: Display,
{
    value
        .parse()
        .map_err(|err| format!("invalid {flag} value '{value}': {err}"))
}

fn print_run_header(config: &Config) {
    println!("mirror: {}", config.mirror);
    println!("interval: {} ms", config.interval_ms);
    println!("packets per tick: {}", config.packets_per_tick);
    println!("max latency: {} ms", config.max_latency_ms);
    println!("batch size: {}", config.batch_size);
    match &config.output {
        None => println!("output file: stdout"),
        Some(path) => println!("output file: {}", path.display()),
    }
}

fn spawn_signal_handler(shutdown: Arc<ShutdownToken>) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGQUIT])?;
    std::thread::Builder::new()
        .name("udplat-signals".into())
        .spawn(move || {
            for _signal in signals.forever() {
                shutdown.request();
            }
        })?;
    Ok(())
}

fn render_error(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn parse(args: &[&str]) -> Result<ArgsOutcome, String> {
        let args: Vec<String> = args.iter().map(|s| (*s).to_string()).collect();
        parse_args(&args)
    }

    fn config_of(outcome: ArgsOutcome) -> Config {
        match outcome {
            ArgsOutcome::Run(config) => *config,
            ArgsOutcome::Help => panic!("expected a run configuration"),
        }
    }

    #[test]
    fn positional_arguments_set_the_mirror() {
        let config = config_of(parse(&["192.0.2.7", "9000"]).expect("parse"));
        assert_eq!(config.mirror.ip(), IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)));
        assert_eq!(config.mirror.port(), 9000);
        assert_eq!(config.interval_ms, 1000);
        assert!(config.send_limit.is_none());
    }

    #[test]
    fn flags_override_defaults() {
        let config = config_of(
            parse(&[
                "-i", "250", "--packets", "4", "-l", "900", "-b", "16", "-c", "100",
                "-f", "csv", "-o", "/tmp/out", "-m", "-r", "127.0.0.1", "4242",
            ])
            .expect("parse"),
        );
        assert_eq!(config.interval_ms, 250);
        assert_eq!(config.packets_per_tick, 4);
        assert_eq!(config.max_latency_ms, 900);
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.send_limit, Some(100));
        assert_eq!(config.format, udplat::OutputFormat::Csv);
        assert_eq!(config.output.as_deref(), Some(std::path::Path::new("/tmp/out")));
        assert_eq!(config.strategy, udplat::Strategy::MultiThread);
        assert_eq!(config.result_mode, udplat::ResultMode::OnRecycle);
    }

    #[test]
    fn count_zero_runs_unbounded() {
        let config = config_of(parse(&["-c", "0", "127.0.0.1", "4242"]).expect("parse"));
        assert!(config.send_limit.is_none());
    }

    #[test]
    fn help_short_circuits() {
        assert!(matches!(parse(&["-h", "garbage"]), Ok(ArgsOutcome::Help)));
    }

    #[test]
    fn bad_input_is_rejected() {
        assert!(parse(&["127.0.0.1"]).is_err());
        assert!(parse(&["-x", "127.0.0.1", "4242"]).is_err());
        assert!(parse(&["-i", "127.0.0.1", "4242"]).is_err());
        assert!(parse(&["-f", "xml", "127.0.0.1", "4242"]).is_err());
        assert!(parse(&["not-an-ip", "4242"]).is_err());
    }
}
