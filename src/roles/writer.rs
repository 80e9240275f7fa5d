//! Result writer: drains the result pipe into the output sink.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::os::fd::OwnedFd;
use std::path::Path;

use crate::config::OutputFormat;
use crate::pipeline::PipelineError;
use crate::results::{Record, RECORD_SIZE};
use crate::trace::debug;

/// Records decoded per pipe read.
const RECORDS_PER_READ: usize = 128;

#[derive(Debug)]
enum Output {
    Stdout(io::Stdout),
    File(BufWriter<File>),
}

impl Output {
    fn open(path: Option<&Path>) -> io::Result<Self> {
        match path {
            None => Ok(Self::Stdout(io::stdout())),
            // Refuse to clobber an existing capture.
            Some(path) => Ok(Self::File(BufWriter::new(File::create_new(path)?))),
        }
    }
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Stdout(out) => out.write(buf),
            Self::File(out) => out.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Stdout(out) => out.flush(),
            Self::File(out) => out.flush(),
        }
    }
}

/// Drains result records from the pipe and renders them.
///
/// Runs on its own thread in every strategy, blocking on the pipe so it
/// needs no poll: producers closing their channel ends the pipe with EOF,
/// which is the writer's signal to flush and exit.
#[derive(Debug)]
pub struct Writer {
    pipe: OwnedFd,
    format: OutputFormat,
    sink: Output,
}

impl Writer {
    /// Opens the output sink. A path that already exists is refused.
    pub fn new(
        format: OutputFormat,
        path: Option<&Path>,
        pipe: OwnedFd,
    ) -> io::Result<Self> {
        Ok(Self { pipe, format, sink: Output::open(path)? })
    }

    /// Consumes the pipe until EOF, rendering every whole record.
    ///
    /// Records split across reads are reassembled; a torn tail still in
    /// the buffer at EOF belonged to an interrupted producer write and is
    /// dropped.
    pub fn run(mut self) -> Result<(), PipelineError> {
        let mut buf = [0u8; RECORDS_PER_READ * RECORD_SIZE];
        let mut pending = 0usize;

        loop {
            let read = match rustix::io::read(&self.pipe, &mut buf[pending..]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(rustix::io::Errno::INTR) => continue,
                Err(err) => return Err(PipelineError::Pipe(err.into())),
            };

            let available = pending + read;
            let whole = available - available % RECORD_SIZE;
            for chunk in buf[..whole].chunks_exact(RECORD_SIZE) {
                let mut raw = [0u8; RECORD_SIZE];
                raw.copy_from_slice(chunk);
                self.render(&Record::from_bytes(&raw))?;
            }
            buf.copy_within(whole..available, 0);
            pending = available - whole;
        }

        if pending != 0 {
            debug!("dropping {pending} byte torn tail at pipe close");
        }
        self.sink.flush().map_err(PipelineError::Write)?;
        Ok(())
    }

    fn render(&mut self, record: &Record) -> Result<(), PipelineError> {
        let latency = record.latency;
        match self.format {
            OutputFormat::Friendly => {
                if latency.is_zero() {
                    writeln!(self.sink, "{} Error!", record.id)
                } else {
                    writeln!(
                        self.sink,
                        "{} {}.{:06} ms",
                        record.id,
                        latency.sec * 1_000 + latency.nsec / 1_000_000,
                        (latency.nsec % 1_000_000).unsigned_abs()
                    )
                }
            }
            OutputFormat::Csv => {
                if latency.is_zero() {
                    writeln!(self.sink, "{},error", record.id)
                } else {
                    writeln!(
                        self.sink,
                        "{},{}",
                        record.id,
                        latency.sec * 1_000_000 + latency.nsec / 1_000
                    )
                }
            }
            OutputFormat::Binary => {
                let micros = (latency.sec * 1_000_000 + latency.nsec / 1_000) as u64;
                self.sink
                    .write_all(&record.id.to_ne_bytes())
                    .and_then(|()| self.sink.write_all(&micros.to_ne_bytes()))
            }
        }
        .map_err(PipelineError::Write)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::time::Stamp;

    fn temp_output(tag: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("udplat-writer-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn run_writer(format: OutputFormat, path: &Path, records: &[Record]) {
        let (pipe_read, pipe_write) =
            crate::results::result_pipe().expect("pipe");
        let writer = Writer::new(format, Some(path), pipe_read).expect("writer");
        let thread = std::thread::spawn(move || writer.run());

        for record in records {
            rustix::io::write(&pipe_write, &record.to_bytes()).expect("write");
        }
        drop(pipe_write);
        thread.join().expect("writer panicked").expect("writer failed");
    }

    #[test]
    fn friendly_lines_render_millis_and_errors() {
        let path = temp_output("friendly");
        run_writer(
            OutputFormat::Friendly,
            &path,
            &[
                Record::new(3, Stamp::new(0, 1_500_000)),
                Record::new(7, Stamp::ZERO),
                Record::new(9, Stamp::new(1, 250_000_000)),
            ],
        );

        let rendered = std::fs::read_to_string(&path).expect("read output");
        assert_eq!(rendered, "3 1.500000 ms\n7 Error!\n9 1250.000000 ms\n");
        std::fs::remove_file(&path).expect("cleanup");
    }

    #[test]
    fn csv_lines_render_micros_and_errors() {
        let path = temp_output("csv");
        run_writer(
            OutputFormat::Csv,
            &path,
            &[
                Record::new(3, Stamp::new(0, 1_500_000)),
                Record::new(7, Stamp::ZERO),
            ],
        );

        let rendered = std::fs::read_to_string(&path).expect("read output");
        assert_eq!(rendered, "3,1500\n7,error\n");
        std::fs::remove_file(&path).expect("cleanup");
    }

    #[test]
    fn binary_packs_identifier_and_micros() {
        let path = temp_output("binary");
        run_writer(
            OutputFormat::Binary,
            &path,
            &[Record::new(11, Stamp::new(0, 2_000_500))],
        );

        let rendered = std::fs::read(&path).expect("read output");
        assert_eq!(rendered.len(), 16);
        let mut word = [0u8; 8];
        word.copy_from_slice(&rendered[..8]);
        assert_eq!(u64::from_ne_bytes(word), 11);
        word.copy_from_slice(&rendered[8..]);
        assert_eq!(u64::from_ne_bytes(word), 2_000);
        std::fs::remove_file(&path).expect("cleanup");
    }

    #[test]
    fn record_split_across_reads_is_reassembled() {
        let path = temp_output("split");
        let (pipe_read, pipe_write) =
            crate::results::result_pipe().expect("pipe");
        let writer =
            Writer::new(OutputFormat::Csv, Some(&path), pipe_read).expect("writer");
        let thread = std::thread::spawn(move || writer.run());

        let bytes = Record::new(5, Stamp::new(0, 42_000)).to_bytes();
        rustix::io::write(&pipe_write, &bytes[..10]).expect("write head");
        std::thread::sleep(std::time::Duration::from_millis(50));
        rustix::io::write(&pipe_write, &bytes[10..]).expect("write tail");
        drop(pipe_write);
        thread.join().expect("writer panicked").expect("writer failed");

        assert_eq!(std::fs::read_to_string(&path).expect("read output"), "5,42\n");
        std::fs::remove_file(&path).expect("cleanup");
    }

    #[test]
    fn existing_output_file_is_refused() {
        let path = temp_output("existing");
        std::fs::write(&path, b"keep me").expect("seed file");

        let (pipe_read, _pipe_write) =
            crate::results::result_pipe().expect("pipe");
        let err = Writer::new(OutputFormat::Friendly, Some(&path), pipe_read)
            .expect_err("existing file accepted");
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read(&path).expect("read back"), b"keep me");
        std::fs::remove_file(&path).expect("cleanup");
    }
}
