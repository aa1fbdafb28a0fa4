//! Invoking the external dissector and streaming its output (spec.md §4.A).
//!
//! Isolates every subprocess, path-lookup, and exit-code quirk so the rest
//! of the crate never shells out directly. The timeout-and-kill machinery
//! generalizes the `wait_timeout`-based pattern in
//! `jonasbb-padding-aint-enough/taskmanager/src/utils.rs::docker_run`,
//! adapted here to a line-streamed child rather than a wait-then-collect
//! one, per spec.md §5's back-pressure requirement.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::DissectorError;

use super::version::{check_floor, detect_version, resolve_path};

/// Exit code tshark uses for "completed with malformed-packet warnings",
/// treated as success (spec.md §4.A, §6).
const WARNING_EXIT_CODE: i32 = 2;

/// A located, version-checked dissector executable.
#[derive(Debug, Clone)]
pub struct Dissector {
    path: PathBuf,
}

impl Dissector {
    /// Locates the executable and verifies its version floor. Surfaced
    /// before any run (spec.md §4.A): callers should do this once per
    /// worker, not per invocation.
    pub fn locate(override_path: Option<&PathBuf>, version_floor: &str) -> Result<Self, DissectorError> {
        let path = resolve_path(override_path)?;
        let version = detect_version(&path)?;
        check_floor(&version, version_floor)?;
        Ok(Dissector { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Invokes the dissector with the given arguments plus `-r <input>`,
    /// returning a lazily-pulled line iterator over stdout (spec.md §4.A
    /// form (a)).
    pub fn run_fields(
        &self,
        args: &[String],
        input: &Path,
        timeout: Option<Duration>,
    ) -> Result<RowStream, DissectorError> {
        let mut cmd = Command::new(&self.path);
        cmd.arg("-r").arg(input);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        RowStream::spawn(cmd, timeout)
    }

    /// Re-invokes the dissector directing its stdout to a PCAP file rather
    /// than parsed fields (spec.md §4.A form (b)).
    pub fn write_pcap(
        &self,
        args: &[String],
        input: &Path,
        output: &Path,
        timeout: Option<Duration>,
    ) -> Result<(), DissectorError> {
        let mut cmd = Command::new(&self.path);
        cmd.arg("-r").arg(input);
        cmd.args(args);
        cmd.arg("-w").arg(output);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        let mut stream = RowStream::spawn(cmd, timeout)?;
        for line in &mut stream {
            line?;
        }
        stream.finish()
    }
}

enum WaitOutcome {
    Exited(std::process::ExitStatus),
    TimedOut(Duration),
    SpawnError(std::io::Error),
}

/// A lazily-produced sequence of stdout lines from one dissector
/// invocation, in process order (spec.md §4.A ordering guarantee).
///
/// Reading stops either when stdout reaches EOF or when the caller drops
/// the stream early; either way, [`RowStream::finish`] (called implicitly
/// on exhaustion, or explicitly by callers that stop early) reaps the
/// child and turns its exit status into the spec.md §4.A / §6 exit-code
/// contract.
pub struct RowStream {
    lines: std::iter::Fuse<std::io::Lines<BufReader<std::process::ChildStdout>>>,
    stderr_thread: Option<JoinHandle<String>>,
    waiter_thread: Option<JoinHandle<WaitOutcome>>,
    finished: bool,
}

impl RowStream {
    fn spawn(mut cmd: Command, timeout: Option<Duration>) -> Result<Self, DissectorError> {
        let mut child: Child = cmd.spawn().map_err(DissectorError::Spawn)?;
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let stderr_thread = thread::spawn(move || {
            let mut buf = String::new();
            let _ = BufReader::new(stderr).read_to_string(&mut buf);
            buf
        });

        let waiter_thread = thread::spawn(move || -> WaitOutcome {
            use wait_timeout::ChildExt;
            match timeout {
                Some(d) => match child.wait_timeout(d) {
                    Ok(Some(status)) => WaitOutcome::Exited(status),
                    Ok(None) => {
                        let _ = child.kill();
                        let _ = child.wait();
                        WaitOutcome::TimedOut(d)
                    }
                    Err(e) => WaitOutcome::SpawnError(e),
                },
                None => match child.wait() {
                    Ok(status) => WaitOutcome::Exited(status),
                    Err(e) => WaitOutcome::SpawnError(e),
                },
            }
        });

        Ok(RowStream {
            lines: BufReader::new(stdout).lines().fuse(),
            stderr_thread: Some(stderr_thread),
            waiter_thread: Some(waiter_thread),
            finished: false,
        })
    }

    /// Joins the worker threads and applies the exit-code contract. Safe to
    /// call multiple times; only the first call does any work.
    pub fn finish(&mut self) -> Result<(), DissectorError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let stderr = self
            .stderr_thread
            .take()
            .map(|h| h.join().unwrap_or_default())
            .unwrap_or_default();
        let outcome = self
            .waiter_thread
            .take()
            .map(|h| h.join().unwrap_or(WaitOutcome::SpawnError(std::io::Error::new(
                std::io::ErrorKind::Other,
                "waiter thread panicked",
            ))));
        match outcome {
            Some(WaitOutcome::TimedOut(d)) => Err(DissectorError::Timeout(d)),
            Some(WaitOutcome::SpawnError(e)) => Err(DissectorError::Spawn(e)),
            Some(WaitOutcome::Exited(status)) => {
                let code = status.code();
                if status.success() || code == Some(WARNING_EXIT_CODE) {
                    Ok(())
                } else {
                    Err(DissectorError::NonZeroExit { code, stderr })
                }
            }
            None => Ok(()),
        }
    }
}

impl Iterator for RowStream {
    type Item = Result<String, DissectorError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.lines.next() {
            Some(Ok(line)) => Some(Ok(line)),
            Some(Err(e)) => Some(Err(DissectorError::Spawn(e))),
            None => match self.finish() {
                Ok(()) => None,
                Err(e) => Some(Err(e)),
            },
        }
    }
}

/// A pre-canned `RowStream`-alike for tests, avoiding a real dissector
/// invocation. `capmaster-core`'s own components take `IntoIterator<Item =
/// String>` rather than `RowStream` directly wherever possible so this is
/// rarely needed outside dissector-module tests.
#[cfg(test)]
pub(crate) struct FixedRows {
    lines: std::vec::IntoIter<String>,
}

#[cfg(test)]
impl FixedRows {
    pub(crate) fn new(lines: Vec<String>) -> Self {
        FixedRows {
            lines: lines.into_iter(),
        }
    }
}

#[cfg(test)]
impl Iterator for FixedRows {
    type Item = Result<String, DissectorError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.lines.next().map(Ok)
    }
}
