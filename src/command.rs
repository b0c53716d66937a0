// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! MJPEG stream from a capture command.
//!
//! Some cameras are only reachable through a vendor tool that writes MJPEG
//! to stdout (`libcamera-vid --codec mjpeg -o -`). A [`CommandReader`] runs
//! such a command and reads its stdout. When the command exits it is
//! started again after a retry delay, so a [`crate::splitter::Splitter`]
//! over the reader sees one endless stream until the cancel token fires.
//!
//! The command is described in JSON:
//!
//! ```json
//! {"cmd": ["libcamera-vid", "-t", "0", "--codec", "mjpeg", "-o", "-"], "retry": "500ms"}
//! ```

use crate::{
    capture::CancelToken,
    error::{Error, Result},
};
use serde_json::Value;
use std::{
    fs,
    io::{self, Read},
    process::{Child, ChildStdout, Command, Stdio},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info};

/// Delay before a restart when the description gives none.
pub const DEFAULT_RETRY: Duration = Duration::from_secs(1);

/// How long an exited command's stdout may close before the process is
/// reaped.
const EXIT_GRACE: Duration = Duration::from_secs(2);

const TICK: Duration = Duration::from_millis(50);

/// Parse a duration such as `500ms`, `1.5s` or `1m30s`.
///
/// Units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`. A bare `0` is
/// accepted; any other number needs a unit.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    if text == "0" {
        return Ok(Duration::ZERO);
    }
    if text.is_empty() {
        return Err("empty duration".to_string());
    }

    let invalid = || format!("invalid duration {text:?}");
    let mut rest = text;
    let mut nanos: u128 = 0;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);

        let scale: u128 = match unit {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            "" => return Err(format!("missing unit in duration {text:?}")),
            unit => return Err(format!("unknown unit {unit:?} in duration {text:?}")),
        };

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        nanos += whole * scale;
        if !fraction.is_empty() {
            let digits: f64 = format!("0.{fraction}").parse().map_err(|_| invalid())?;
            nanos += (digits * scale as f64).round() as u128;
        }
        rest = tail;
    }

    let secs = u64::try_from(nanos / 1_000_000_000).map_err(|_| invalid())?;
    Ok(Duration::new(secs, (nanos % 1_000_000_000) as u32))
}

/// A capture command and its restart delay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    pub retry: Duration,
}

impl CommandSpec {
    /// Parse a `{"cmd": [...], "retry": "..."}` description. A missing,
    /// empty or zero retry means [`DEFAULT_RETRY`].
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|err| Error::Command(err.to_string()))?;

        let argv = value
            .get("cmd")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Command("\"cmd\" must be an array of strings".to_string()))?
            .iter()
            .map(|arg| arg.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| Error::Command("\"cmd\" must be an array of strings".to_string()))?;
        if argv.is_empty() {
            return Err(Error::Command("\"cmd\" is empty".to_string()));
        }

        let retry = match value.get("retry") {
            None | Some(Value::Null) => Duration::ZERO,
            Some(Value::String(retry)) if retry.is_empty() => Duration::ZERO,
            Some(Value::String(retry)) => parse_duration(retry).map_err(Error::Command)?,
            Some(other) => {
                return Err(Error::Command(format!(
                    "\"retry\" must be a duration string, got {other}"
                )))
            }
        };

        Ok(CommandSpec {
            argv,
            retry: if retry.is_zero() { DEFAULT_RETRY } else { retry },
        })
    }

    /// Load a description given on the command line: a JSON literal, `-`
    /// for stdin, or the path of a JSON file.
    pub fn load(arg: &str) -> Result<Self> {
        let text = if arg == "-" {
            io::read_to_string(io::stdin()).map_err(|err| Error::Command(format!("stdin: {err}")))?
        } else if arg.trim_start().starts_with('{') {
            arg.to_string()
        } else {
            fs::read_to_string(arg).map_err(|err| Error::Command(format!("{arg}: {err}")))?
        };
        Self::from_json(&text)
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }
}

/// Reads the stdout of a capture command, restarting it whenever it exits.
///
/// Returns end of file only once the cancel token is set. A read blocked on
/// a running command is not interrupted by the token; it returns when the
/// command writes or exits.
pub struct CommandReader {
    spec: CommandSpec,
    cancel: CancelToken,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    runs: u32,
    read: u64,
}

impl CommandReader {
    pub fn new(spec: CommandSpec, cancel: CancelToken) -> Self {
        Self {
            spec,
            cancel,
            child: None,
            stdout: None,
            runs: 0,
            read: 0,
        }
    }

    /// Start the first run. Failing to start it at all is an error; later
    /// restarts that fail are retried.
    pub fn start(&mut self) -> Result<()> {
        self.spawn()
            .map_err(|err| Error::device(self.spec.program(), "spawn", err))
    }

    /// Times the command has been started.
    pub fn runs(&self) -> u32 {
        self.runs
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    fn spawn(&mut self) -> io::Result<()> {
        let Some((program, args)) = self.spec.argv.split_first() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
        };
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        self.stdout = child.stdout.take();
        self.runs += 1;
        self.read = 0;
        if self.runs == 1 {
            info!("started {} pid {}", program, child.id());
        } else {
            debug!("restarted {} pid {} (run {})", program, child.id(), self.runs);
        }
        self.child = Some(child);
        Ok(())
    }

    /// Close stdout and collect the process, killing it if it has not
    /// exited within `grace`.
    fn reap(&mut self, grace: Duration) {
        self.stdout = None;
        let Some(mut child) = self.child.take() else {
            return;
        };

        let deadline = Instant::now() + grace;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!("{} {} after {} bytes", self.spec.program(), status, self.read);
                    return;
                }
                Ok(None) if Instant::now() < deadline && !self.cancel.is_cancelled() => {
                    thread::sleep(TICK)
                }
                Ok(None) => break,
                Err(err) => {
                    debug!("{}: wait: {}", self.spec.program(), err);
                    break;
                }
            }
        }

        debug!("killing {} pid {}", self.spec.program(), child.id());
        if let Err(err) = child.kill() {
            debug!("{}: kill: {}", self.spec.program(), err);
        }
        if let Err(err) = child.wait() {
            debug!("{}: wait: {}", self.spec.program(), err);
        }
    }

    /// Sleep for the retry delay, waking early on cancel.
    fn pause(&self) {
        let deadline = Instant::now() + self.spec.retry;
        while !self.cancel.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(TICK));
        }
    }
}

impl Read for CommandReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.cancel.is_cancelled() {
                self.reap(Duration::ZERO);
                return Ok(0);
            }

            let Some(stdout) = self.stdout.as_mut() else {
                if let Err(err) = self.spawn() {
                    if self.runs == 0 {
                        return Err(err);
                    }
                    debug!("{}: {}", self.spec.program(), err);
                    self.pause();
                }
                continue;
            };

            match stdout.read(buf) {
                Ok(0) => {
                    self.reap(EXIT_GRACE);
                    self.pause();
                }
                Ok(n) => {
                    self.read += n as u64;
                    return Ok(n);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!("{}: read: {}", self.spec.program(), err);
                    self.reap(Duration::ZERO);
                    self.pause();
                }
            }
        }
    }
}

impl Drop for CommandReader {
    fn drop(&mut self) {
        self.reap(Duration::ZERO);
    }
}
