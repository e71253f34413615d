// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sources of log lines for the ingestion loop.
//!
//! [`LineSource`] is the seam between the ingestion loop and the host's log daemon: every call to
//! [`LineSource::open`] starts a fresh, lazily-read stream of lines. [`JournalSource`] implements
//! it by following journald with `journalctl -f`; tests substitute in-memory sources.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, warn};

use crate::errors::StreamError;

pub const DEFAULT_JOURNALCTL: &str = "journalctl";

// How long a terminated journalctl gets to exit before it is left to `kill_on_drop`.
const CHILD_EXIT_TIMEOUT: Duration = Duration::from_secs(5);
// Cap on the stderr captured for diagnostics after an unexpected exit.
const MAX_STDERR_BYTES: u64 = 8192;
/// Longest line kept, a little above journald's default `LineMax` of 48K. Longer lines are
/// truncated and the rest is discarded up to the next newline.
pub const MAX_LINE_BYTES: u64 = 64 * 1024;

/// Produces restartable streams of log lines.
#[async_trait]
pub trait LineSource: Send {
    /// Establishes a new stream. Called again after every stream failure.
    async fn open(&mut self) -> Result<Box<dyn LineStream>, StreamError>;
}

/// One live stream of log lines.
#[async_trait]
pub trait LineStream: Send {
    /// Next line without its terminator. `Ok(None)` means the stream has ended.
    async fn next_line(&mut self) -> Result<Option<String>, StreamError>;

    /// Releases the underlying handle. Safe to call more than once.
    async fn close(&mut self);
}

/// Follows journald for one syslog identifier via `journalctl -f -o cat -t <identifier>`.
#[derive(Debug, Clone)]
pub struct JournalSource {
    program: String,
    identifier: String,
}

impl JournalSource {
    #[must_use]
    pub fn new(identifier: impl Into<String>) -> Self {
        Self::with_program(DEFAULT_JOURNALCTL, identifier)
    }

    /// Uses `program` instead of `journalctl`. It receives the same arguments.
    #[must_use]
    pub fn with_program(program: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            identifier: identifier.into(),
        }
    }

    #[must_use]
    pub fn args(&self) -> Vec<String> {
        vec![
            "-f".to_string(),
            "-o".to_string(),
            "cat".to_string(),
            "-t".to_string(),
            self.identifier.clone(),
        ]
    }
}

#[async_trait]
impl LineSource for JournalSource {
    async fn open(&mut self) -> Result<Box<dyn LineStream>, StreamError> {
        let mut child = Command::new(&self.program)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| StreamError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StreamError::MissingStdout(self.program.clone()))?;
        let stderr = child.stderr.take();
        debug!(
            "Spawned {} {:?} (pid {:?})",
            self.program,
            self.args(),
            child.id()
        );

        Ok(Box::new(JournalStream {
            program: self.program.clone(),
            child: Some(child),
            stdout: BufReader::new(stdout),
            stderr,
            buf: Vec::new(),
        }))
    }
}

struct JournalStream {
    program: String,
    child: Option<Child>,
    stdout: BufReader<ChildStdout>,
    stderr: Option<ChildStderr>,
    buf: Vec<u8>,
}

impl JournalStream {
    /// Reports how the child ended once its stdout is exhausted.
    async fn log_exit(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        match tokio::time::timeout(CHILD_EXIT_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) if status.success() => {
                debug!("{} exited cleanly", self.program);
            }
            Ok(Ok(status)) => {
                let stderr = self.read_stderr().await;
                warn!(
                    "{} exited with {}. stderr: {}",
                    self.program,
                    describe(status),
                    stderr.trim()
                );
            }
            Ok(Err(e)) => warn!("Failed to wait for {}: {}", self.program, e),
            Err(_) => debug!("{} closed stdout but is still running", self.program),
        }
    }

    /// Drops bytes up to and including the next newline, or to EOF.
    async fn discard_rest_of_line(&mut self) -> Result<usize, StreamError> {
        let mut discarded = 0;
        loop {
            let (used, done) = {
                let available = self.stdout.fill_buf().await?;
                match available.iter().position(|b| *b == b'\n') {
                    Some(pos) => (pos + 1, true),
                    None => (available.len(), available.is_empty()),
                }
            };
            self.stdout.consume(used);
            discarded += used;
            if done {
                return Ok(discarded);
            }
        }
    }

    async fn read_stderr(&mut self) -> String {
        let Some(stderr) = self.stderr.take() else {
            return String::new();
        };
        let mut captured = Vec::new();
        if let Err(e) = stderr.take(MAX_STDERR_BYTES).read_to_end(&mut captured).await {
            debug!("Failed to read {} stderr: {}", self.program, e);
        }
        String::from_utf8_lossy(&captured).into_owned()
    }
}

#[async_trait]
impl LineStream for JournalStream {
    async fn next_line(&mut self) -> Result<Option<String>, StreamError> {
        self.buf.clear();
        let read = (&mut self.stdout)
            .take(MAX_LINE_BYTES)
            .read_until(b'\n', &mut self.buf)
            .await?;
        if read == 0 {
            self.log_exit().await;
            return Ok(None);
        }
        if self.buf.last() != Some(&b'\n') && read as u64 == MAX_LINE_BYTES {
            let discarded = self.discard_rest_of_line().await?;
            debug!(
                "Truncated a {} line to {} bytes ({} bytes dropped)",
                self.program, MAX_LINE_BYTES, discarded
            );
        }
        while matches!(self.buf.last(), Some(b'\n' | b'\r')) {
            self.buf.pop();
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }

    async fn close(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Err(e) = child.start_kill() {
            // Already reaped or exited on its own.
            debug!("Failed to signal {}: {}", self.program, e);
        }
        match tokio::time::timeout(CHILD_EXIT_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => debug!("{} stopped: {}", self.program, describe(status)),
            Ok(Err(e)) => warn!("Failed to wait for {}: {}", self.program, e),
            Err(_) => warn!(
                "{} did not exit within {:?}",
                self.program, CHILD_EXIT_TIMEOUT
            ),
        }
    }
}

fn describe(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => status.to_string(),
    }
}
