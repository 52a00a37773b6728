//! Spawning and supervision of the media-extraction subprocess.
//!
//! A [Runner] turns one subprocess invocation into a [ByteStream] of its
//! standard output plus a side-channel of [RunnerEvent]s parsed from its
//! standard error. The subprocess and its pipes are always torn down, no
//! matter how the stream ends.

use std::{process::Stdio, sync::Arc};

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    io::AsyncReadExt,
    process::{Child, ChildStderr, ChildStdout, Command},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

mod events;
mod stream;

pub use events::*;
pub use stream::*;

use crate::Config;

/// Arguments always appended to force single-output to standard output
const OUTPUT_TO_STDOUT: [&str; 2] = ["-o", "-"];

#[derive(Debug, Error)]
pub enum ProcessError {
    /// The binary could not be started at all.
    #[error("Failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// The subprocess exited with a failure.
    #[error("Process exited with code {code:?}: {diagnostics}")]
    Exited {
        /// Exit code, absent when the process died to a signal
        code: Option<i32>,
        /// Low-level process error captured along the way, if any
        process_error: Option<String>,
        /// Diagnostic output, bounded by the configured cap
        diagnostics: String,
    },
}

/// A running subprocess: its output stream, event side-channel, and pid.
pub struct ProcessStream {
    pub stream: ByteStream,
    pub events: mpsc::UnboundedReceiver<RunnerEvent>,
    pub pid: Option<u32>,
}

/// Owns the spawn, supervision and teardown of media-extraction subprocesses.
pub struct Runner {
    config: Config,
}

impl Runner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Spawns the binary with the given arguments, streaming its output.
    ///
    /// Returns synchronously with [ProcessError::Spawn] when the binary
    /// cannot be started. Otherwise the returned stream closes cleanly when
    /// the subprocess exits with status zero or is cancelled through
    /// `token`, and yields [ProcessError::Exited] as its final item when it
    /// exits with a failure. Cancellation terminates the subprocess's whole
    /// process group, since the binary may spawn helpers of its own.
    pub fn run_streaming(
        &self,
        args: &[&str],
        token: CancellationToken,
    ) -> Result<ProcessStream, ProcessError> {
        let binary = self.config.binary_path.clone();

        let mut command = Command::new(&binary);

        command
            .args(args)
            .args(OUTPUT_TO_STDOUT)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // The child leads its own process group so the whole tree can be
        // signalled at once on cancellation.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            binary: binary.display().to_string(),
            source,
        })?;

        let pid = child.id();
        let stdout = child.stdout.take().expect("stdout is piped");
        let stderr = child.stderr.take().expect("stderr is piped");

        let (data_sender, data_receiver) = mpsc::channel(self.config.chunks_in_buffer());
        let (event_sender, event_receiver) = mpsc::unbounded_channel();

        let diagnostics = Arc::new(Mutex::new(String::new()));

        let stderr_task = tokio::spawn(pump_diagnostics(
            stderr,
            event_sender.clone(),
            diagnostics.clone(),
            self.config.max_diagnostic_bytes,
        ));

        tokio::spawn(supervise(
            child,
            stdout,
            stderr_task,
            data_sender,
            event_sender,
            diagnostics,
            token,
            self.config.read_chunk_size,
        ));

        Ok(ProcessStream {
            stream: ByteStream::new(data_receiver),
            events: event_receiver,
            pid,
        })
    }
}

/// Pumps standard output into the data channel until the subprocess is done,
/// then reaps it and reports how it went.
#[allow(clippy::too_many_arguments)]
async fn supervise(
    mut child: Child,
    mut stdout: ChildStdout,
    stderr_task: JoinHandle<()>,
    data_sender: mpsc::Sender<StreamItem>,
    event_sender: mpsc::UnboundedSender<RunnerEvent>,
    diagnostics: Arc<Mutex<String>>,
    token: CancellationToken,
    chunk_size: usize,
) {
    let mut buf = vec![0u8; chunk_size];
    let mut cancelled = false;
    let mut process_error: Option<String> = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                cancelled = true;
                terminate_tree(&mut child).await;
                break;
            }
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(amount) => {
                    let chunk = Bytes::copy_from_slice(&buf[..amount]);

                    // The send applies backpressure: a slow consumer stops
                    // this read loop, which in turn stops the subprocess.
                    if data_sender.send(Ok(chunk)).await.is_err() {
                        // The consumer is gone, tear the subprocess down.
                        cancelled = true;
                        terminate_tree(&mut child).await;
                        break;
                    }
                }
                Err(error) => {
                    process_error = Some(error.to_string());
                    break;
                }
            },
        }
    }

    let status = child.wait().await;

    // The pipes are closed once the process is reaped, so the diagnostic
    // buffer is complete after this.
    let _ = stderr_task.await;

    match status {
        Ok(status) if status.success() || cancelled => {
            let _ = event_sender.send(RunnerEvent::Closed {
                code: status.code(),
            });
        }
        Ok(status) => {
            let error = ProcessError::Exited {
                code: status.code(),
                process_error,
                diagnostics: diagnostics.lock().clone(),
            };

            let _ = event_sender.send(RunnerEvent::Failed {
                detail: error.to_string(),
            });

            let _ = data_sender.send(Err(error)).await;
        }
        Err(wait_error) => {
            let error = ProcessError::Exited {
                code: None,
                process_error: Some(wait_error.to_string()),
                diagnostics: diagnostics.lock().clone(),
            };

            let _ = event_sender.send(RunnerEvent::Failed {
                detail: error.to_string(),
            });

            let _ = data_sender.send(Err(error)).await;
        }
    }
}

/// Consumes standard error line by line, emitting parsed events and
/// accumulating the bounded diagnostic buffer.
async fn pump_diagnostics(
    mut stderr: ChildStderr,
    event_sender: mpsc::UnboundedSender<RunnerEvent>,
    diagnostics: Arc<Mutex<String>>,
    cap: usize,
) {
    let mut buf = vec![0u8; 1024];
    let mut pending = String::new();

    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(amount) => {
                let text = String::from_utf8_lossy(&buf[..amount]);

                append_bounded(&mut diagnostics.lock(), &text, cap);
                pending.push_str(&text);

                for line in drain_lines(&mut pending) {
                    for event in parse_line(&line) {
                        let _ = event_sender.send(event);
                    }
                }
            }
        }
    }

    // A final line without a trailing newline still counts
    for event in parse_line(pending.trim_end()) {
        let _ = event_sender.send(event);
    }
}

/// Terminates the subprocess and any helpers it spawned.
///
/// The process group is signalled first so children of the binary die with
/// it, then the leaf is killed directly. Both attempts are best-effort and
/// failures are swallowed.
async fn terminate_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGTERM);
        }
    }

    let _ = child.start_kill();
}

/// Splits complete lines off the front of `pending`.
///
/// The binary separates progress updates with carriage returns rather than
/// newlines, so both count as line breaks.
fn drain_lines(pending: &mut String) -> Vec<String> {
    let mut lines = Vec::new();

    while let Some(at) = pending.find(['\r', '\n']) {
        let line: String = pending.drain(..=at).collect();
        let line = line.trim_end_matches(['\r', '\n']);

        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }

    lines
}

/// Appends text to the diagnostic buffer, keeping it under `cap` bytes.
fn append_bounded(buffer: &mut String, text: &str, cap: usize) {
    let remaining = cap.saturating_sub(buffer.len());

    if remaining == 0 {
        return;
    }

    let mut end = remaining.min(text.len());

    while !text.is_char_boundary(end) {
        end -= 1;
    }

    buffer.push_str(&text[..end]);
}
