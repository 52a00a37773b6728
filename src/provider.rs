use async_trait::async_trait;
use log::{debug, error, trace, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{ByteStream, Config, ProcessError, Runner, RunnerEvent};

/// Arguments selecting best-effort audio-only output for a single resource.
///
/// IPv4 is forced because IPv6 routes to some extractors stall mid-download.
const STREAM_ARGS: [&str; 5] = [
    "-f",
    "bestaudio",
    "--no-playlist",
    "--no-cache-dir",
    "--force-ipv4",
];

/// Anything that can produce one playable byte stream per track URL.
#[async_trait]
pub trait StreamSource: Send + Sync + 'static {
    async fn create_stream(&self, url: &str) -> Result<AudioSession, ProcessError>;
}

/// Produces playable byte streams by spawning the media-extraction binary.
pub struct StreamProvider {
    runner: Runner,
}

impl StreamProvider {
    pub fn new(config: Config) -> Self {
        Self {
            runner: Runner::new(config),
        }
    }
}

#[async_trait]
impl StreamSource for StreamProvider {
    /// Creates a byte stream for the given URL.
    ///
    /// Each call owns an independent subprocess, so concurrent calls for
    /// different URLs are fine. The returned session tears its subprocess
    /// down when destroyed or dropped.
    async fn create_stream(&self, url: &str) -> Result<AudioSession, ProcessError> {
        let token = CancellationToken::new();

        let mut args = STREAM_ARGS.to_vec();
        args.extend(["--", url]);

        let process = match self.runner.run_streaming(&args, token.clone()) {
            Ok(process) => process,
            Err(process_error) => {
                error!("Could not start stream for {url}: {process_error}");
                return Err(process_error);
            }
        };

        let handle = SessionHandle {
            token,
            pid: process.pid,
        };

        // The side-channel must always be drained, or runner events for a
        // slow track would pile up unread.
        spawn_event_drain(url.to_string(), process.events);

        debug!("Streaming {url} (pid {:?})", handle.pid);

        Ok(AudioSession {
            stream: process.stream,
            handle,
        })
    }
}

/// The live playback attempt for one track: the subprocess handle and the
/// byte stream derived from it.
///
/// A session is scoped to exactly one playback attempt. Dropping it destroys
/// the subprocess, so a finished or abandoned session can never leak.
pub struct AudioSession {
    pub stream: ByteStream,
    handle: SessionHandle,
}

impl AudioSession {
    /// Builds a session around an already-open stream. Used by stream
    /// sources outside the yt-dlp pipeline.
    pub fn from_parts(stream: ByteStream, handle: SessionHandle) -> Self {
        Self { stream, handle }
    }

    /// A handle that can destroy this session from elsewhere.
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }
}

impl Drop for AudioSession {
    fn drop(&mut self) {
        self.handle.destroy();
    }
}

/// Cancels a session's subprocess tree when asked. Cloneable and idempotent.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    token: CancellationToken,
    pid: Option<u32>,
}

impl SessionHandle {
    /// Creates a handle from a cancellation token. Used by stream sources
    /// outside the yt-dlp pipeline.
    pub fn new(token: CancellationToken, pid: Option<u32>) -> Self {
        Self { token, pid }
    }

    /// Tears the session down, fire-and-forget. Safe to call twice.
    pub fn destroy(&self) {
        if !self.token.is_cancelled() {
            debug!("Destroying session (pid {:?})", self.pid);
            self.token.cancel();
        }
    }

    /// Whether the session has been torn down.
    pub fn is_destroyed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Keeps the event side-channel drained, logging what comes through.
fn spawn_event_drain(url: String, mut events: mpsc::UnboundedReceiver<RunnerEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                RunnerEvent::Progress(progress) => {
                    if let Some(percent) = progress.percent {
                        trace!("Downloading {url}: {percent:.1}%");
                    }
                }
                RunnerEvent::Output { tag, text } => trace!("[{tag}] {text}"),
                RunnerEvent::Closed { code } => debug!("Stream for {url} closed (code {code:?})"),
                RunnerEvent::Failed { detail } => warn!("Stream for {url} failed: {detail}"),
            }
        }
    });
}
