use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::{io::AsyncReadExt, process::Command};

use crate::{format_time, Config};

const YT_UNAVAILABLE: &str = "Video unavailable. This video is not available";
const YT_NOT_FOUND: &str = "Video unavailable";

/// A single track in a queue.
///
/// Immutable once constructed; built from metadata lookup output and dropped
/// when it leaves the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub title: String,
    pub author: String,
    /// Length of the track in whole seconds
    pub duration: u64,
    pub url: String,
}

impl Track {
    /// One-line summary used in queue listings
    pub fn describe(&self) -> String {
        format!(
            "{} by {} ({})",
            self.title,
            self.author,
            format_time(self.duration)
        )
    }
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Resource was found but is unavailable")]
    Unavailable,

    #[error("Resource was not found")]
    NotFound,

    #[error("Failed to fetch metadata: {0}")]
    FetchError(String),

    #[error("Failed to parse metadata: {0}")]
    ParseError(String),
}

/// Resolves title, author and duration for a URL before it is enqueued.
///
/// Lookup failures surface to the caller as-is and the track is never
/// enqueued, so a bad link costs nothing but an error message.
#[async_trait]
pub trait MetadataLookup: Send + Sync {
    async fn lookup(&self, url: &str) -> Result<Track, MetadataError>;
}

/// Metadata lookup backed by the media-extraction binary.
pub struct YtDlpMetadata {
    config: Config,
}

impl YtDlpMetadata {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MetadataLookup for YtDlpMetadata {
    async fn lookup(&self, url: &str) -> Result<Track, MetadataError> {
        let mut child = Command::new(&self.config.binary_path)
            .arg("--no-playlist")
            .arg("--skip-download")
            .args(["--print", "%(title)s\n%(uploader)s\n%(duration)s"])
            .args(["--", url])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| MetadataError::FetchError(e.to_string()))?;

        let mut output = String::new();
        let mut error_output = String::new();

        child
            .stdout
            .take()
            .expect("stdout is piped")
            .read_to_string(&mut output)
            .await
            .map_err(|e| MetadataError::FetchError(e.to_string()))?;

        child
            .stderr
            .take()
            .expect("stderr is piped")
            .read_to_string(&mut error_output)
            .await
            .ok();

        let exit = child
            .wait()
            .await
            .map_err(|e| MetadataError::FetchError(e.to_string()))?;

        if !exit.success() {
            if error_output.contains(YT_UNAVAILABLE) {
                return Err(MetadataError::Unavailable);
            }

            if error_output.contains(YT_NOT_FOUND) {
                return Err(MetadataError::NotFound);
            }

            return Err(MetadataError::FetchError(error_output));
        }

        let mut lines = output.lines();

        let title = lines
            .next()
            .ok_or_else(|| MetadataError::ParseError("missing title".to_string()))?;

        let author = lines
            .next()
            .ok_or_else(|| MetadataError::ParseError("missing uploader".to_string()))?;

        // Live streams report "NA", and some extractors print fractional seconds
        let duration = lines
            .next()
            .and_then(|value| value.parse::<f64>().ok())
            .map(|seconds| seconds as u64)
            .unwrap_or_default();

        Ok(Track {
            title: title.to_string(),
            author: author.to_string(),
            duration,
            url: url.to_string(),
        })
    }
}
