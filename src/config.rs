use std::{env, path::PathBuf};

/// The configuration of the streaming pipeline
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the media-extraction binary
    pub binary_path: PathBuf,
    /// How many bytes of subprocess output may be buffered ahead of the consumer
    pub max_stream_buffer: usize,
    /// How many bytes are read from the subprocess per chunk
    pub read_chunk_size: usize,
    /// How many bytes of diagnostic output are retained for error reporting
    pub max_diagnostic_bytes: usize,
}

impl Config {
    /// How many chunks fit in the stream buffer
    pub fn chunks_in_buffer(&self) -> usize {
        (self.max_stream_buffer / self.read_chunk_size).max(1)
    }

    /// Creates a config from the environment, falling back to the defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            binary_path: env::var("GRAMOPHONE_YTDLP_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.binary_path),
            max_stream_buffer: env_size("GRAMOPHONE_STREAM_BUFFER", defaults.max_stream_buffer),
            read_chunk_size: env_size("GRAMOPHONE_CHUNK_SIZE", defaults.read_chunk_size),
            max_diagnostic_bytes: env_size(
                "GRAMOPHONE_DIAGNOSTIC_BYTES",
                defaults.max_diagnostic_bytes,
            ),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Resolved through PATH unless overridden
            binary_path: "yt-dlp".into(),
            // 32MiB keeps several minutes of audio ahead of the sink
            max_stream_buffer: 32 * 1024 * 1024,
            read_chunk_size: 8 * 1024,
            // Enough to keep the useful tail of an extractor traceback
            max_diagnostic_bytes: 16 * 1024,
        }
    }
}

fn env_size(name: &str, fallback: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(fallback)
}
