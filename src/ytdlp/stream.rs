use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_util::Stream;
use tokio::sync::mpsc;

use super::ProcessError;

/// A chunk of subprocess output, or the terminal error of the stream.
pub type StreamItem = Result<Bytes, ProcessError>;

/// The pull side of a running subprocess's standard output.
///
/// Chunks arrive in subprocess output order, bounded by the configured
/// buffer water-mark: the subprocess is only read as fast as this stream is
/// drained. The stream is finite and cannot be restarted. A terminal error,
/// if any, is always the last item; a cancelled or cleanly exited subprocess
/// ends the stream without one.
pub struct ByteStream {
    receiver: mpsc::Receiver<StreamItem>,
}

impl ByteStream {
    pub(crate) fn new(receiver: mpsc::Receiver<StreamItem>) -> Self {
        Self { receiver }
    }

    /// Receives the next chunk of output. `None` means end-of-data.
    pub async fn next_chunk(&mut self) -> Option<StreamItem> {
        self.receiver.recv().await
    }

    /// Drains the stream to completion, returning all remaining data.
    pub async fn collect_bytes(mut self) -> Result<Vec<u8>, ProcessError> {
        let mut data = Vec::new();

        while let Some(chunk) = self.next_chunk().await {
            data.extend_from_slice(&chunk?);
        }

        Ok(data)
    }
}

impl Stream for ByteStream {
    type Item = StreamItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
