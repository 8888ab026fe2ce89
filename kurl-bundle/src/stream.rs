//! Bridge from blocking `Write` code to a streamed response body.

use std::io::{self, Write};

use bytes::Bytes;
use tokio::sync::mpsc;

/// Bytes buffered before a chunk is handed to the response body.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks in flight between the writer and the body; bounds memory per request.
pub const CHANNEL_DEPTH: usize = 16;

/// Item type of the response body stream.
pub type Chunk = io::Result<Bytes>;

/// Creates a writer and the receiving half that feeds the response body.
pub fn channel() -> (ChunkWriter, mpsc::Receiver<Chunk>) {
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    (ChunkWriter::new(tx), rx)
}

/// Blocking writer that forwards bytes as chunks over a bounded channel.
///
/// Must only be used off the async runtime (e.g. inside `spawn_blocking`):
/// a full channel blocks the calling thread until the client catches up.
/// Writes fail with `BrokenPipe` once the receiver is gone, which is how a
/// client disconnect surfaces to the archive writers.
#[derive(Debug)]
pub struct ChunkWriter {
    /// Sending half of the body channel.
    tx: mpsc::Sender<Chunk>,
    /// Bytes not yet sent as a chunk.
    buf: Vec<u8>,
}

/// Ends a body with an error so the transport aborts instead of terminating
/// the chunked encoding cleanly.
///
/// Holds its own sender, so the body stays open until the handle is used or
/// dropped even when the writer has already been consumed.
#[derive(Debug)]
pub struct AbortHandle {
    /// Sender shared with the writer.
    tx: mpsc::Sender<Chunk>,
}

impl AbortHandle {
    /// Queues the error after everything the writer already sent.
    pub async fn abort(self, reason: String) {
        // The receiver may already be gone; nothing is left to notify then.
        let _ = self.tx.send(Err(io::Error::other(reason))).await;
    }
}

impl ChunkWriter {
    /// Wraps the sending half of a body channel.
    fn new(tx: mpsc::Sender<Chunk>) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(CHUNK_SIZE),
        }
    }

    /// Handle that can end the body with an error after this writer is gone.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            tx: self.tx.clone(),
        }
    }

    /// Sends the pending buffer as one chunk.
    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::from(std::mem::replace(
            &mut self.buf,
            Vec::with_capacity(CHUNK_SIZE),
        ));
        self.tx
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.tx.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away"));
        }
        let room = CHUNK_SIZE - self.buf.len();
        let n = data.len().min(room);
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() == CHUNK_SIZE {
            self.send_buffered()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}
