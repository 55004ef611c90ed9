//! Random-access read stream over a stored binary
//!
//! The stream never loads the whole binary: it fetches one window of
//! `buffer_size` bytes at a time through a [`FragmentReader`], the narrow
//! range-read capability of the metadata store.

use crate::error::Result;
use async_trait::async_trait;
use std::future::Future;
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};

/// Byte-range reads against stored binaries
#[async_trait]
pub trait FragmentReader: Send + Sync {
    /// Read up to `count` bytes of the binary `file_id` starting at `offset`.
    /// Returns fewer bytes at the end of the binary.
    async fn read_fragment(&self, file_id: i64, offset: u64, count: usize) -> Result<Vec<u8>>;
}

type PendingFragment = Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send>>;

pub struct BinaryReadStream {
    reader: Arc<dyn FragmentReader>,
    file_id: i64,
    length: u64,
    position: u64,
    buffer_size: usize,
    buffer: Vec<u8>,
    buffer_offset: u64,
    pending: Option<(u64, PendingFragment)>,
}

impl BinaryReadStream {
    pub fn new(reader: Arc<dyn FragmentReader>, file_id: i64, length: u64, buffer_size: usize) -> Self {
        Self {
            reader,
            file_id,
            length,
            position: 0,
            buffer_size: buffer_size.max(1),
            buffer: Vec::new(),
            buffer_offset: 0,
            pending: None,
        }
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    fn buffered(&self) -> Option<&[u8]> {
        let end = self.buffer_offset + self.buffer.len() as u64;
        if self.position >= self.buffer_offset && self.position < end {
            let start = (self.position - self.buffer_offset) as usize;
            Some(&self.buffer[start..])
        } else {
            None
        }
    }

    fn fetch(&self) -> (u64, PendingFragment) {
        let reader = Arc::clone(&self.reader);
        let file_id = self.file_id;
        let offset = self.position;
        let count = (self.length - offset).min(self.buffer_size as u64) as usize;

        let future = Box::pin(async move { reader.read_fragment(file_id, offset, count).await });
        (offset, future)
    }
}

impl AsyncRead for BinaryReadStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if buf.remaining() == 0 || this.position >= this.length {
                return Poll::Ready(Ok(()));
            }

            if let Some(available) = this.buffered() {
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                this.position += n as u64;
                return Poll::Ready(Ok(()));
            }

            if this.pending.is_none() {
                this.pending = Some(this.fetch());
            }

            let Some((offset, future)) = this.pending.as_mut() else {
                continue;
            };

            match future.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => {
                    this.pending = None;
                    return Poll::Ready(Err(io::Error::other(e)));
                }
                Poll::Ready(Ok(bytes)) => {
                    let offset = *offset;
                    this.pending = None;

                    if bytes.is_empty() && offset == this.position {
                        // Stored binary is shorter than announced
                        this.length = this.position;
                        return Poll::Ready(Ok(()));
                    }

                    this.buffer_offset = offset;
                    this.buffer = bytes;
                }
            }
        }
    }
}

impl AsyncSeek for BinaryReadStream {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();

        let target = match position {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(n) => this.length.checked_add_signed(n),
            SeekFrom::Current(n) => this.position.checked_add_signed(n),
        };

        match target {
            Some(target) => {
                this.position = target;
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )),
        }
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.position))
    }
}
