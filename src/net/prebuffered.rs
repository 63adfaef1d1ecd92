//! A read-ahead buffer in front of a client socket.
//!
//! The dispatcher reads a request head before deciding who owns the
//! connection. [`Prebuffered`] keeps those bytes and replays them to
//! whoever reads next, so nothing read ahead is lost on hand-off.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

const INITIAL_CAPACITY: usize = 4 * 1024;

/// A stream with manually filled read-ahead.
#[derive(Debug)]
pub struct Prebuffered<S> {
    inner: S,
    buf: BytesMut,
    max_len: usize,
}

impl<S> Prebuffered<S> {
    /// Wrap `inner`; [`buffer_more`](Self::buffer_more) holds at most `max_len` bytes.
    pub fn new(inner: S, max_len: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY.min(max_len)),
            max_len,
        }
    }

    /// Bytes read ahead but not yet consumed.
    pub fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.max_len
    }

    /// Drop `n` bytes from the front of the buffer.
    pub fn discard(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        let _ = self.buf.split_to(n);
    }

    /// Push `bytes` back in front of whatever is still buffered.
    pub fn unread(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        let mut buf = BytesMut::with_capacity(bytes.len() + self.buf.len());
        buf.put(bytes);
        buf.put(self.buf.split());
        self.buf = buf;
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> Prebuffered<S> {
    /// Read more data from the inner stream into the buffer.
    ///
    /// Returns `UnexpectedEof` if the stream ends first.
    pub async fn buffer_more(&mut self) -> io::Result<usize> {
        let max = self.max_len.saturating_sub(self.buf.len());
        let n = (&mut self.inner)
            .take(max as u64)
            .read_buf(&mut self.buf)
            .await?;
        if n == 0 && max > 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(n)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prebuffered<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if out.remaining() == 0 {
            Poll::Ready(Ok(()))
        } else if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.inner).poll_read(cx, out)
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prebuffered<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
