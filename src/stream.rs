//! Byte-stream plumbing shared by the pipelines

use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf};

/// Any duplex byte stream the proxy can sit on: plain TCP, TLS, or a rewound wrapper.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Type-erased duplex stream
pub type BoxStream = Box<dyn AsyncStream>;

/// A stream that replays `prefix` before reading from `inner`.
///
/// Used to put sniffed bytes back in front of a connection, and to hand the bytes
/// buffered by an HTTP reader over to the WebSocket relay.
pub struct Rewind<S> {
  prefix: Option<Bytes>,
  inner: S,
}

impl<S> Rewind<S> {
  pub fn new(prefix: Bytes, inner: S) -> Self {
    let prefix = if prefix.is_empty() { None } else { Some(prefix) };
    Self { prefix, inner }
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    if let Some(mut prefix) = self.prefix.take() {
      if !prefix.is_empty() {
        let n = std::cmp::min(prefix.len(), buf.remaining());
        buf.put_slice(&prefix[..n]);
        prefix.advance(n);
        if !prefix.is_empty() {
          self.prefix = Some(prefix);
        }
        return Poll::Ready(Ok(()));
      }
    }
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
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
    bufs: &[io::IoSlice<'_>],
  ) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
  }

  fn is_write_vectored(&self) -> bool {
    self.inner.is_write_vectored()
  }
}

/// Turn a buffered reader back into a stream without losing its read-ahead
pub fn unbuffer<S>(reader: BufReader<S>) -> BoxStream
where
  S: AsyncStream + 'static,
{
  let buffered = Bytes::copy_from_slice(reader.buffer());
  Box::new(Rewind::new(buffered, reader.into_inner()))
}

/// Copy bytes both ways until either side closes. Returns the byte counts.
pub async fn splice<A, B>(mut a: A, mut b: B) -> (u64, u64)
where
  A: AsyncRead + AsyncWrite + Unpin,
  B: AsyncRead + AsyncWrite + Unpin,
{
  match tokio::io::copy_bidirectional(&mut a, &mut b).await {
    Ok(counts) => counts,
    Err(e) => {
      tracing::debug!("[MITM] spliced connection ended: {}", e);
      (0, 0)
    }
  }
}
