use pin_project_lite::pin_project;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Sleep;

use crate::error::{BootError, Result};

/// Bound TCP listener. Bind failures carry the address so the fatal log
/// names the port that was taken.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|source| BootError::Bind { addr, source })?;
        let local_addr = inner
            .local_addr()
            .map_err(|source| BootError::Bind { addr, source })?;
        Ok(Self { inner, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept().await
    }
}

pin_project! {
    /// Stream wrapper enforcing per-direction idle deadlines. A read or
    /// write that makes no progress within its timeout fails with
    /// `ErrorKind::TimedOut`; any progress re-arms the clock.
    pub struct TimedStream<S> {
        #[pin]
        inner: S,
        read_timeout: Duration,
        write_timeout: Duration,
        #[pin]
        read_deadline: Option<Sleep>,
        #[pin]
        write_deadline: Option<Sleep>,
    }
}

impl<S> TimedStream<S> {
    pub fn new(inner: S, read_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            inner,
            read_timeout,
            write_timeout,
            read_deadline: None,
            write_deadline: None,
        }
    }
}

impl<S: AsyncRead> AsyncRead for TimedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        match this.inner.poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read_deadline.set(None);
                Poll::Ready(result)
            }
            Poll::Pending => {
                if this.read_deadline.is_none() {
                    this.read_deadline
                        .set(Some(tokio::time::sleep(*this.read_timeout)));
                }
                if let Some(deadline) = this.read_deadline.as_mut().as_pin_mut() {
                    if deadline.poll(cx).is_ready() {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "read timed out",
                        )));
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl<S: AsyncWrite> AsyncWrite for TimedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();
        match this.inner.poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_deadline.set(None);
                Poll::Ready(result)
            }
            Poll::Pending => {
                if this.write_deadline.is_none() {
                    this.write_deadline
                        .set(Some(tokio::time::sleep(*this.write_timeout)));
                }
                if let Some(deadline) = this.write_deadline.as_mut().as_pin_mut() {
                    if deadline.poll(cx).is_ready() {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "write timed out",
                        )));
                    }
                }
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
