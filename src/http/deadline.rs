//! Read and write deadlines for a client connection.

use pin_project_lite::pin_project;
use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{sleep, Instant, Sleep},
};

pin_project! {
    /// Fails a read or write that makes no progress within `timeout`.
    ///
    /// A read deadline is armed when a read first goes pending and is pushed
    /// back whenever a write completes, so a long response being written out
    /// does not trip it. A stalled write has no such relief.
    pub struct Deadline<S> {
        #[pin]
        inner: S,
        timeout: Duration,
        read_deadline: Pin<Box<Sleep>>,
        write_deadline: Pin<Box<Sleep>>,
        reading: bool,
        writing: bool,
    }
}

impl<S> Deadline<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            read_deadline: Box::pin(sleep(timeout)),
            write_deadline: Box::pin(sleep(timeout)),
            reading: false,
            writing: false,
        }
    }
}

fn expired(
    deadline: &mut Pin<Box<Sleep>>,
    armed: &mut bool,
    timeout: Duration,
    cx: &mut Context<'_>,
) -> bool {
    if !*armed {
        *armed = true;
        deadline.as_mut().reset(Instant::now() + timeout);
    }
    deadline.as_mut().poll(cx).is_ready()
}

fn timed_out(op: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{op} timed out"))
}

impl<S: AsyncRead> AsyncRead for Deadline<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        match this.inner.poll_read(cx, buf) {
            Poll::Ready(result) => {
                *this.reading = false;
                Poll::Ready(result)
            }
            Poll::Pending => {
                if expired(this.read_deadline, this.reading, *this.timeout, cx) {
                    Poll::Ready(Err(timed_out("read")))
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

impl<S: AsyncWrite> Deadline<S> {
    fn poll_write_op<T>(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        op: impl FnOnce(Pin<&mut S>, &mut Context<'_>) -> Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>> {
        let this = self.project();
        match op(this.inner, cx) {
            Poll::Ready(result) => {
                *this.writing = false;
                if *this.reading {
                    this.read_deadline.as_mut().reset(Instant::now() + *this.timeout);
                }
                Poll::Ready(result)
            }
            Poll::Pending => {
                if expired(this.write_deadline, this.writing, *this.timeout, cx) {
                    Poll::Ready(Err(timed_out("write")))
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

impl<S: AsyncWrite> AsyncWrite for Deadline<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_write_op(cx, |inner, cx| inner.poll_write(cx, buf))
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.poll_write_op(cx, |inner, cx| inner.poll_write_vectored(cx, bufs))
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_write_op(cx, |inner, cx| inner.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_write_op(cx, |inner, cx| inner.poll_shutdown(cx))
    }
}
