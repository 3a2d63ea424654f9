//! Bounded single-producer/single-consumer byte pipe.
//!
//! Stages of a transfer run as separate tasks joined by a pipe. The channel
//! holds a fixed number of frames, so a fast producer blocks until the
//! consumer catches up and memory stays bounded regardless of object size.
//!
//! End of stream is explicit: the writer must be shut down to deliver it.
//! A writer that is dropped without shutting down (because its stage
//! failed) makes the reader fail with `BrokenPipe` instead of reporting a
//! clean, shorter stream.

use bytes::Bytes;
use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::mpsc,
};
use tokio_util::sync::PollSender;

/// Frames in flight per pipe.
pub const DEFAULT_PIPE_FRAMES: usize = 16;

/// Largest frame the writer emits; bigger writes are split.
const MAX_FRAME_LEN: usize = 256 * 1024;

enum Frame {
    Data(Bytes),
    End,
}

/// Create a pipe holding at most `frames` frames.
pub fn pipe(frames: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(frames.max(1));
    (
        PipeWriter {
            sender: PollSender::new(tx),
            closed: false,
        },
        PipeReader {
            receiver: rx,
            current: Bytes::new(),
            finished: false,
        },
    )
}

pub struct PipeWriter {
    sender: PollSender<Frame>,
    closed: bool,
}

pub struct PipeReader {
    receiver: mpsc::Receiver<Frame>,
    current: Bytes,
    finished: bool,
}

fn reader_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed")
}

fn writer_gone() -> io::Error {
    io::Error::new(
        io::ErrorKind::BrokenPipe,
        "pipe writer closed before end of stream",
    )
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after shutdown",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(this.sender.poll_reserve(cx)).map_err(|_| reader_gone())?;
        let len = buf.len().min(MAX_FRAME_LEN);
        this.sender
            .send_item(Frame::Data(Bytes::copy_from_slice(&buf[..len])))
            .map_err(|_| reader_gone())?;
        Poll::Ready(Ok(len))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Ok(()));
        }
        ready!(this.sender.poll_reserve(cx)).map_err(|_| reader_gone())?;
        this.sender
            .send_item(Frame::End)
            .map_err(|_| reader_gone())?;
        this.sender.close();
        this.closed = true;
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.current.is_empty() {
                let len = this.current.len().min(buf.remaining());
                buf.put_slice(&this.current.split_to(len));
                return Poll::Ready(Ok(()));
            }
            if this.finished {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.receiver.poll_recv(cx)) {
                Some(Frame::Data(bytes)) => this.current = bytes,
                Some(Frame::End) => {
                    this.finished = true;
                    this.receiver.close();
                }
                None => return Poll::Ready(Err(writer_gone())),
            }
        }
    }
}

/// True when `err` only reports that the other end of a pipe went away.
pub fn is_broken_pipe(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::BrokenPipe
}
