//! Unix-socket transport with a descriptor side channel.
//!
//! The socket is nonblocking; reads happen on the event-loop thread and
//! writes on the sender thread. `close` shuts the socket down rather than
//! closing the descriptor, so a write racing the close fails with EPIPE
//! instead of touching a reused descriptor.

use std::io;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};

use sendfd::{RecvWithFd, SendWithFd};

use crate::wire::{LENGTH_PREFIX_SIZE, MessageBuffer};

/// Threshold above which an encoded message no longer fits the kernel
/// socket buffer and must travel inside a large-message wrapper.
pub const SOCKET_BUFFER_SIZE: usize = 32 * 1024;

const READ_CHUNK: usize = 4096;
const FDS_PER_READ: usize = 16;

/// Result of draining the transport without blocking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DrainStatus {
    Open,
    Eof,
}

pub struct TransportSocket {
    stream: UnixStream,
    open: AtomicBool,
}

impl TransportSocket {
    /// Wraps an already-connected stream, switching it to nonblocking mode.
    pub fn new(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self { stream, open: AtomicBool::new(true) })
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Shuts down both halves of the socket. Idempotent.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Blocks the calling thread until the socket is readable (or hung up).
    pub fn wait_until_readable(&self) {
        self.poll_for(libc::POLLIN);
    }

    fn poll_for(&self, events: libc::c_short) {
        let mut pollfd = libc::pollfd { fd: self.stream.as_raw_fd(), events, revents: 0 };
        loop {
            let rc = unsafe { libc::poll(&mut pollfd, 1, -1) };
            if rc >= 0 {
                return;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                kvlog::warn!("Transport poll failed", ?err);
                return;
            }
        }
    }

    /// Reads everything currently available, appending bytes and adopted
    /// descriptors to the output buffers. Never blocks.
    ///
    /// Returns [`DrainStatus::Eof`] once the peer has closed (a hard read
    /// error is logged and treated the same way).
    pub(crate) fn read_as_much_as_possible(&self, bytes: &mut Vec<u8>, fds: &mut Vec<OwnedFd>) -> DrainStatus {
        let mut chunk = [0u8; READ_CHUNK];
        let mut fd_buf = [0 as RawFd; FDS_PER_READ];
        loop {
            match self.stream.recv_with_fd(&mut chunk, &mut fd_buf) {
                Ok((0, 0)) => return DrainStatus::Eof,
                Ok((byte_count, fd_count)) => {
                    bytes.extend_from_slice(&chunk[..byte_count]);
                    for &raw in &fd_buf[..fd_count] {
                        unsafe {
                            libc::fcntl(raw, libc::F_SETFD, libc::FD_CLOEXEC);
                            fds.push(OwnedFd::from_raw_fd(raw));
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return DrainStatus::Open,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    kvlog::warn!("Transport read failed", ?err);
                    return DrainStatus::Eof;
                }
            }
        }
    }

    /// Writes the length prefix and body of one frame, attaching the
    /// buffer's descriptors to the first bytes that go out.
    ///
    /// Loops over short writes, waiting for writability as needed, until the
    /// frame is fully delivered or the socket fails.
    pub fn write_frame(&self, buffer: &MessageBuffer) -> io::Result<()> {
        let body = buffer.data();
        let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(body);

        let raw_fds: Vec<RawFd> = buffer.fds().iter().map(|fd| fd.as_raw_fd()).collect();
        let mut fds_pending = !raw_fds.is_empty();
        let mut written = 0;
        while written < frame.len() {
            let fds = if fds_pending { &raw_fds[..] } else { &[] };
            match self.stream.send_with_fd(&frame[written..], fds) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "socket closed mid-frame"));
                }
                Ok(count) => {
                    written += count;
                    fds_pending = false;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => self.poll_for(libc::POLLOUT),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Writes bytes with no framing. Test scaffolding for exercising
    /// partial frames and malformed input.
    #[cfg(test)]
    pub(crate) fn write_raw(&self, bytes: &[u8]) {
        let mut written = 0;
        while written < bytes.len() {
            match self.stream.send_with_fd(&bytes[written..], &[]) {
                Ok(count) => written += count,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => self.poll_for(libc::POLLOUT),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => panic!("raw write failed: {err}"),
            }
        }
    }
}
