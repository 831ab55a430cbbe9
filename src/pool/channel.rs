//! Wire protocol over a worker's socket-pair endpoint.
//!
//! Frames are `[4-byte big-endian length][deflate-compressed JSON message]`.
//! One frame carries exactly one [`Message`]; the two directions alternate
//! strictly, so a reader never has to resynchronize mid-stream.
//!
//! A transport failure here (short read or write, broken pipe) has no
//! recovery path: the channel is a point-to-point socket pair with no
//! redundancy, so callers escalate through [`fatal`] and terminate the
//! owning process instead of retrying.

use std::io::{Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::Duration;

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};

use super::message::Message;
use crate::error::{PoolError, Result};

/// Upper bound on a single compressed frame (16 MiB).
///
/// A length prefix beyond this is treated as stream corruption rather than
/// an allocation request.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// One end of a worker's bidirectional byte stream.
///
/// Exclusively owned: the parent image holds one endpoint, the child image
/// the other, and nothing else in the process writes to it. Dropping the
/// channel closes the endpoint.
pub struct Channel {
    fd: OwnedFd,
}

impl Channel {
    /// Create a connected pair of channels (one per future process image).
    pub fn pair() -> Result<(Channel, Channel)> {
        let (first, second) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )?;
        Ok((Channel { fd: first }, Channel { fd: second }))
    }

    /// Encode and write one message as a single frame.
    pub fn send(&mut self, message: &Message) -> Result<()> {
        let raw = serde_json::to_vec(message)?;

        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        let payload = encoder.finish()?;

        if payload.len() > MAX_FRAME_BYTES {
            return Err(PoolError::FrameTooLarge(payload.len()));
        }

        // Length prefix first, payload second, as two writes.
        let prefix = (payload.len() as u32).to_be_bytes();
        self.write_exact(&prefix)?;
        self.write_exact(&payload)
    }

    /// Read one frame and decode the message it carries.
    ///
    /// EOF on a frame boundary (the peer hung up between messages) is
    /// reported as [`PoolError::Disconnected`]; EOF mid-frame is a short
    /// read like any other.
    pub fn receive(&mut self) -> Result<Message> {
        let mut prefix = [0u8; 4];
        match self.read_exact(&mut prefix) {
            Err(PoolError::ShortTransfer { actual: 0, .. }) => {
                return Err(PoolError::Disconnected);
            }
            other => other?,
        }

        let length = u32::from_be_bytes(prefix) as usize;
        if length > MAX_FRAME_BYTES {
            return Err(PoolError::FrameTooLarge(length));
        }

        let mut payload = vec![0u8; length];
        self.read_exact(&mut payload)?;

        let mut raw = Vec::new();
        DeflateDecoder::new(payload.as_slice()).read_to_end(&mut raw)?;

        Ok(serde_json::from_slice(&raw)?)
    }

    /// Wait up to `timeout` for the channel to become readable.
    pub fn poll_readable(&self, timeout: Duration) -> Result<bool> {
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        loop {
            match poll(&mut fds, to_poll_timeout(timeout)) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(readable(&fds[0])),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Write the whole buffer, retrying on `EINTR`.
    fn write_exact(&mut self, buf: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < buf.len() {
            match nix::unistd::write(&self.fd, &buf[written..]) {
                Ok(0) => return Err(PoolError::short_write(buf.len(), written)),
                Ok(n) => written += n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Fill the whole buffer, retrying on `EINTR`. EOF mid-frame is a short read.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match nix::unistd::read(self.fd.as_raw_fd(), &mut buf[filled..]) {
                Ok(0) => return Err(PoolError::short_read(buf.len(), filled)),
                Ok(n) => filled += n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd.as_raw_fd())
            .finish()
    }
}

/// Clamp a duration into a `poll(2)` timeout.
pub(crate) fn to_poll_timeout(timeout: Duration) -> PollTimeout {
    let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
    PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
}

/// POLLIN, or a hangup/error that a read would observe as EOF.
pub(crate) fn readable(fd: &PollFd) -> bool {
    fd.revents().is_some_and(|revents| {
        revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
    })
}

/// Log a transport failure and terminate the owning process.
///
/// The channel has no reconnection concept, so any I/O failure on it is
/// unrecoverable for the process that owns the endpoint.
pub(crate) fn fatal(context: &str, error: &PoolError) -> ! {
    tracing::error!(context, %error, "channel transport failure, terminating");
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::runnable::JobSpec;
    use crate::pool::worker::WorkerStatus;
    use serde_json::json;

    fn connected() -> (Channel, Channel) {
        Channel::pair().expect("socketpair failed")
    }

    #[test]
    fn test_roundtrip_every_variant() {
        let (mut a, mut b) = connected();

        let messages = [
            Message::status(10, WorkerStatus::Running),
            Message::dispatch(10, JobSpec::with_params("scan", json!({ "depth": 3 }))),
            Message::callback(10, "notify", vec![json!("ok")]),
            Message::keepalive(10),
            Message::log(10, "roundtrip"),
        ];

        for message in &messages {
            a.send(message).unwrap();
            let received = b.receive().unwrap();
            assert_eq!(
                serde_json::to_value(&received).unwrap(),
                serde_json::to_value(message).unwrap()
            );
        }
    }

    #[test]
    fn test_frame_layout_is_length_prefixed_deflate() {
        let (mut a, b) = connected();
        let message = Message::log(1, "layout check");
        a.send(&message).unwrap();

        // Decode the frame by hand on the raw peer fd.
        let mut prefix = [0u8; 4];
        let n = nix::unistd::read(b.fd.as_raw_fd(), &mut prefix).unwrap();
        assert_eq!(n, 4);
        let length = u32::from_be_bytes(prefix) as usize;

        let mut payload = vec![0u8; length];
        let mut filled = 0;
        while filled < length {
            filled += nix::unistd::read(b.fd.as_raw_fd(), &mut payload[filled..]).unwrap();
        }

        let mut raw = Vec::new();
        DeflateDecoder::new(payload.as_slice())
            .read_to_end(&mut raw)
            .unwrap();
        let parsed: Message = serde_json::from_slice(&raw).unwrap();
        assert!(matches!(parsed, Message::Log { pid: 1, .. }));
    }

    #[test]
    fn test_alternating_send_receive_both_directions() {
        let (mut a, mut b) = connected();

        a.send(&Message::keepalive(1)).unwrap();
        assert!(matches!(b.receive().unwrap(), Message::KeepAlive { pid: 1 }));

        b.send(&Message::keepalive(2)).unwrap();
        assert!(matches!(a.receive().unwrap(), Message::KeepAlive { pid: 2 }));
    }

    #[test]
    fn test_receive_after_peer_close_is_disconnect() {
        let (a, mut b) = connected();
        drop(a);

        assert!(matches!(b.receive(), Err(PoolError::Disconnected)));
    }

    #[test]
    fn test_peer_close_mid_frame_is_short_read() {
        let (a, mut b) = connected();

        // Write a length prefix announcing a frame that never arrives.
        nix::unistd::write(&a.fd, &8u32.to_be_bytes()).unwrap();
        drop(a);

        match b.receive() {
            Err(PoolError::ShortTransfer { direction, .. }) => assert_eq!(direction, "read"),
            other => panic!("Expected short read, got {:?}", other),
        }
    }

    #[test]
    fn test_send_after_peer_close_fails() {
        let (mut a, b) = connected();
        drop(b);

        // The test harness (like any Rust binary) ignores SIGPIPE, so the
        // failed write surfaces as EPIPE.
        assert!(a.send(&Message::keepalive(3)).is_err());
    }

    #[test]
    fn test_poll_readable_reports_pending_frame() {
        let (mut a, b) = connected();
        assert!(!b.poll_readable(Duration::from_millis(0)).unwrap());

        a.send(&Message::keepalive(4)).unwrap();
        assert!(b.poll_readable(Duration::from_millis(100)).unwrap());
    }

    #[test]
    fn test_large_message_survives_compression() {
        let (mut a, mut b) = connected();
        let text = "x".repeat(256 * 1024);
        a.send(&Message::log(5, text.clone())).unwrap();
        match b.receive().unwrap() {
            Message::Log { text: received, .. } => assert_eq!(received.len(), text.len()),
            other => panic!("Expected Log, got {:?}", other),
        }
    }
}
