//! Signal plumbing shared by the parent and child process images.
//!
//! Five signal roles coordinate the pool: SIGUSR1 "child notifying parent",
//! SIGUSR2 "parent dispatched work", SIGCHLD "child exited", SIGTERM/SIGINT
//! termination, and SIGHUP diagnostics. Delivery is decoupled from handling
//! with a self-pipe: the `sigaction` handler only writes the signal number
//! to a non-blocking pipe, and the owning process's event loop drains the
//! pipe and runs the real handling on its main control flow. Nothing ever
//! blocks inside handler context.

use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{PollFd, PollFlags, poll};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::sys::wait::WaitStatus;
use nix::unistd::pipe2;

use super::channel::{readable, to_poll_timeout};
use crate::error::Result;

/// Child → parent: a message is waiting on the child's channel.
pub const NOTIFY_SIGNAL: Signal = Signal::SIGUSR1;

/// Parent → child: a dispatch message is waiting on the worker's channel.
pub const DISPATCH_SIGNAL: Signal = Signal::SIGUSR2;

/// Diagnostic dump request.
pub const DIAGNOSTIC_SIGNAL: Signal = Signal::SIGHUP;

/// Write end of the active self-pipe, or -1 before installation.
///
/// Process-global because signal dispositions are process-global. A fork
/// image installs its own pipe, which replaces the inherited value.
static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// The `sigaction` handler: forward the signal number into the pipe.
///
/// Restricted to async-signal-safe work: a single `write(2)`. A full pipe
/// drops the byte, which is fine since signal delivery already coalesces.
extern "C" fn forward_to_pipe(signo: nix::libc::c_int) {
    let fd = PIPE_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = [signo as u8];
        let _ = nix::unistd::write(unsafe { BorrowedFd::borrow_raw(fd) }, &byte);
    }
}

/// Read end of the self-pipe plus drain/wait operations.
///
/// One live pipe per process image: installing a new one (as a freshly
/// forked child does) supersedes the inherited one.
#[derive(Debug)]
pub struct SignalPipe {
    read: OwnedFd,
}

impl SignalPipe {
    /// Create the pipe and route `signals` into it.
    pub fn install(signals: &[Signal]) -> Result<SignalPipe> {
        let (read, write) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;

        let previous = PIPE_WRITE_FD.swap(write.into_raw_fd(), Ordering::SeqCst);
        if previous >= 0 {
            // Superseded pipe from before a fork; close our copy of it.
            drop(unsafe { OwnedFd::from_raw_fd(previous) });
        }

        let action = SigAction::new(
            SigHandler::Handler(forward_to_pipe),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for signal in signals {
            // Safety: the handler only performs an async-signal-safe write.
            unsafe { sigaction(*signal, &action)? };
        }

        Ok(SignalPipe { read })
    }

    /// Parent-side installation: notify, child-exit, termination, diagnostic.
    pub fn install_parent() -> Result<SignalPipe> {
        SignalPipe::install(&[
            NOTIFY_SIGNAL,
            Signal::SIGCHLD,
            Signal::SIGTERM,
            Signal::SIGINT,
            DIAGNOSTIC_SIGNAL,
        ])
    }

    /// Child-side installation: dispatch, termination, diagnostic.
    ///
    /// Also ignores SIGPIPE so a parent that closed its endpoint surfaces
    /// as an I/O error instead of killing the worker silently.
    pub fn install_child() -> Result<SignalPipe> {
        let pipe = SignalPipe::install(&[
            DISPATCH_SIGNAL,
            Signal::SIGTERM,
            Signal::SIGINT,
            DIAGNOSTIC_SIGNAL,
        ])?;
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        unsafe { sigaction(Signal::SIGPIPE, &ignore)? };
        Ok(pipe)
    }

    /// Block up to `timeout` for at least one pending signal.
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        let mut fds = [PollFd::new(self.read.as_fd(), PollFlags::POLLIN)];
        loop {
            match poll(&mut fds, to_poll_timeout(timeout)) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(readable(&fds[0])),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Drain every queued signal number without blocking.
    pub fn drain(&self) -> Vec<Signal> {
        let mut pending = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match nix::unistd::read(self.read.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for &byte in &buf[..n] {
                        if let Ok(signal) = Signal::try_from(byte as i32) {
                            pending.push(signal);
                        }
                    }
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
        pending
    }
}

/// Why a reaped child left the pool, derived from its wait status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(Signal),
    /// The wait status did not describe a termination.
    Unknown,
}

impl ExitReason {
    /// Derive the reason from a `waitpid` status.
    pub fn from_wait(status: WaitStatus) -> ExitReason {
        match status {
            WaitStatus::Exited(_, code) => ExitReason::Exited(code),
            WaitStatus::Signaled(_, signal, _) => ExitReason::Signaled(signal),
            _ => ExitReason::Unknown,
        }
    }

    /// True for a plain zero-status exit.
    pub fn is_clean(&self) -> bool {
        matches!(self, ExitReason::Exited(0))
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Exited(0) => write!(f, "exited normally"),
            ExitReason::Exited(code) => write!(f, "exited with code {}", code),
            ExitReason::Signaled(signal) => write!(f, "killed by signal {:?}", signal),
            ExitReason::Unknown => write!(f, "left an unrecognized wait status"),
        }
    }
}
