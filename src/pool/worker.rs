//! One OS process participating in the pool.
//!
//! A `Worker` is forked from the parent: construction allocates an identity
//! and a socket pair, then `fork(2)` splits the handle into two diverging
//! views of the same logical worker. The parent image keeps one channel
//! endpoint and the child's pid; the child image keeps the other endpoint,
//! installs its signal handlers, and enters the idle loop, never returning
//! to the caller.

use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use nix::sys::signal::kill;
use nix::unistd::{ForkResult, Pid, fork, getpid, getppid};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::channel::{self, Channel};
use super::message::Message;
use super::runnable::{JobSpec, RunnableRegistry};
use super::signals::{DIAGNOSTIC_SIGNAL, DISPATCH_SIGNAL, NOTIFY_SIGNAL, SignalPipe};
use crate::error::{PoolError, Result};

/// How long a worker waits for the dispatch frame its wake-up signal
/// announced before writing the signal off as spurious.
const DISPATCH_WAIT: Duration = Duration::from_secs(5);

/// Idle main-loop nap between signal checks.
const IDLE_NAP: Duration = Duration::from_secs(1);

/// Process-unique worker identity, assigned before the fork and therefore
/// identical in both process images. Independent of the OS pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(Uuid);

impl WorkerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Worker lifecycle state.
///
/// `Running` holds only while a job executes; `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// A pool process and the current image's handle to it.
///
/// `parent_pid == 0` marks the parent-side view; the child-side view holds
/// the real parent pid and uses it as the notify target.
pub struct Worker {
    id: WorkerId,
    name: Option<String>,
    pid: Pid,
    parent_pid: Pid,
    status: WorkerStatus,
    channel: Option<Channel>,
    current_job: Option<JobSpec>,
    last_seen: Option<Instant>,
}

impl Worker {
    /// Fork a new worker process.
    ///
    /// Returns the parent-side view. The child image never returns from
    /// this call: it installs its signal handlers before anything else,
    /// then parks in the idle loop until terminated.
    pub fn spawn(name: Option<String>, runnables: &RunnableRegistry) -> Result<Worker> {
        let id = WorkerId::new();
        let (parent_end, child_end) = Channel::pair()?;

        // Safety: the pool confines itself to one control flow per process,
        // so there are no other threads to leave locks poisoned in the child.
        match unsafe { fork() }.map_err(PoolError::Fork)? {
            ForkResult::Parent { child } => {
                drop(child_end);
                Ok(Worker {
                    id,
                    name,
                    pid: child,
                    parent_pid: Pid::from_raw(0),
                    status: WorkerStatus::Idle,
                    channel: Some(parent_end),
                    current_job: None,
                    last_seen: None,
                })
            }
            ForkResult::Child => {
                // Handlers must exist before an eager parent can dispatch.
                let pipe = match SignalPipe::install_child() {
                    Ok(pipe) => pipe,
                    Err(error) => {
                        tracing::error!(%error, "worker signal setup failed");
                        std::process::exit(1);
                    }
                };
                drop(parent_end);
                let worker = Worker {
                    id,
                    name,
                    pid: getpid(),
                    parent_pid: getppid(),
                    status: WorkerStatus::Idle,
                    channel: Some(child_end),
                    current_job: None,
                    last_seen: None,
                };
                worker.idle(pipe, runnables)
            }
        }
    }

    /// Process-unique identity.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Optional human-readable name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The worker process's pid (in the parent image: the child's pid).
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Zero in the parent image, the parent's pid in the child image.
    pub fn parent_pid(&self) -> Pid {
        self.parent_pid
    }

    /// Current lifecycle state as locally observed.
    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    /// True in the child process image.
    fn is_child(&self) -> bool {
        self.parent_pid.as_raw() != 0
    }

    /// True when the last observed status is `Idle`.
    pub fn is_idle(&self) -> bool {
        self.status == WorkerStatus::Idle
    }

    /// True when the last observed status is `Running`.
    pub fn is_running(&self) -> bool {
        self.status == WorkerStatus::Running
    }

    /// True when the worker has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.status == WorkerStatus::Stopped
    }

    /// True while the channel endpoint is open.
    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    /// Raw fd of the open channel, for multiplexed readiness checks.
    pub(crate) fn channel_fd(&self) -> Option<RawFd> {
        self.channel.as_ref().map(Channel::as_raw_fd)
    }

    /// When the parent last received any message from this worker.
    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }

    /// Stamp liveness; called by the parent for every received message.
    pub(crate) fn touch(&mut self) {
        self.last_seen = Some(Instant::now());
    }

    /// Drop the channel endpoint after the peer hung up. The registry
    /// entry and status are left as they are.
    pub(crate) fn close_channel(&mut self) {
        self.channel = None;
    }

    /// Read one message off this worker's channel.
    pub(crate) fn receive(&mut self) -> Result<Message> {
        match self.channel.as_mut() {
            Some(channel) => channel.receive(),
            None => Err(PoolError::ChannelClosed),
        }
    }

    /// Transition to `status`.
    ///
    /// In the child image the parent is notified first (status frame plus
    /// notify signal) and the local field is updated after, so the parent
    /// may observe the transition fractionally before the child's own next
    /// decision point reflects it.
    pub fn set_status(&mut self, status: WorkerStatus) {
        if self.is_child() && self.has_channel() {
            let message = Message::status(self.pid.as_raw(), status);
            self.notify_parent("status", &message);
        }
        self.status = status;
    }

    /// Dispatch a job to the worker process.
    ///
    /// Caller enforces the precondition that the worker is idle; this does
    /// not re-check before overwriting whatever the child holds. Parent
    /// image only.
    pub fn execute(&mut self, job: JobSpec) {
        self.set_status(WorkerStatus::Running);

        let message = Message::dispatch(self.pid.as_raw(), job);
        match self.channel.as_mut() {
            Some(channel) => {
                if let Err(error) = channel.send(&message) {
                    channel::fatal("dispatch", &error);
                }
            }
            None => channel::fatal("dispatch", &PoolError::ChannelClosed),
        }

        // A worker that died since the last reap is reported via SIGCHLD,
        // not here.
        if let Err(error) = kill(self.pid, DISPATCH_SIGNAL) {
            tracing::debug!(pid = self.pid.as_raw(), %error, "dispatch signal not delivered");
        }
    }

    /// Close the channel and mark the worker stopped.
    ///
    /// Does not kill the OS process; termination follows from the closed
    /// channel or a later termination signal.
    pub fn stop(&mut self) {
        self.set_status(WorkerStatus::Stopping);
        self.channel = None;
        self.set_status(WorkerStatus::Stopped);
    }

    /// Ask the parent to invoke a named operation. Child image only.
    pub fn callback(&mut self, callable: impl Into<String>, parameters: Vec<serde_json::Value>) {
        if !self.is_child() {
            return;
        }
        let message = Message::callback(self.pid.as_raw(), callable, parameters);
        self.notify_parent("callback", &message);
    }

    /// Send a heartbeat to the parent. Child image only.
    pub fn keepalive(&mut self) {
        if !self.is_child() {
            return;
        }
        let message = Message::keepalive(self.pid.as_raw());
        self.notify_parent("keepalive", &message);
    }

    /// Surface a log line in the parent. Child image only.
    pub fn log(&mut self, text: impl Into<String>) {
        if !self.is_child() {
            return;
        }
        let message = Message::log(self.pid.as_raw(), text);
        self.notify_parent("log", &message);
    }

    /// Write a frame to the parent and raise the notify signal.
    fn notify_parent(&mut self, context: &str, message: &Message) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        if let Err(error) = channel.send(message) {
            channel::fatal(context, &error);
        }
        if let Err(error) = kill(self.parent_pid, NOTIFY_SIGNAL) {
            tracing::debug!(ppid = self.parent_pid.as_raw(), %error, "notify signal not delivered");
        }
    }

    /// Child main loop: execute whatever the dispatch handler stored,
    /// otherwise nap until a signal arrives.
    ///
    /// Work only ever executes here, on the main flow. The signal path
    /// merely receives and stores the job, so a handler can never re-enter
    /// running application code.
    fn idle(mut self, pipe: SignalPipe, runnables: &RunnableRegistry) -> ! {
        tracing::debug!(
            worker_id = %self.id,
            pid = self.pid.as_raw(),
            "worker entering idle loop"
        );

        loop {
            if let Some(job) = self.current_job.take() {
                self.run_job(job, runnables);
                self.set_status(WorkerStatus::Idle);
            } else {
                match pipe.wait(IDLE_NAP) {
                    Ok(true) => self.handle_signals(&pipe),
                    Ok(false) => {}
                    Err(error) => {
                        tracing::error!(%error, "worker signal wait failed");
                        std::process::exit(1);
                    }
                }
            }
        }
    }

    /// Resolve and execute one dispatched job.
    fn run_job(&mut self, job: JobSpec, runnables: &RunnableRegistry) {
        let Some(runnable) = runnables.get(job.name()) else {
            self.log(format!("no runnable registered under {:?}", job.name()));
            return;
        };

        tracing::debug!(worker_id = %self.id, job = job.name(), "job starting");
        if let Err(error) = runnable.run(self, job.params()) {
            self.log(format!("job {:?} failed: {}", job.name(), error));
        }
    }

    /// Drain and act on pending signals. Runs on the main flow, never in
    /// handler context.
    fn handle_signals(&mut self, pipe: &SignalPipe) {
        for signal in pipe.drain() {
            match signal {
                DISPATCH_SIGNAL => self.receive_dispatch(),
                nix::sys::signal::Signal::SIGTERM | nix::sys::signal::Signal::SIGINT => {
                    tracing::debug!(worker_id = %self.id, %signal, "worker terminating");
                    std::process::exit(0);
                }
                DIAGNOSTIC_SIGNAL => {
                    tracing::info!(
                        worker_id = %self.id,
                        pid = self.pid.as_raw(),
                        status = %self.status,
                        "worker diagnostic poke"
                    );
                }
                _ => {}
            }
        }
    }

    /// The dispatch signal said a frame is waiting: wait a bounded time
    /// for the channel to become readable and store the job if one arrives.
    /// Any variant other than a dispatch is ignored here.
    fn receive_dispatch(&mut self) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };

        match channel.poll_readable(DISPATCH_WAIT) {
            Ok(true) => match channel.receive() {
                Ok(Message::Dispatch { job, .. }) => self.current_job = Some(job),
                Ok(other) => {
                    tracing::debug!(kind = other.kind(), "ignoring non-dispatch message");
                }
                Err(error) => channel::fatal("dispatch receive", &error),
            },
            Ok(false) => {
                tracing::debug!(worker_id = %self.id, "dispatch signal without a frame");
            }
            Err(error) => channel::fatal("dispatch poll", &error),
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pid", &self.pid.as_raw())
            .field("parent_pid", &self.parent_pid.as_raw())
            .field("status", &self.status)
            .field("channel", &self.channel)
            .finish()
    }
}

#[cfg(test)]
impl Worker {
    /// Parent-side view over a live channel with no forked process behind
    /// it; the peer endpoint is returned so tests can speak for the child.
    pub(crate) fn stub_with_peer(name: Option<&str>, status: WorkerStatus) -> (Worker, Channel) {
        let (parent_end, child_end) = Channel::pair().expect("socketpair failed");
        let worker = Worker {
            id: WorkerId::new(),
            name: name.map(String::from),
            pid: getpid(),
            parent_pid: Pid::from_raw(0),
            status,
            channel: Some(parent_end),
            current_job: None,
            last_seen: None,
        };
        (worker, child_end)
    }

    /// Parent-side view with the peer endpoint already dropped.
    pub(crate) fn stub(name: Option<&str>, status: WorkerStatus) -> Worker {
        Worker::stub_with_peer(name, status).0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    /// Stub workers carry the test process's own pid, so a dispatch would
    /// raise SIGUSR2 at the test runner. Park it on ignore first.
    fn ignore_dispatch_signal() {
        use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        unsafe { sigaction(Signal::SIGUSR2, &ignore) }.unwrap();
    }

    #[test]
    fn test_status_predicates() {
        let worker = Worker::stub(None, WorkerStatus::Idle);
        assert!(worker.is_idle());
        assert!(!worker.is_running());
        assert!(!worker.is_stopped());
    }

    #[test]
    fn test_parent_side_set_status_is_local_only() {
        let (mut worker, peer) = Worker::stub_with_peer(None, WorkerStatus::Idle);
        worker.set_status(WorkerStatus::Running);
        assert!(worker.is_running());

        // Nothing was written: the parent image never notifies.
        assert!(!peer.poll_readable(Duration::from_millis(0)).unwrap());
    }

    #[test]
    fn test_worker_side_helpers_are_noops_in_parent() {
        let (mut worker, peer) = Worker::stub_with_peer(None, WorkerStatus::Idle);
        worker.log("ignored");
        worker.keepalive();
        worker.callback("cb", vec![]);
        assert!(!peer.poll_readable(Duration::from_millis(0)).unwrap());
    }

    #[test]
    #[serial]
    fn test_execute_writes_dispatch_frame() {
        ignore_dispatch_signal();
        let (mut worker, mut peer) = Worker::stub_with_peer(None, WorkerStatus::Idle);
        worker.execute(JobSpec::new("scan"));
        assert!(worker.is_running());

        match peer.receive().unwrap() {
            Message::Dispatch { job, .. } => assert_eq!(job.name(), "scan"),
            other => panic!("Expected Dispatch, got {:?}", other),
        }
    }

    #[test]
    fn test_stop_closes_channel_and_is_terminal() {
        let mut worker = Worker::stub(None, WorkerStatus::Idle);
        assert!(worker.has_channel());

        worker.stop();
        assert!(worker.is_stopped());
        assert!(!worker.has_channel());
        assert!(worker.channel_fd().is_none());
        assert!(matches!(worker.receive(), Err(PoolError::ChannelClosed)));
    }

    #[test]
    fn test_stop_observed_as_hangup_by_peer() {
        let (mut worker, mut peer) = Worker::stub_with_peer(None, WorkerStatus::Idle);
        worker.stop();

        assert!(matches!(peer.receive(), Err(PoolError::Disconnected)));
    }

    #[test]
    fn test_touch_updates_last_seen() {
        let mut worker = Worker::stub(None, WorkerStatus::Idle);
        assert!(worker.last_seen().is_none());
        worker.touch();
        assert!(worker.last_seen().is_some());
    }

    #[test]
    fn test_worker_ids_are_distinct() {
        let a = Worker::stub(None, WorkerStatus::Idle);
        let b = Worker::stub(None, WorkerStatus::Idle);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_status_serde_is_lowercase() {
        let raw = serde_json::to_string(&WorkerStatus::Running).unwrap();
        assert_eq!(raw, r#""running""#);
        let parsed: WorkerStatus = serde_json::from_str(r#""stopped""#).unwrap();
        assert_eq!(parsed, WorkerStatus::Stopped);
    }
}
