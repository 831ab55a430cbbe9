//! Pool sizing, scheduling, and parent-side signal dispatch.
//!
//! The pool owns the worker registry and both operation registries, and
//! runs the parent's event loop: signals delivered by the kernel are
//! queued on a self-pipe and handled here on the main control flow, so
//! handling code is free to allocate, log, and touch the registry. The
//! only suspension is a zero-timeout readiness sweep across worker
//! channels; nothing in the dispatch path blocks indefinitely.

use std::os::unix::io::{BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use super::channel::{self, readable};
use super::message::Message;
use super::registry::WorkerRegistry;
use super::runnable::{CallbackRegistry, JobSpec, RunnableRegistry};
use super::signals::{DIAGNOSTIC_SIGNAL, ExitReason, NOTIFY_SIGNAL, SignalPipe};
use super::worker::{Worker, WorkerId};
use crate::error::{PoolError, Result};

/// Pool construction parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker processes to fork.
    pub size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { size: 4 }
    }
}

/// A fixed-size pool of forked worker processes.
///
/// One pool per process: construction installs the parent's process-global
/// signal handlers.
pub struct Pool {
    config: PoolConfig,
    registry: WorkerRegistry,
    runnables: RunnableRegistry,
    callbacks: CallbackRegistry,
    signals: SignalPipe,
}

impl Pool {
    /// Create a pool and install the parent-side signal handlers.
    ///
    /// Both registries must be fully populated here, before [`Pool::start`]
    /// forks: workers inherit the runnable registry through the fork image.
    pub fn new(
        config: PoolConfig,
        runnables: RunnableRegistry,
        callbacks: CallbackRegistry,
    ) -> Result<Self> {
        let signals = SignalPipe::install_parent()?;
        Ok(Self {
            config,
            registry: WorkerRegistry::new(),
            runnables,
            callbacks,
            signals,
        })
    }

    /// Configured worker count.
    pub fn size(&self) -> usize {
        self.config.size
    }

    /// The live worker registry.
    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Fork workers until the registry holds the configured count.
    ///
    /// Only the parent returns from this loop; each freshly forked child
    /// enters its idle loop inside [`Worker::spawn`] and never comes back.
    /// A fork failure is returned to the caller; workers already forked
    /// stay registered.
    pub fn start(&mut self) -> Result<()> {
        while self.registry.len() < self.config.size {
            let name = format!("worker-{}", self.registry.len());
            let worker = Worker::spawn(Some(name), &self.runnables)?;
            tracing::info!(
                worker_id = %worker.id(),
                pid = worker.pid().as_raw(),
                "worker forked"
            );
            self.registry.add(worker);
        }
        tracing::info!(workers = self.registry.len(), "pool started");
        Ok(())
    }

    /// Remove and stop every registered worker.
    pub fn stop(&mut self) {
        tracing::info!(workers = self.registry.len(), "pool stopping");
        for mut worker in self.registry.drain() {
            worker.stop();
        }
    }

    /// First worker whose last observed status is idle, if any.
    pub fn find_idle(&mut self) -> Option<&mut Worker> {
        self.registry.iter_mut().find(|worker| worker.is_idle())
    }

    /// True when at least one worker is idle.
    pub fn has_idle(&self) -> bool {
        self.registry.iter().any(Worker::is_idle)
    }

    /// Dispatch a job to the first idle worker.
    ///
    /// Returns false when every worker is busy; the caller decides whether
    /// to wait and retry.
    pub fn dispatch(&mut self, job: JobSpec) -> bool {
        match self.find_idle() {
            Some(worker) => {
                tracing::debug!(
                    worker_id = %worker.id(),
                    pid = worker.pid().as_raw(),
                    job = job.name(),
                    "dispatching job"
                );
                worker.execute(job);
                true
            }
            None => false,
        }
    }

    /// Wait up to `timeout` for signal delivery, then handle everything
    /// that queued up.
    pub fn dispatch_signals(&mut self, timeout: Duration) -> Result<()> {
        if self.signals.wait(timeout)? {
            for signal in self.signals.drain() {
                self.handle_signal(signal);
            }
        }
        Ok(())
    }

    /// Run the event loop for a fixed duration.
    pub fn run_for(&mut self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            self.dispatch_signals(deadline - now)?;
        }
    }

    fn handle_signal(&mut self, signal: Signal) {
        match signal {
            NOTIFY_SIGNAL => self.drain_ready_channels(),
            Signal::SIGCHLD => self.reap_children(),
            Signal::SIGTERM | Signal::SIGINT => self.terminate(signal),
            DIAGNOSTIC_SIGNAL => self.dump_workers(),
            _ => {}
        }
    }

    /// Drain every tracked channel: repeated zero-timeout readiness sweeps,
    /// receiving one message per ready channel per sweep, until nothing is
    /// ready.
    ///
    /// The zero timeout keeps the parent from ever stalling here. Sweeping
    /// until dry matters because signal delivery coalesces: one notify
    /// signal may announce several buffered frames. Channels of workers
    /// that already left the registry (or were stopped) are not in the set
    /// and are never read.
    fn drain_ready_channels(&mut self) {
        loop {
            let tracked: Vec<(WorkerId, RawFd)> = self
                .registry
                .iter()
                .filter_map(|worker| worker.channel_fd().map(|fd| (worker.id(), fd)))
                .collect();
            if tracked.is_empty() {
                return;
            }

            let ready = poll_ready_ids(&tracked);
            if ready.is_empty() {
                return;
            }

            for id in ready {
                let message = match self.registry.get_mut(id) {
                    Some(worker) => match worker.receive() {
                        Ok(message) => {
                            worker.touch();
                            message
                        }
                        // The peer end closed between frames: the worker
                        // process is gone (SIGCHLD reports why). Stop
                        // tracking the channel; the entry itself stays.
                        Err(PoolError::Disconnected) => {
                            tracing::warn!(
                                worker_id = %id,
                                pid = worker.pid().as_raw(),
                                "worker channel hung up"
                            );
                            worker.close_channel();
                            continue;
                        }
                        // A failed read mid-frame is stream corruption on
                        // a point-to-point pipe; there is no recovery path.
                        Err(error) => channel::fatal("notify drain", &error),
                    },
                    None => continue,
                };
                self.route(id, message);
            }
        }
    }

    /// Route one received message to its handling logic.
    fn route(&mut self, id: WorkerId, message: Message) {
        match message {
            Message::Status { pid, status } => {
                tracing::debug!(pid, %status, "worker status update");
                if let Some(worker) = self.registry.get_mut(id) {
                    worker.set_status(status);
                }
            }
            Message::Callback {
                pid,
                callable,
                parameters,
            } => {
                tracing::debug!(pid, callable = %callable, "worker callback request");
                if !self.callbacks.invoke(&callable, &parameters) {
                    tracing::warn!(pid, callable = %callable, "no callback registered");
                }
            }
            Message::KeepAlive { pid } => {
                tracing::trace!(pid, "worker reporting in");
            }
            Message::Log { pid, text } => {
                tracing::info!(pid, "{text}");
            }
            Message::Dispatch { pid, .. } => {
                // Parent never expects a dispatch; ignored like any other
                // out-of-context variant.
                tracing::debug!(pid, "ignoring dispatch message in parent");
            }
        }
    }

    /// Reap every exited child without blocking.
    ///
    /// Exits are reported but the registry entry stays: the pool does not
    /// prune or replenish on worker death.
    fn reap_children(&mut self) {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    let pid = status.pid().map(Pid::as_raw).unwrap_or(-1);
                    let reason = ExitReason::from_wait(status);
                    if reason.is_clean() {
                        tracing::info!(pid, %reason, "worker process reaped");
                    } else {
                        tracing::warn!(pid, %reason, "worker process reaped, entry left registered");
                    }
                }
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(error) => {
                    tracing::warn!(%error, "waitpid failed");
                    break;
                }
            }
        }
    }

    /// Forward `signal` to every worker process, then terminate.
    fn terminate(&mut self, signal: Signal) -> ! {
        tracing::info!(%signal, workers = self.registry.len(), "forwarding termination to workers");
        for worker in self.registry.iter() {
            if let Err(error) = kill(worker.pid(), signal) {
                tracing::debug!(pid = worker.pid().as_raw(), %error, "termination forward failed");
            }
        }
        std::process::exit(0);
    }

    /// Diagnostic dump: every named worker with its pid and status.
    fn dump_workers(&self) {
        tracing::info!(workers = self.registry.len(), "pool diagnostic dump");
        for worker in self.registry.iter() {
            if let Some(name) = worker.name() {
                tracing::info!(
                    name,
                    pid = worker.pid().as_raw(),
                    status = %worker.status(),
                    last_seen = ?worker.last_seen().map(|at| at.elapsed()),
                    "worker"
                );
            }
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("size", &self.config.size)
            .field("workers", &self.registry.len())
            .finish()
    }
}

/// Zero-timeout readiness check across the tracked channel fds.
fn poll_ready_ids(tracked: &[(WorkerId, RawFd)]) -> Vec<WorkerId> {
    // Safety: the fds are owned by registry workers that outlive this
    // call, and the registry is not mutated while the borrows are alive.
    let mut fds: Vec<PollFd> = tracked
        .iter()
        .map(|(_, fd)| PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, PollFlags::POLLIN))
        .collect();

    loop {
        match poll(&mut fds, PollTimeout::ZERO) {
            Ok(0) => return Vec::new(),
            Ok(_) => {
                return tracked
                    .iter()
                    .zip(fds.iter())
                    .filter(|(_, fd)| readable(fd))
                    .map(|((id, _), _)| *id)
                    .collect();
            }
            Err(Errno::EINTR) => continue,
            Err(error) => {
                tracing::warn!(%error, "channel readiness poll failed");
                return Vec::new();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::worker::WorkerStatus;
    use serde_json::json;
    use serial_test::serial;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quiet_pool(size: usize) -> Pool {
        Pool::new(
            PoolConfig { size },
            RunnableRegistry::new(),
            CallbackRegistry::new(),
        )
        .unwrap()
    }

    /// Stub workers carry the test process's own pid, so a dispatch would
    /// raise SIGUSR2 at the test runner. Park it on ignore first.
    fn ignore_dispatch_signal() {
        use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, sigaction};
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        unsafe { sigaction(Signal::SIGUSR2, &ignore) }.unwrap();
    }

    #[test]
    #[serial]
    fn test_find_idle_skips_running_workers() {
        let mut pool = quiet_pool(3);
        pool.registry.add(Worker::stub(None, WorkerStatus::Running));
        pool.registry.add(Worker::stub(None, WorkerStatus::Stopped));
        assert!(!pool.has_idle());
        assert!(pool.find_idle().is_none());

        let idle = Worker::stub(None, WorkerStatus::Idle);
        let idle_id = idle.id();
        pool.registry.add(idle);

        assert!(pool.has_idle());
        assert_eq!(pool.find_idle().unwrap().id(), idle_id);
    }

    #[test]
    #[serial]
    fn test_has_idle_agrees_with_find_idle() {
        let mut pool = quiet_pool(2);
        assert_eq!(pool.has_idle(), pool.find_idle().is_some());

        pool.registry.add(Worker::stub(None, WorkerStatus::Idle));
        assert_eq!(pool.has_idle(), pool.find_idle().is_some());
        assert!(pool.has_idle());
    }

    #[test]
    #[serial]
    fn test_dispatch_marks_worker_running_and_writes_frame() {
        ignore_dispatch_signal();
        let mut pool = quiet_pool(1);
        let (worker, mut peer) = Worker::stub_with_peer(None, WorkerStatus::Idle);
        let id = worker.id();
        pool.registry.add(worker);

        assert!(pool.dispatch(JobSpec::new("scan")));
        assert!(pool.registry.get(id).unwrap().is_running());
        assert!(matches!(peer.receive().unwrap(), Message::Dispatch { .. }));

        // Every worker busy now.
        assert!(!pool.dispatch(JobSpec::new("scan")));
    }

    #[test]
    #[serial]
    fn test_route_status_updates_parent_view() {
        let mut pool = quiet_pool(1);
        let worker = Worker::stub(None, WorkerStatus::Running);
        let id = worker.id();
        pool.registry.add(worker);

        pool.route(id, Message::status(1, WorkerStatus::Idle));
        assert!(pool.registry.get(id).unwrap().is_idle());
    }

    #[test]
    #[serial]
    fn test_route_callback_invokes_registered_operation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_inner = Arc::clone(&calls);

        let mut callbacks = CallbackRegistry::new();
        callbacks.register("done", move |params| {
            assert_eq!(params, [json!("a")]);
            calls_inner.fetch_add(1, Ordering::SeqCst);
        });

        let mut pool = Pool::new(PoolConfig { size: 1 }, RunnableRegistry::new(), callbacks).unwrap();
        let worker = Worker::stub(None, WorkerStatus::Running);
        let id = worker.id();
        pool.registry.add(worker);

        pool.route(id, Message::callback(1, "done", vec![json!("a")]));
        pool.route(id, Message::callback(1, "unregistered", vec![]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[serial]
    fn test_drain_receives_pending_worker_message() {
        let mut pool = quiet_pool(1);
        let (worker, mut peer) = Worker::stub_with_peer(None, WorkerStatus::Running);
        let id = worker.id();
        pool.registry.add(worker);

        peer.send(&Message::status(7, WorkerStatus::Idle)).unwrap();
        pool.drain_ready_channels();

        let worker = pool.registry.get(id).unwrap();
        assert!(worker.is_idle());
        assert!(worker.last_seen().is_some());
    }

    #[test]
    #[serial]
    fn test_drain_skips_untracked_channels() {
        let mut pool = quiet_pool(1);
        let (mut worker, _peer) = Worker::stub_with_peer(None, WorkerStatus::Running);
        worker.stop();
        let id = worker.id();
        pool.registry.add(worker);

        // A stopped worker has no channel fd, so the readiness set is
        // empty and the sweep reads nothing.
        assert!(pool.registry.get(id).unwrap().channel_fd().is_none());
        pool.drain_ready_channels();
        assert!(pool.registry.get(id).unwrap().last_seen().is_none());
    }

    #[test]
    #[serial]
    fn test_reap_with_no_children_is_quiet() {
        let mut pool = quiet_pool(1);
        pool.reap_children();
    }

    #[test]
    #[serial]
    fn test_stop_empties_registry() {
        let mut pool = quiet_pool(2);
        pool.registry.add(Worker::stub(None, WorkerStatus::Idle));
        pool.registry.add(Worker::stub(None, WorkerStatus::Running));

        pool.stop();
        assert!(pool.registry().is_empty());
    }
}
