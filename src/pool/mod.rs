//! Process-based worker pool over fork, socket pairs, and POSIX signals.
//!
//! A parent process forks a fixed number of workers and talks to each one
//! over a private socket pair. Every cross-process notification is the same
//! two-step: write a frame into the channel, then deliver a signal telling
//! the peer a message is waiting.
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────────┐
//!                      │  Parent process  │
//!                      │  (Pool manager)  │
//!                      └────────┬─────────┘
//!                SIGUSR2 ↓      │      ↑ SIGUSR1
//!               ┌───────────────┼───────────────┐
//!               │               │               │
//!         ┌─────▼─────┐   ┌─────▼─────┐   ┌─────▼─────┐
//!         │ Worker 1  │   │ Worker 2  │   │ Worker N  │
//!         │ (process) │   │ (process) │   │ (process) │
//!         └───────────┘   └───────────┘   └───────────┘
//! ```
//!
//! Frames are `[4-byte big-endian length][deflate-compressed JSON]`. Code
//! never travels on the wire: runnables and callbacks are registered under
//! names before the pool forks, and messages carry the name plus plain
//! data.

pub mod channel;
pub mod manager;
pub mod message;
pub mod registry;
pub mod runnable;
pub mod signals;
pub mod task;
pub mod worker;

pub use channel::Channel;
pub use manager::{Pool, PoolConfig};
pub use message::Message;
pub use registry::WorkerRegistry;
pub use runnable::{CallbackRegistry, JobSpec, Runnable, RunnableFn, RunnableRegistry};
pub use task::Task;
pub use worker::{Worker, WorkerId, WorkerStatus};
