//! forkpool - process-based worker pool with signal-driven IPC.

pub mod cli;
pub mod error;
pub mod logging;
pub mod pool;

pub use error::{PoolError, Result};
