//! IPC message taxonomy for parent/worker communication.
//!
//! Every value that crosses a worker channel is one of these variants.
//! Messages are serialized with an internal `type` tag so both ends can
//! route on the variant before looking at the payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::runnable::JobSpec;
use super::worker::WorkerStatus;

/// A tagged IPC payload exchanged between parent and worker.
///
/// Every variant carries the sender's OS pid. Exactly one message occupies
/// a channel frame; writes and reads alternate strictly on one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Worker informs the parent of a status change.
    #[serde(rename = "status")]
    Status {
        /// Sending worker's OS pid.
        pid: i32,
        /// The status the worker is transitioning to.
        status: WorkerStatus,
    },

    /// Parent hands a unit of work to a worker.
    #[serde(rename = "dispatch")]
    Dispatch {
        /// Target worker's OS pid.
        pid: i32,
        /// Named job plus plain-data parameters.
        job: JobSpec,
    },

    /// Worker asks the parent to invoke a named operation.
    #[serde(rename = "callback")]
    Callback {
        /// Sending worker's OS pid.
        pid: i32,
        /// Name the parent registered the operation under.
        callable: String,
        /// Arguments, passed through as plain data.
        parameters: Vec<Value>,
    },

    /// Heartbeat with no payload beyond the pid.
    #[serde(rename = "keepalive")]
    KeepAlive {
        /// Sending worker's OS pid.
        pid: i32,
    },

    /// A log line for the parent to surface.
    #[serde(rename = "log")]
    Log {
        /// Sending worker's OS pid.
        pid: i32,
        /// The line to surface.
        text: String,
    },
}

impl Message {
    /// Create a status notification.
    pub fn status(pid: i32, status: WorkerStatus) -> Self {
        Self::Status { pid, status }
    }

    /// Create a work dispatch.
    pub fn dispatch(pid: i32, job: JobSpec) -> Self {
        Self::Dispatch { pid, job }
    }

    /// Create a callback request.
    pub fn callback(pid: i32, callable: impl Into<String>, parameters: Vec<Value>) -> Self {
        Self::Callback {
            pid,
            callable: callable.into(),
            parameters,
        }
    }

    /// Create a heartbeat.
    pub fn keepalive(pid: i32) -> Self {
        Self::KeepAlive { pid }
    }

    /// Create a log line.
    pub fn log(pid: i32, text: impl Into<String>) -> Self {
        Self::Log {
            pid,
            text: text.into(),
        }
    }

    /// The sending process's pid, common to all variants.
    pub fn pid(&self) -> i32 {
        match self {
            Self::Status { pid, .. }
            | Self::Dispatch { pid, .. }
            | Self::Callback { pid, .. }
            | Self::KeepAlive { pid }
            | Self::Log { pid, .. } => *pid,
        }
    }

    /// Short variant name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Dispatch { .. } => "dispatch",
            Self::Callback { .. } => "callback",
            Self::KeepAlive { .. } => "keepalive",
            Self::Log { .. } => "log",
        }
    }
}
