//! Admission status and queue snapshot types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a client stands in the admission protocol.
///
/// The same enum describes both the controller's own state and the status
/// reported by the backend in a [`QueueSnapshot`]. The backend only ever
/// reports `Idle`, `Waiting`, `Ready` or `InSession`; the remaining variants
/// are client-side states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionStatus {
    /// Reading prior state, nothing issued yet
    #[default]
    Checking,
    /// Join request outstanding (or re-join scheduled)
    Joining,
    /// Backend: not enqueued, safe to re-join
    Idle,
    /// Holding a queue slot
    #[serde(alias = "pending", alias = "queue")]
    Waiting,
    /// Slot granted
    #[serde(alias = "admitted")]
    Ready,
    /// Handed off to the session consumer
    InSession,
    /// Stopped, waiting for a manual retry
    Error,
}

impl AdmissionStatus {
    /// Ready and InSession both mean the client may proceed.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Ready | Self::InSession)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checking => "checking",
            Self::Joining => "joining",
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::InSession => "in_session",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for AdmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single point-in-time reading returned by every join and poll call.
///
/// `position` only means something while `status` is `Waiting`. It is not
/// monotonic; each snapshot replaces the previous one wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub status: AdmissionStatus,
    #[serde(default, alias = "queue_number")]
    pub position: u32,
}

impl QueueSnapshot {
    pub fn new(status: AdmissionStatus, position: u32) -> Self {
        Self { status, position }
    }

    pub fn waiting(position: u32) -> Self {
        Self::new(AdmissionStatus::Waiting, position)
    }

    pub fn ready() -> Self {
        Self::new(AdmissionStatus::Ready, 0)
    }

    pub fn idle() -> Self {
        Self::new(AdmissionStatus::Idle, 0)
    }
}
