//! waitroom: client-side admission to a capacity-limited session.

mod config;
mod identity;
mod status;
mod version;

pub mod client;
pub mod controller;
pub mod machine;
pub mod poller;
pub mod store;

pub use client::{AdmissionService, HttpAdmissionService, ServiceConfig, ServiceError};
pub use config::{AdmissionConfig, DEFAULT_FAILURE_THRESHOLD};
pub use controller::AdmissionController;
pub use identity::{ClientIdentity, InvalidIdentity};
pub use machine::{AdmissionView, Failure, FailureKind};
pub use poller::{PollerHandle, StatusPoller};
pub use status::{AdmissionStatus, QueueSnapshot};
pub use store::{FileStore, MemoryStore, PersistedRecord, ResumeStore, StoreError};
pub use version::{WAITROOM_VERSION, user_agent};
