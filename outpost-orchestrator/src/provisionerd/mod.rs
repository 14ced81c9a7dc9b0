//! Worker side of the job queue: the wire protocol, the orchestrator-facing
//! session a connected daemon talks to, and the daemon loop itself.

pub mod api;
pub mod logs;
pub mod proto;
pub mod runner;
pub mod server;

pub use api::{dispatch, ProvisionerApi};
pub use logs::LogBuffer;
pub use runner::{DaemonOptions, JobProgress, ProvisionOutcome, Provisioner, ProvisionerDaemonRunner};
pub use server::DaemonSession;
