//! Workspace build orchestration
//!
//! Turns requested workspace transitions into builds, queues the jobs that
//! carry them out, hands those jobs to provisioner daemons, and keeps running
//! workspaces inside their schedule and quota. Consumed by the `outpost-api`
//! HTTP service and the `outpost-provisionerd` worker binary.

pub mod activity;
pub mod build;
pub mod builder;
pub mod clock;
pub mod daemon;
pub mod db;
pub mod error;
pub mod job;
pub mod lifecycle;
pub mod provisionerd;
pub mod pubsub;
pub mod queue;
pub mod quota;
pub mod rbac;
pub mod reaper;
pub mod schedule;
pub mod template;
pub mod workspace;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use build::{BuildParameter, BuildReason, BuildTransition, WorkspaceBuild};
pub use builder::{BuildOptions, BuildRequest};
pub use clock::{Clock, FakeClock, SystemClock};
pub use daemon::ProvisionerDaemon;
pub use error::{OrchestratorError, Result};
pub use job::{JobLog, JobPayload, JobStatus, JobType, LogEntry, LogLevel, ProvisionerJob};
pub use lifecycle::{LifecycleExecutor, LifecycleStats};
pub use pubsub::{MemoryPubsub, Pubsub, Subscription};
pub use quota::QuotaStatus;
pub use rbac::{allow_all, Action, AuthObject, Authorizer};
pub use reaper::{JobReaper, ReaperStats};
pub use template::{CreateTemplateRequest, CreateTemplateVersionRequest, Template, TemplateVersion};
pub use workspace::{
    CreateWorkspaceRequest, Workspace, WorkspaceFilters, WorkspaceOrchestrator, WorkspaceStatus,
    WorkspaceView,
};
