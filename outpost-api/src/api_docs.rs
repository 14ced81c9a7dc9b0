use crate::routes::{schedule, templates, workspaces};
use outpost_orchestrator::schedule::{AutostopRequirement, TemplateScheduleOptions};
use outpost_orchestrator::{
    BuildParameter, BuildReason, BuildTransition, CreateTemplateRequest,
    CreateTemplateVersionRequest, CreateWorkspaceRequest, JobLog, JobStatus, LogEntry, LogLevel,
    QuotaStatus, Template, TemplateVersion, Workspace, WorkspaceBuild, WorkspaceStatus,
    WorkspaceView,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::health::health_check,
        crate::routes::health::readiness_check,
        crate::routes::workspaces::list_workspaces,
        crate::routes::workspaces::create_workspace,
        crate::routes::workspaces::get_workspace,
        crate::routes::workspaces::delete_workspace,
        crate::routes::workspaces::create_build,
        crate::routes::workspaces::list_builds,
        crate::routes::schedule::update_ttl,
        crate::routes::schedule::update_autostart,
        crate::routes::schedule::extend_deadline,
        crate::routes::schedule::report_activity,
        crate::routes::watch::watch_workspace,
        crate::routes::jobs::job_logs,
        crate::routes::quota::my_quota,
        crate::routes::quota::set_allowance,
        crate::routes::templates::create_template,
        crate::routes::templates::get_template,
        crate::routes::templates::delete_template,
        crate::routes::templates::update_schedule,
        crate::routes::templates::create_version,
        crate::routes::templates::promote_version,
        crate::routes::templates::archive_version,
        crate::routes::provisionerd::serve,
    ),
    components(
        schemas(
            Workspace,
            WorkspaceStatus,
            WorkspaceView,
            WorkspaceBuild,
            BuildTransition,
            BuildReason,
            BuildParameter,
            CreateWorkspaceRequest,
            workspaces::CreateBuildRequest,
            schedule::UpdateTtlRequest,
            schedule::UpdateAutostartRequest,
            schedule::ExtendRequest,
            schedule::ActivityResponse,
            JobLog,
            LogEntry,
            LogLevel,
            JobStatus,
            QuotaStatus,
            crate::routes::quota::AllowanceRequest,
            Template,
            TemplateVersion,
            TemplateScheduleOptions,
            AutostopRequirement,
            CreateTemplateRequest,
            CreateTemplateVersionRequest,
            templates::CreateVersionResponse
        )
    ),
    tags(
        (name = "outpost-api", description = "Workspace build orchestration API")
    )
)]
pub struct ApiDoc;
