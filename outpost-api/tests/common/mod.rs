//! Common test utilities and helpers for outpost-api tests
//!
//! Every test gets its own in-memory database and an orchestrator on a
//! fake clock, so schedule-driven endpoints are deterministic.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use chrono::{DateTime, Utc};
use outpost_api::{create_app, AppState};
use outpost_orchestrator::schedule::TemplateScheduleOptions;
use outpost_orchestrator::test_utils;
use outpost_orchestrator::{FakeClock, Template, Workspace, WorkspaceOrchestrator};
use std::sync::Arc;
use tower::ServiceExt;

pub use outpost_orchestrator::test_utils::complete_pending_jobs;

/// User configured as an administrator in every test app.
pub const ADMIN: &str = "root";

pub fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .expect("Failed to parse timestamp")
        .with_timezone(&Utc)
}

/// Orchestrator on a fresh in-memory database, clock frozen at `start`
pub async fn orchestrator_at(start: &str) -> (WorkspaceOrchestrator, FakeClock) {
    let clock = FakeClock::new(at(start));
    let orchestrator = WorkspaceOrchestrator::new(test_utils::create_test_db().await)
        .with_clock(Arc::new(clock.clone()));
    (orchestrator, clock)
}

pub fn test_state(orchestrator: WorkspaceOrchestrator) -> AppState {
    AppState::new(orchestrator).with_admins([ADMIN])
}

/// Fixture: template with an imported active version
pub async fn fixture_template(orchestrator: &WorkspaceOrchestrator, schedule: TemplateScheduleOptions) -> Template {
    test_utils::fixture_template(orchestrator, "docker", schedule).await.0
}

/// Fixture: running workspace on `template_id`
pub async fn fixture_workspace(
    orchestrator: &WorkspaceOrchestrator,
    template_id: &str,
    name: &str,
    owner: &str,
) -> Workspace {
    test_utils::fixture_workspace(orchestrator, template_id, name, owner).await
}

/// Helper to extract JSON body from axum response
pub async fn extract_json_body<T>(response: Response<Body>) -> T
where
    T: serde::de::DeserializeOwned,
{
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");

    serde_json::from_slice(&body).expect("Failed to deserialize JSON")
}

/// TestClient to encapsulate API interaction logic
pub struct TestClient {
    pub app: Router,
    pub orchestrator: WorkspaceOrchestrator,
    pub clock: FakeClock,
}

impl TestClient {
    /// Client over a fresh database with the clock at `start`
    pub async fn at(start: &str) -> Self {
        let (orchestrator, clock) = orchestrator_at(start).await;
        let app = create_app(test_state(orchestrator.clone()));
        Self {
            app,
            orchestrator,
            clock,
        }
    }

    pub async fn new() -> Self {
        Self::at("2024-05-06T09:00:00Z").await
    }

    /// Send a request to the API
    pub async fn send_request(&self, request: Request<Body>) -> Response<Body> {
        self.app
            .clone()
            .oneshot(request)
            .await
            .expect("Router is infallible")
    }

    async fn send_json<T: serde::Serialize>(
        &self,
        method: &str,
        uri: &str,
        body: &T,
        user: Option<&str>,
    ) -> Response<Body> {
        let req_body = serde_json::to_string(body).expect("Failed to serialize request body");
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(user) = user {
            builder = builder.header("x-user", user);
        }

        let request = builder
            .body(Body::from(req_body))
            .expect("Failed to build request");
        self.send_request(request).await
    }

    async fn send_empty(&self, method: &str, uri: &str, user: Option<&str>) -> Response<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("x-user", user);
        }

        let request = builder.body(Body::empty()).expect("Failed to build request");
        self.send_request(request).await
    }

    /// Post JSON to an endpoint
    pub async fn post<T: serde::Serialize>(&self, uri: &str, body: &T, user: Option<&str>) -> Response<Body> {
        self.send_json("POST", uri, body, user).await
    }

    /// Post with no body
    pub async fn post_empty(&self, uri: &str, user: Option<&str>) -> Response<Body> {
        self.send_empty("POST", uri, user).await
    }

    /// Put JSON to an endpoint
    pub async fn put<T: serde::Serialize>(&self, uri: &str, body: &T, user: Option<&str>) -> Response<Body> {
        self.send_json("PUT", uri, body, user).await
    }

    /// Get request to an endpoint
    pub async fn get(&self, uri: &str, user: Option<&str>) -> Response<Body> {
        self.send_empty("GET", uri, user).await
    }

    /// Delete request to an endpoint
    pub async fn delete(&self, uri: &str, user: Option<&str>) -> Response<Body> {
        self.send_empty("DELETE", uri, user).await
    }
}
