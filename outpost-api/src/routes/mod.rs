pub mod health;
pub mod jobs;
pub mod provisionerd;
pub mod quota;
pub mod schedule;
pub mod templates;
pub mod watch;
pub mod workspaces;

use crate::{api_docs::ApiDoc, auth::auth_middleware, state::AppState};
use axum::{middleware, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub fn create_app(state: AppState) -> Router {
    // Allow CORS for local development (frontend on different port)
    let cors = CorsLayer::permissive();

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(health::routes()) // Health routes don't need auth
        .merge(provisionerd::routes()) // Daemons authenticate with the provisioner key
        .merge(
            workspaces::routes()
                .merge(schedule::routes())
                .merge(watch::routes())
                .merge(jobs::routes())
                .merge(quota::routes())
                .merge(templates::routes())
                .layer(middleware::from_fn(auth_middleware)),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
