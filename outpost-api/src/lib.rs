pub mod api_docs;
pub mod auth;
pub mod config;
pub mod error;
pub mod janitor;
pub mod routes;
pub mod shutdown;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use janitor::start_background_tasks;
pub use routes::create_app;
pub use shutdown::install_shutdown_handler;
pub use state::AppState;
