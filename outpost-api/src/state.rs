use crate::auth::{self, AuthenticatedUser};
use crate::config::Config;
use outpost_orchestrator::{Action, AuthObject, WorkspaceOrchestrator};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: WorkspaceOrchestrator,
    pub admins: Arc<HashSet<String>>,
    pub acquire_timeout: Duration,
    pub provisioner_psk: Option<Arc<str>>,
}

impl AppState {
    pub fn new(orchestrator: WorkspaceOrchestrator) -> Self {
        Self {
            orchestrator,
            admins: Arc::new(HashSet::new()),
            acquire_timeout: Duration::from_secs(10),
            provisioner_psk: None,
        }
    }

    pub fn from_config(orchestrator: WorkspaceOrchestrator, config: &Config) -> Self {
        Self {
            orchestrator,
            admins: Arc::new(config.admins.clone()),
            acquire_timeout: config.acquire_timeout(),
            provisioner_psk: config.provisioner_psk.as_deref().map(Arc::from),
        }
    }

    pub fn with_admins<I, S>(mut self, admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.admins = Arc::new(admins.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_provisioner_psk(mut self, psk: impl Into<String>) -> Self {
        self.provisioner_psk = Some(Arc::from(psk.into()));
        self
    }

    pub fn is_admin(&self, user: &AuthenticatedUser) -> bool {
        self.admins.contains(&user.username)
    }

    pub fn authorizer(&self, user: &AuthenticatedUser) -> impl Fn(Action, &AuthObject) -> bool + Send + Sync {
        auth::authorizer(user, self.is_admin(user))
    }
}
