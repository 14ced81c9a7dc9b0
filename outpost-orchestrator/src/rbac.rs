//! Capability checks.
//!
//! The orchestrator never decides who may do what. Callers pass a pure
//! `Fn(Action, &AuthObject) -> bool` and the orchestrator asks it at the
//! points where a decision is needed.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthObject {
    Workspace { id: String, owner: String },
    Template { id: String },
}

impl AuthObject {
    pub fn workspace(id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self::Workspace {
            id: id.into(),
            owner: owner.into(),
        }
    }

    pub fn template(id: impl Into<String>) -> Self {
        Self::Template { id: id.into() }
    }
}

pub type Authorizer = dyn Fn(Action, &AuthObject) -> bool + Send + Sync;

/// Authorizer for internal actors such as the lifecycle executor.
pub fn allow_all(_: Action, _: &AuthObject) -> bool {
    true
}
