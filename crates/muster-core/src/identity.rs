//! Identity boundary.
//!
//! The approval endpoint must attribute every resolution to an
//! authenticated human. The engine consumes this trait; the real
//! identity provider (SSO, session cookies, ...) lives outside the
//! orchestration core.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// HumanIdentity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanIdentity {
    pub id: String,
    pub display_name: String,
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("unknown or expired token")]
    Unauthorized,
}

// ---------------------------------------------------------------------------
// IdentityProvider
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve a bearer token to the human behind it.
    async fn resolve(&self, token: &str) -> Result<HumanIdentity, IdentityError>;
}

/// Static token table, for the daemon's default configuration and tests.
#[derive(Default)]
pub struct StaticIdentity {
    tokens: HashMap<String, HumanIdentity>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(
        mut self,
        token: impl Into<String>,
        id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        self.tokens.insert(
            token.into(),
            HumanIdentity {
                id: id.into(),
                display_name: display_name.into(),
            },
        );
        self
    }
}

#[async_trait::async_trait]
impl IdentityProvider for StaticIdentity {
    async fn resolve(&self, token: &str) -> Result<HumanIdentity, IdentityError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(IdentityError::Unauthorized)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
