//! Handler contracts
//!
//! [`Handler`] is what the frontend dispatches client operations to.
//! [`UserLookup`] is what the bind authenticator asks to resolve usernames.

use crate::error::RelayResult;
use crate::proto::{ResultCode, SearchRequest, SearchResult};
use crate::session::ClientConn;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// A user record as seen by the bind authenticator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    /// Alternate id (user principal name)
    pub upn: Option<String>,
    /// Base32 TOTP secret; a non-empty secret enforces a second factor
    pub otp_secret: Option<String>,
}

impl User {
    pub fn otp_secret(&self) -> Option<&str> {
        self.otp_secret.as_deref().filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    pub gid: u32,
}

/// Resolves usernames and group names
#[async_trait]
pub trait UserLookup: Send + Sync {
    async fn find_user(&self, name: &str, by_upn: bool) -> RelayResult<Option<User>>;

    async fn find_group(&self, name: &str) -> RelayResult<Option<Group>>;
}

/// Operations the frontend dispatches for one client connection
#[async_trait]
pub trait Handler: Send + Sync {
    async fn bind(&self, bind_dn: &str, password: &str, conn: &ClientConn) -> ResultCode;

    async fn search(&self, bound_dn: &str, request: SearchRequest, conn: &ClientConn) -> SearchResult;

    async fn close(&self, bound_dn: &str, conn: &ClientConn);

    async fn add(&self, _bound_dn: &str, _conn: &ClientConn) -> ResultCode {
        ResultCode::InsufficientAccessRights
    }

    async fn modify(&self, _bound_dn: &str, _conn: &ClientConn) -> ResultCode {
        ResultCode::InsufficientAccessRights
    }

    async fn delete(&self, _bound_dn: &str, _conn: &ClientConn) -> ResultCode {
        ResultCode::InsufficientAccessRights
    }
}

/// Ordered user lookup providers, consulted first to last
#[derive(Clone, Default)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn UserLookup>>,
    active: usize,
}

impl HandlerChain {
    pub fn new(handlers: Vec<Arc<dyn UserLookup>>) -> Self {
        let active = handlers.len();
        Self { handlers, active }
    }

    /// Only the first `active` handlers take part in lookups
    pub fn with_active(handlers: Vec<Arc<dyn UserLookup>>, active: usize) -> Self {
        let active = active.min(handlers.len());
        Self { handlers, active }
    }

    pub fn active(&self) -> usize {
        self.active
    }

    /// First active handler that knows `name` wins. Lookup errors count as not found.
    pub async fn find_user(&self, name: &str, by_upn: bool) -> Option<User> {
        for (index, handler) in self.handlers[..self.active].iter().enumerate() {
            match handler.find_user(name, by_upn).await {
                Ok(Some(user)) => return Some(user),
                Ok(None) => {}
                Err(e) => warn!(handler = index, username = %name, error = %e, "user lookup failed"),
            }
        }
        None
    }
}

impl std::fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerChain")
            .field("handlers", &self.handlers.len())
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;

    struct Fixed(Option<User>);

    #[async_trait]
    impl UserLookup for Fixed {
        async fn find_user(&self, _name: &str, _by_upn: bool) -> RelayResult<Option<User>> {
            Ok(self.0.clone())
        }

        async fn find_group(&self, _name: &str) -> RelayResult<Option<Group>> {
            Ok(None)
        }
    }

    struct Failing;

    #[async_trait]
    impl UserLookup for Failing {
        async fn find_user(&self, _name: &str, _by_upn: bool) -> RelayResult<Option<User>> {
            Err(RelayError::upstream("lookup backend unavailable"))
        }

        async fn find_group(&self, _name: &str) -> RelayResult<Option<Group>> {
            Ok(None)
        }
    }

    fn user(name: &str) -> User {
        User {
            name: name.to_string(),
            upn: None,
            otp_secret: Some(String::new()),
        }
    }

    #[tokio::test]
    async fn test_first_match_wins_and_errors_are_skipped() {
        let chain = HandlerChain::new(vec![
            Arc::new(Failing),
            Arc::new(Fixed(None)),
            Arc::new(Fixed(Some(user("first")))),
            Arc::new(Fixed(Some(user("second")))),
        ]);
        assert_eq!(chain.find_user("x", false).await.unwrap().name, "first");
    }

    #[tokio::test]
    async fn test_inactive_handlers_are_ignored() {
        let chain = HandlerChain::with_active(
            vec![Arc::new(Fixed(None)), Arc::new(Fixed(Some(user("hidden"))))],
            1,
        );
        assert_eq!(chain.active(), 1);
        assert!(chain.find_user("x", false).await.is_none());
    }

    #[test]
    fn test_empty_secret_means_no_second_factor() {
        assert!(user("alice").otp_secret().is_none());
    }
}
