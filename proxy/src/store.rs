//! Users and groups declared in the configuration file

use crate::config::{GroupConfig, UserConfig};
use crate::error::RelayResult;
use crate::handler::{Group, User, UserLookup};
use async_trait::async_trait;

/// [`UserLookup`] over the static `[[users]]` and `[[groups]]` tables
#[derive(Debug, Clone, Default)]
pub struct ConfigUserStore {
    users: Vec<UserConfig>,
    groups: Vec<GroupConfig>,
}

impl ConfigUserStore {
    pub fn new(users: Vec<UserConfig>, groups: Vec<GroupConfig>) -> Self {
        Self { users, groups }
    }
}

#[async_trait]
impl UserLookup for ConfigUserStore {
    async fn find_user(&self, name: &str, by_upn: bool) -> RelayResult<Option<User>> {
        let found = self.users.iter().find(|u| {
            if by_upn {
                u.upn.as_deref().is_some_and(|upn| upn.eq_ignore_ascii_case(name))
            } else {
                u.name.eq_ignore_ascii_case(name)
            }
        });

        Ok(found.map(|u| User {
            name: u.name.clone(),
            upn: u.upn.clone(),
            otp_secret: u.otp_secret.clone(),
        }))
    }

    async fn find_group(&self, name: &str) -> RelayResult<Option<Group>> {
        Ok(self
            .groups
            .iter()
            .find(|g| g.name.eq_ignore_ascii_case(name))
            .map(|g| Group {
                name: g.name.clone(),
                gid: g.gid,
            }))
    }
}
