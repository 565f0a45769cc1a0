//! Local user synchronization from a directory entry.

use std::sync::Arc;

use chrono::Utc;

use crate::config::Configuration;
use crate::error::{BackendError, Result};
use crate::ldap::DirectoryEntry;
use crate::membership::{self, MembershipList};
use crate::user::{LocalGroup, LocalUser, UserStore};

/// Create or refresh the local copy of a directory user.
#[derive(Clone)]
pub struct UserSynchronizer {
    config: Arc<Configuration>,
    store: Arc<dyn UserStore>,
}

impl UserSynchronizer {
    /// Create a new [`UserSynchronizer`].
    pub fn new(config: Arc<Configuration>, store: Arc<dyn UserStore>) -> Self {
        Self { config, store }
    }

    /// Copy attributes, flags and groups of `entry` onto the local user
    /// called `username`, creating it when needed.
    ///
    /// Flags and configured groups are assigned, not accumulated: a grant
    /// that no longer matches `memberOf` is revoked. Groups absent from
    /// configuration are left alone.
    pub async fn sync(
        &self,
        username: &str,
        entry: &DirectoryEntry,
    ) -> Result<LocalUser> {
        let settings = &self.config.ldap;
        let username = username.to_lowercase();

        let mut user = match self.store.find_by_username(&username).await? {
            Some(user) => user,
            None => {
                tracing::info!(%username, "creating local user");
                LocalUser::new(&username)
            },
        };

        let memberships = MembershipList::from_entry(entry);

        for (field, attribute) in &settings.user_attr_map {
            if let Some(value) = entry.first(attribute) {
                user.set_field(*field, value);
            }
        }

        for (flag, requirement) in &settings.user_flags_by_group {
            user.set_flag(*flag, membership::satisfied(&memberships, requirement));
        }

        // Resolve every group first so a missing one changes nothing.
        let mut groups: Vec<(LocalGroup, bool)> =
            Vec::with_capacity(settings.user_groups_by_group.len());
        for (name, requirement) in &settings.user_groups_by_group {
            let group = self.store.find_group(name).await?.ok_or_else(|| {
                BackendError::config(format!(
                    "local group `{name}` referenced by `user_groups_by_group` does not exist"
                ))
            })?;
            groups.push((group, membership::satisfied(&memberships, requirement)));
        }

        user.last_login = Some(Utc::now());
        let user = self.store.save(&user).await?;
        let Some(id) = user.id else {
            return Err(BackendError::Store {
                details: format!("user `{username}` saved without identifier"),
            });
        };

        for (group, granted) in &groups {
            if *granted {
                self.store.add_group(id, group).await?;
            } else {
                self.store.remove_group(id, group).await?;
            }
        }

        let user = self.store.save(&user).await?;

        tracing::debug!(
            %username,
            user_id = id,
            memberships = memberships.len(),
            is_active = user.is_active,
            is_staff = user.is_staff,
            is_superuser = user.is_superuser,
            groups = ?user.groups.iter().map(|g| g.name.as_str()).collect::<Vec<_>>(),
            "local user synchronized"
        );

        Ok(user)
    }
}
