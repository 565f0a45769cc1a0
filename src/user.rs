//! Local users and groups.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Prefix of a password no hasher will ever verify.
pub const UNUSABLE_PASSWORD_PREFIX: char = '!';
const UNUSABLE_PASSWORD_SUFFIX_LENGTH: usize = 40;

/// Local field a directory attribute may be copied into.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum UserField {
    FirstName,
    LastName,
    Email,
}

/// Local boolean flag derived from group membership.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum UserFlag {
    IsActive,
    IsStaff,
    IsSuperuser,
}

/// Group as saved on database.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::FromRow,
)]
pub struct LocalGroup {
    pub id: i64,
    pub name: String,
}

/// User as saved on database.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LocalUser {
    /// Assigned by the store on first save.
    pub id: Option<i64>,
    pub username: String,
    #[serde(skip)]
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub is_active: bool,
    pub is_staff: bool,
    pub is_superuser: bool,
    pub date_joined: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    #[sqlx(skip)]
    pub groups: Vec<LocalGroup>,
}

impl LocalUser {
    /// Create a new, unsaved [`LocalUser`] whose password cannot be used
    /// to log in.
    pub fn new(username: &str) -> Self {
        Self {
            id: None,
            username: username.to_lowercase(),
            password: unusable_password(),
            first_name: String::new(),
            last_name: String::new(),
            email: String::new(),
            is_active: true,
            is_staff: false,
            is_superuser: false,
            date_joined: Utc::now(),
            last_login: None,
            groups: Vec::new(),
        }
    }

    /// Update a mapped field.
    pub fn set_field(&mut self, field: UserField, value: &str) {
        let target = match field {
            UserField::FirstName => &mut self.first_name,
            UserField::LastName => &mut self.last_name,
            UserField::Email => &mut self.email,
        };
        value.clone_into(target);
    }

    /// Update a flag.
    pub fn set_flag(&mut self, flag: UserFlag, value: bool) {
        match flag {
            UserFlag::IsActive => self.is_active = value,
            UserFlag::IsStaff => self.is_staff = value,
            UserFlag::IsSuperuser => self.is_superuser = value,
        }
    }

    /// Whether the user belongs to a group called `name`.
    pub fn in_group(&self, name: &str) -> bool {
        self.groups.iter().any(|group| group.name == name)
    }

    /// Whether a local password can authenticate this user.
    pub fn has_usable_password(&self) -> bool {
        !self.password.starts_with(UNUSABLE_PASSWORD_PREFIX)
    }
}

fn unusable_password() -> String {
    format!(
        "{UNUSABLE_PASSWORD_PREFIX}{}",
        Alphanumeric.sample_string(&mut OsRng, UNUSABLE_PASSWORD_SUFFIX_LENGTH)
    )
}

/// Port for user and group persistence.
///
/// Implementations must make `save` atomic per username; concurrent
/// authentications of the same user rely on it.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Find a user by its (lowercase) username.
    async fn find_by_username(&self, username: &str)
    -> Result<Option<LocalUser>>;

    /// Find a user by identifier.
    async fn find_by_id(&self, id: i64) -> Result<Option<LocalUser>>;

    /// Insert or update a user, keyed by username. Returns the user with
    /// its identifier set.
    async fn save(&self, user: &LocalUser) -> Result<LocalUser>;

    /// Find a group by name.
    async fn find_group(&self, name: &str) -> Result<Option<LocalGroup>>;

    /// Create a group. Never called during authentication.
    async fn create_group(&self, name: &str) -> Result<LocalGroup>;

    /// Link a user to a group. Linking twice is a no-op.
    async fn add_group(&self, user_id: i64, group: &LocalGroup) -> Result<()>;

    /// Unlink a user from a group. Missing link is a no-op.
    async fn remove_group(&self, user_id: i64, group: &LocalGroup)
    -> Result<()>;

    /// Groups of a user, ordered by name.
    async fn groups_of(&self, user_id: i64) -> Result<Vec<LocalGroup>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_user() {
        let user = LocalUser::new("Alice");
        assert_eq!(user.username, "alice");
        assert_eq!(user.id, None);
        assert!(user.is_active);
        assert!(!user.is_staff && !user.is_superuser);
        assert!(!user.has_usable_password());
        assert_eq!(user.password.len(), 1 + UNUSABLE_PASSWORD_SUFFIX_LENGTH);
    }

    #[test]
    fn test_unusable_passwords_differ() {
        assert_ne!(LocalUser::new("a").password, LocalUser::new("a").password);
    }

    #[test]
    fn test_fields_and_flags() {
        let mut user = LocalUser::new("bob");
        user.set_field(UserField::Email, "bob@example.org");
        user.set_field(UserField::FirstName, "Bob");
        assert_eq!(user.email, "bob@example.org");
        assert_eq!(user.first_name, "Bob");
        assert_eq!(user.last_name, "");

        user.set_flag(UserFlag::IsSuperuser, true);
        user.set_flag(UserFlag::IsActive, false);
        assert!(user.is_superuser);
        assert!(!user.is_active);
        assert!(!user.is_staff);
    }

    #[test]
    fn test_serialize_hides_password() {
        let user = LocalUser::new("carol");
        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("password").is_none());
        assert_eq!(json["username"], "carol");
    }

    #[test]
    fn test_field_names() {
        let field: UserField = serde_yaml::from_str("first_name").unwrap();
        assert_eq!(field, UserField::FirstName);
        let flag: UserFlag = serde_yaml::from_str("is_superuser").unwrap();
        assert_eq!(flag, UserFlag::IsSuperuser);
        assert!(serde_yaml::from_str::<UserFlag>("is_wizard").is_err());
    }
}
