//! Error handler for ldapsync.

use thiserror::Error;
use validator::ValidationErrors;

use crate::ldap::DirectoryError;

pub type Result<T> = std::result::Result<T, BackendError>;

/// Enum representing backend errors.
///
/// Authentication failures are not errors: [`crate::LdapBackend`] reports
/// them as `Ok(None)`. What is left here must reach the caller.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("configuration error, {0}")]
    Config(String),

    #[error("invalid configuration")]
    Validation(#[from] ValidationErrors),

    #[error("cannot read configuration file")]
    Io(#[from] std::io::Error),

    #[error("cannot parse configuration file")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("SQL request failed: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("cannot serialize output: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store failure, {details}")]
    Store { details: String },
}

impl BackendError {
    /// Create a [`BackendError::Config`].
    pub fn config(details: impl Into<String>) -> Self {
        Self::Config(details.into())
    }

    /// Whether the error comes from a misconfiguration.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            BackendError::Config(_)
                | BackendError::Validation(_)
                | BackendError::Yaml(_)
        )
    }
}
