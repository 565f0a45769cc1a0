//! ldapsync authenticates users against LDAP/Active Directory servers and
//! keeps a local copy of them, with flags and groups derived from
//! `memberOf`.

#![forbid(unsafe_code)]

mod backend;
pub mod config;
pub mod database;
pub mod error;
pub mod ldap;
pub mod membership;
pub mod sync;
pub mod telemetry;
pub mod user;

use std::sync::Arc;

pub use backend::LdapBackend;
pub use error::{BackendError, Result};
pub use ldap::{DirectoryClient, DirectoryEntry, DirectoryError, Ldap3Directory};
pub use user::{LocalGroup, LocalUser, UserStore};

/// Build a backend from configuration: [`Ldap3Directory`] for the
/// directory, PostgreSQL or memory for the users.
pub async fn initialize(config: Arc<config::Configuration>) -> Result<LdapBackend> {
    let directory = Arc::new(Ldap3Directory::new(&config.ldap)?);
    let store = database::store(config.postgres.as_ref()).await?;

    Ok(LdapBackend::new(config, directory, store))
}
