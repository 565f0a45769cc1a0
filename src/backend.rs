//! Directory authentication with multi-server failover.

use std::sync::Arc;
use std::time::Instant;

use tracing::Instrument;

use crate::config::Configuration;
use crate::error::{BackendError, Result};
use crate::ldap::{
    DirectoryClient, DirectoryEntry, DirectoryError, DirectorySession,
    render_filter,
};
use crate::sync::UserSynchronizer;
use crate::user::{LocalUser, UserStore};

/// Why an authentication ended, as reported to metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    InvalidCredentials,
    NotFound,
    Ambiguous,
    Unreachable,
    SearchFailed,
    Rejected,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::InvalidCredentials => "invalid_credentials",
            Outcome::NotFound => "not_found",
            Outcome::Ambiguous => "ambiguous",
            Outcome::Unreachable => "unreachable",
            Outcome::SearchFailed => "search_failed",
            Outcome::Rejected => "rejected",
        }
    }
}

/// Result of a lookup on one server.
enum Lookup {
    Found(DirectoryEntry),
    Failed(Outcome),
    /// Server not usable, try the next one.
    NextServer,
}

/// Authenticate users against the configured directory servers and keep
/// their local copy in sync.
#[derive(Clone)]
pub struct LdapBackend {
    config: Arc<Configuration>,
    directory: Arc<dyn DirectoryClient>,
    store: Arc<dyn UserStore>,
    synchronizer: UserSynchronizer,
}

impl LdapBackend {
    /// Create a new [`LdapBackend`].
    pub fn new(
        config: Arc<Configuration>,
        directory: Arc<dyn DirectoryClient>,
        store: Arc<dyn UserStore>,
    ) -> Self {
        let synchronizer =
            UserSynchronizer::new(Arc::clone(&config), Arc::clone(&store));

        Self {
            config,
            directory,
            store,
            synchronizer,
        }
    }

    /// Check `username` and `password` against the directory.
    ///
    /// Returns the synchronized local user, or `None` when the credentials
    /// are refused, the user is not found exactly once, or no server can be
    /// reached. Errors are kept for misconfiguration and storage failures.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<LocalUser>> {
        let span = tracing::info_span!("ldap_authenticate", %username);
        self.authenticate_inner(username, password)
            .instrument(span)
            .await
    }

    /// Stored user with this identifier. The directory is not involved.
    pub async fn get_user(&self, id: i64) -> Result<Option<LocalUser>> {
        self.store.find_by_id(id).await
    }

    async fn authenticate_inner(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<LocalUser>> {
        let start = Instant::now();

        // An empty password is an anonymous bind on many servers.
        if username.is_empty() || password.is_empty() {
            tracing::debug!("empty username or password");
            record(Outcome::InvalidCredentials, start);
            return Ok(None);
        }

        let entry = match self.lookup(username, password).await? {
            Lookup::Found(entry) => entry,
            Lookup::Failed(outcome) => {
                record(outcome, start);
                return Ok(None);
            },
            Lookup::NextServer => {
                record(Outcome::Unreachable, start);
                return Ok(None);
            },
        };

        let user = self.synchronizer.sync(username, &entry).await?;
        tracing::info!(dn = %entry.dn, user_id = ?user.id, "user authenticated");
        record(Outcome::Success, start);

        Ok(Some(user))
    }

    async fn lookup(&self, username: &str, password: &str) -> Result<Lookup> {
        let settings = &self.config.ldap;
        let filter = render_filter(&settings.search_filter, username);

        for server in settings.server_uri.to_vec() {
            let mut session = match self
                .directory
                .bind(&server, username, password, settings.sasl_mech)
                .await
            {
                Ok(session) => session,
                Err(DirectoryError::Credentials) => {
                    tracing::info!(%server, "directory refused credentials");
                    return Ok(Lookup::Failed(Outcome::InvalidCredentials));
                },
                Err(DirectoryError::Connectivity(details)) => {
                    tracing::warn!(%server, %details, "directory server unreachable");
                    server_failure(&server);
                    continue;
                },
                Err(DirectoryError::Rejected(details)) => {
                    tracing::warn!(%server, %details, "directory rejected bind");
                    return Ok(Lookup::Failed(Outcome::Rejected));
                },
                Err(DirectoryError::Unsupported(details)) => {
                    return Err(BackendError::config(format!(
                        "bind on `{server}` failed: {details}"
                    )));
                },
            };

            let lookup = self.search(session.as_mut(), &server, &filter).await;
            session.unbind().await;

            match lookup? {
                Lookup::NextServer => continue,
                lookup => return Ok(lookup),
            }
        }

        tracing::warn!("no directory server reachable");
        Ok(Lookup::Failed(Outcome::Unreachable))
    }

    /// Apply connection options then search for the user entry. The caller
    /// owns the session and releases it.
    async fn search(
        &self,
        session: &mut dyn DirectorySession,
        server: &str,
        filter: &str,
    ) -> Result<Lookup> {
        let settings = &self.config.ldap;

        for option in settings.connection_options.to_vec() {
            session.set_option(&option).map_err(|err| {
                BackendError::config(format!(
                    "connection option {option:?} refused by `{server}`: {err}"
                ))
            })?;
        }

        match session.search(&settings.search_dn, filter).await {
            Ok(mut entries) => match entries.len() {
                0 => {
                    tracing::info!(%server, %filter, "user not found");
                    Ok(Lookup::Failed(Outcome::NotFound))
                },
                1 => Ok(entries
                    .pop()
                    .map_or(Lookup::Failed(Outcome::NotFound), Lookup::Found)),
                count => {
                    tracing::error!(
                        %server,
                        %filter,
                        count,
                        "search matched several entries"
                    );
                    Ok(Lookup::Failed(Outcome::Ambiguous))
                },
            },
            Err(DirectoryError::Connectivity(details)) => {
                tracing::warn!(%server, %details, "search failed, trying next server");
                server_failure(server);
                Ok(Lookup::NextServer)
            },
            Err(err) => {
                tracing::warn!(%server, error = %err, "search failed");
                Ok(Lookup::Failed(Outcome::SearchFailed))
            },
        }
    }
}

fn record(outcome: Outcome, start: Instant) {
    if outcome != Outcome::Success {
        tracing::info!(outcome = outcome.as_str(), "authentication failed");
    }

    metrics::counter!("ldap_authentications_total", "outcome" => outcome.as_str())
        .increment(1);
    metrics::histogram!("ldap_authentication_duration_seconds")
        .record(start.elapsed().as_secs_f64());
}

fn server_failure(server: &str) {
    metrics::counter!("ldap_server_failures_total", "server" => server.to_owned())
        .increment(1);
}
