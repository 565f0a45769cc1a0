//! LDAP support.
//!
//! [`DirectoryClient`] and [`DirectorySession`] are the only things the
//! backend knows about a directory server. [`Ldap3Directory`] implements
//! them over [`ldap3`].

use std::borrow::Cow;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use ldap3::{
    DerefAliases, Ldap as Ldap3, LdapConnAsync, LdapConnSettings, LdapError,
    Scope, SearchEntry, SearchOptions, dn_escape,
};
use serde::{Deserialize, Serialize};

use crate::config::LdapSettings;
use crate::error::{BackendError, Result};
use crate::membership::MEMBER_OF;

/// `invalidCredentials` and `inappropriateAuthentication`.
const RC_CREDENTIALS: [u32; 2] = [49, 48];
/// `busy`, `unavailable` and `unwillingToPerform`.
const RC_UNAVAILABLE: [u32; 3] = [51, 52, 53];
/// Placeholder replaced by the login name in filters and bind templates.
pub const USER_PLACEHOLDER: &str = "{user}";
/// `memberOf` is operational on OpenLDAP and not covered by `*`.
const SEARCH_ATTRIBUTES: [&str; 2] = ["*", MEMBER_OF];

/// Failure reported by a directory server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    /// Server unreachable, timed out or not serving.
    #[error("directory unreachable: {0}")]
    Connectivity(String),
    /// Bind refused the credentials.
    #[error("invalid credentials")]
    Credentials,
    /// Server answered with a non-success result code.
    #[error("directory rejected the operation: {0}")]
    Rejected(String),
    /// Requested feature cannot be provided by the client.
    #[error("unsupported by directory client: {0}")]
    Unsupported(String),
}

impl From<LdapError> for DirectoryError {
    fn from(err: LdapError) -> Self {
        match err {
            LdapError::LdapResult { result } => {
                classify(result.rc, result.to_string())
            },
            other => DirectoryError::Connectivity(other.to_string()),
        }
    }
}

fn classify(rc: u32, details: String) -> DirectoryError {
    if RC_CREDENTIALS.contains(&rc) {
        DirectoryError::Credentials
    } else if RC_UNAVAILABLE.contains(&rc) {
        DirectoryError::Connectivity(details)
    } else {
        DirectoryError::Rejected(details)
    }
}

/// Bind mechanism.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaslMechanism {
    /// Simple bind with a DN built from `bind_template`.
    #[serde(rename = "SIMPLE", alias = "simple")]
    Simple,
    /// SASL EXTERNAL. Refused: the identity comes from TLS or `ldapi` peer
    /// credentials, never from the user's password.
    #[serde(rename = "EXTERNAL", alias = "external")]
    External,
    #[default]
    #[serde(rename = "DIGEST-MD5", alias = "digest-md5")]
    DigestMd5,
}

impl std::fmt::Display for SaslMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SaslMechanism::Simple => write!(f, "SIMPLE"),
            SaslMechanism::External => write!(f, "EXTERNAL"),
            SaslMechanism::DigestMd5 => write!(f, "DIGEST-MD5"),
        }
    }
}

/// Alias dereferencing during search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Deref {
    Never,
    Searching,
    Finding,
    Always,
}

impl From<Deref> for DerefAliases {
    fn from(value: Deref) -> Self {
        match value {
            Deref::Never => DerefAliases::Never,
            Deref::Searching => DerefAliases::Searching,
            Deref::Finding => DerefAliases::Finding,
            Deref::Always => DerefAliases::Always,
        }
    }
}

/// One option applied to a session after bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOption {
    Referrals(bool),
    SizeLimit(i32),
    TimeLimit(i32),
    Deref(Deref),
}

/// Options applied to every session, keyed by name in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionOptions {
    /// Follow referrals returned by the server.
    pub referrals: Option<bool>,
    /// Server-side limit on returned entries.
    pub size_limit: Option<i32>,
    /// Server-side limit on search duration, in seconds.
    pub time_limit: Option<i32>,
    pub deref: Option<Deref>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            referrals: Some(false),
            size_limit: None,
            time_limit: None,
            deref: None,
        }
    }
}

impl ConnectionOptions {
    /// Configured options, in a fixed order.
    pub fn to_vec(&self) -> Vec<ConnectionOption> {
        [
            self.referrals.map(ConnectionOption::Referrals),
            self.size_limit.map(ConnectionOption::SizeLimit),
            self.time_limit.map(ConnectionOption::TimeLimit),
            self.deref.map(ConnectionOption::Deref),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// One entry returned by a search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub dn: String,
    pub attrs: HashMap<String, Vec<String>>,
}

impl DirectoryEntry {
    /// Create a new [`DirectoryEntry`] without attributes.
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attrs: HashMap::new(),
        }
    }

    /// Add or replace attribute values.
    pub fn with_attribute<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attrs.insert(
            name.to_owned(),
            values.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Values of an attribute. Attribute names are case-insensitive in
    /// LDAP, so an exact match is preferred and any casing accepted.
    pub fn values(&self, name: &str) -> Option<&[String]> {
        self.attrs
            .get(name)
            .or_else(|| {
                self.attrs
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(name))
                    .map(|(_, values)| values)
            })
            .map(Vec::as_slice)
    }

    /// First value of an attribute.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.values(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }
}

impl From<SearchEntry> for DirectoryEntry {
    fn from(entry: SearchEntry) -> Self {
        Self {
            dn: entry.dn,
            attrs: entry.attrs.into_iter().collect(),
        }
    }
}

/// Capability to open an authenticated session on a directory server.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Connect to `server` and bind with the user credentials.
    async fn bind(
        &self,
        server: &str,
        username: &str,
        password: &str,
        mechanism: SaslMechanism,
    ) -> std::result::Result<Box<dyn DirectorySession>, DirectoryError>;
}

/// Bound session on one server.
#[async_trait]
pub trait DirectorySession: Send {
    /// Apply an option to later operations.
    fn set_option(
        &mut self,
        option: &ConnectionOption,
    ) -> std::result::Result<(), DirectoryError>;

    /// Subtree search under `base_dn`.
    async fn search(
        &mut self,
        base_dn: &str,
        filter: &str,
    ) -> std::result::Result<Vec<DirectoryEntry>, DirectoryError>;

    /// Release the connection. Never fails, errors are only logged.
    async fn unbind(&mut self);
}

/// Escape a value for use inside a search filter (RFC 4515).
pub fn escape_ldap(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '*' => out.push_str(r"\2a"),
            '(' => out.push_str(r"\28"),
            ')' => out.push_str(r"\29"),
            '\\' => out.push_str(r"\5c"),
            '\0' => out.push_str(r"\00"),
            c => out.push(c),
        }
    }
    out
}

/// Substitute the escaped username into a filter template.
pub fn render_filter(template: &str, username: &str) -> String {
    template.replace(USER_PLACEHOLDER, &escape_ldap(username))
}

/// [`DirectoryClient`] backed by [`ldap3`].
#[derive(Debug, Clone)]
pub struct Ldap3Directory {
    timeout: Duration,
    starttls: bool,
    no_tls_verify: bool,
    bind_template: String,
    trace_level: u8,
}

impl Ldap3Directory {
    /// Create a new [`Ldap3Directory`].
    ///
    /// Fails unless the configured mechanism is `SIMPLE`, the only one
    /// that checks the user's password with [`ldap3`].
    pub fn new(settings: &LdapSettings) -> Result<Self> {
        if settings.sasl_mech != SaslMechanism::Simple {
            return Err(BackendError::config(format!(
                "`{}` cannot verify user passwords, use `SIMPLE`",
                settings.sasl_mech
            )));
        }

        Ok(Self {
            timeout: settings.timeout(),
            starttls: settings.starttls,
            no_tls_verify: settings.no_tls_verify,
            bind_template: settings.bind_template.clone(),
            trace_level: settings.trace_level,
        })
    }

    /// Bind name for `username`. DN templates (`uid={user},ou=people`)
    /// get an RFC 4514 escaped value, UPN (`{user}@corp`) and down-level
    /// (`CORP\{user}`) templates take it verbatim.
    fn bind_dn(&self, username: &str) -> String {
        let value = if self.bind_template.contains('=') {
            dn_escape(username)
        } else {
            Cow::Borrowed(username)
        };
        self.bind_template.replace(USER_PLACEHOLDER, &value)
    }
}

#[async_trait]
impl DirectoryClient for Ldap3Directory {
    async fn bind(
        &self,
        server: &str,
        username: &str,
        password: &str,
        mechanism: SaslMechanism,
    ) -> std::result::Result<Box<dyn DirectorySession>, DirectoryError> {
        if mechanism != SaslMechanism::Simple {
            return Err(DirectoryError::Unsupported(mechanism.to_string()));
        }

        let settings = LdapConnSettings::new()
            .set_conn_timeout(self.timeout)
            .set_starttls(self.starttls)
            .set_no_tls_verify(self.no_tls_verify);

        if self.trace_level > 0 {
            tracing::debug!(%server, %mechanism, "opening LDAP connection");
        }

        let (conn, mut ldap) =
            LdapConnAsync::with_settings(settings, server).await?;
        ldap3::drive!(conn);

        let result = ldap
            .with_timeout(self.timeout)
            .simple_bind(&self.bind_dn(username), password)
            .await;

        if let Err(err) = result.and_then(|result| result.success()) {
            let _ = ldap.unbind().await;
            return Err(err.into());
        }

        if self.trace_level > 0 {
            tracing::debug!(%server, "LDAP bind succeeded");
        }

        Ok(Box::new(Ldap3Session {
            ldap,
            timeout: self.timeout,
            options: SessionOptions::default(),
            trace_level: self.trace_level,
        }))
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct SessionOptions {
    size_limit: Option<i32>,
    time_limit: Option<i32>,
    deref: Option<Deref>,
}

impl SessionOptions {
    fn search_options(&self) -> SearchOptions {
        let mut options = SearchOptions::new();
        if let Some(limit) = self.size_limit {
            options = options.sizelimit(limit);
        }
        if let Some(limit) = self.time_limit {
            options = options.timelimit(limit);
        }
        if let Some(deref) = self.deref {
            options = options.deref(deref.into());
        }
        options
    }
}

struct Ldap3Session {
    ldap: Ldap3,
    timeout: Duration,
    options: SessionOptions,
    trace_level: u8,
}

#[async_trait]
impl DirectorySession for Ldap3Session {
    fn set_option(
        &mut self,
        option: &ConnectionOption,
    ) -> std::result::Result<(), DirectoryError> {
        match *option {
            // ldap3 never chases referrals.
            ConnectionOption::Referrals(false) => {},
            ConnectionOption::Referrals(true) => {
                return Err(DirectoryError::Unsupported(
                    "referral chasing".into(),
                ));
            },
            ConnectionOption::SizeLimit(limit) => {
                self.options.size_limit = Some(limit)
            },
            ConnectionOption::TimeLimit(limit) => {
                self.options.time_limit = Some(limit)
            },
            ConnectionOption::Deref(deref) => self.options.deref = Some(deref),
        }
        Ok(())
    }

    async fn search(
        &mut self,
        base_dn: &str,
        filter: &str,
    ) -> std::result::Result<Vec<DirectoryEntry>, DirectoryError> {
        if self.trace_level > 0 {
            tracing::debug!(%base_dn, %filter, "LDAP search");
        }

        let (results, _) = self
            .ldap
            .with_search_options(self.options.search_options())
            .with_timeout(self.timeout)
            .search(base_dn, Scope::Subtree, filter, SEARCH_ATTRIBUTES.to_vec())
            .await?
            .success()?;

        let entries = results
            .into_iter()
            .filter(|result| !result.is_ref())
            .map(|result| DirectoryEntry::from(SearchEntry::construct(result)))
            .collect::<Vec<_>>();

        if self.trace_level > 1 {
            for entry in &entries {
                tracing::trace!(
                    dn = %entry.dn,
                    attributes = ?entry.attrs.keys().collect::<Vec<_>>(),
                    "LDAP search entry"
                );
            }
        }

        Ok(entries)
    }

    async fn unbind(&mut self) {
        if let Err(err) = self.ldap.unbind().await {
            tracing::debug!(error = %err, "LDAP unbind failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_ldap() {
        assert_eq!(escape_ldap("alice"), "alice");
        assert_eq!(escape_ldap("*)(uid=*"), r"\2a\29\28uid=\2a");
        assert_eq!(escape_ldap(r"a\b"), r"a\5cb");
        assert_eq!(escape_ldap("jöhn"), "jöhn");
    }

    #[test]
    fn test_render_filter() {
        assert_eq!(
            render_filter("(sAMAccountName={user})", "alice"),
            "(sAMAccountName=alice)"
        );
        assert_eq!(render_filter("(uid={user})", "a*"), r"(uid=a\2a)");
    }

    #[test]
    fn test_classify_result_codes() {
        assert_eq!(classify(49, String::new()), DirectoryError::Credentials);
        assert_eq!(classify(48, String::new()), DirectoryError::Credentials);
        assert!(matches!(
            classify(52, "unavailable".into()),
            DirectoryError::Connectivity(_)
        ));
        assert!(matches!(
            classify(32, "noSuchObject".into()),
            DirectoryError::Rejected(_)
        ));
    }

    #[test]
    fn test_io_error_is_connectivity() {
        let err = LdapError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(
            DirectoryError::from(err),
            DirectoryError::Connectivity(_)
        ));
    }

    #[test]
    fn test_entry_attribute_lookup() {
        let entry = DirectoryEntry::new("cn=alice,o=test")
            .with_attribute("memberOf", ["cn=a", "cn=b"])
            .with_attribute("mail", ["alice@example.org", "a@example.org"]);

        assert_eq!(entry.first("mail"), Some("alice@example.org"));
        assert_eq!(entry.values("MEMBEROF").map(<[String]>::len), Some(2));
        assert_eq!(entry.first("sn"), None);
    }

    #[test]
    fn test_entry_from_search_entry() {
        let entry = DirectoryEntry::from(SearchEntry {
            dn: "cn=alice,o=test".into(),
            attrs: HashMap::from([("cn".to_owned(), vec!["alice".to_owned()])]),
            bin_attrs: HashMap::new(),
        });

        assert_eq!(entry.dn, "cn=alice,o=test");
        assert_eq!(entry.first("cn"), Some("alice"));
    }

    #[test]
    fn test_connection_options() {
        assert_eq!(
            ConnectionOptions::default().to_vec(),
            vec![ConnectionOption::Referrals(false)]
        );

        let options = ConnectionOptions {
            referrals: None,
            size_limit: Some(2),
            time_limit: None,
            deref: Some(Deref::Always),
        };
        assert_eq!(
            options.to_vec(),
            vec![
                ConnectionOption::SizeLimit(2),
                ConnectionOption::Deref(Deref::Always)
            ]
        );
    }

    #[test]
    fn test_session_search_options() {
        let options = SessionOptions {
            size_limit: Some(2),
            ..Default::default()
        };
        // SearchOptions is opaque, building it must not panic.
        let _ = options.search_options();
    }

    fn simple(bind_template: &str) -> Ldap3Directory {
        Ldap3Directory::new(&LdapSettings {
            sasl_mech: SaslMechanism::Simple,
            bind_template: bind_template.into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_only_simple_bind_accepted() {
        let settings = LdapSettings::default();
        assert_eq!(settings.sasl_mech, SaslMechanism::DigestMd5);
        assert!(Ldap3Directory::new(&settings).unwrap_err().is_config());

        let settings = LdapSettings {
            sasl_mech: SaslMechanism::External,
            ..Default::default()
        };
        assert!(Ldap3Directory::new(&settings).unwrap_err().is_config());
    }

    #[tokio::test]
    async fn test_external_bind_never_connects() {
        // Nothing listens on port 1: an attempt would be `Connectivity`.
        let result = simple("{user}")
            .bind("ldap://127.0.0.1:1", "admin", "x", SaslMechanism::External)
            .await;
        assert!(matches!(result, Err(DirectoryError::Unsupported(_))));
    }

    #[test]
    fn test_bind_dn() {
        assert_eq!(
            simple("{user}@corp.example").bind_dn("alice"),
            "alice@corp.example"
        );
        assert_eq!(simple("{user}@corp.example").bind_dn("a,b"), "a,b@corp.example");

        let directory = simple("uid={user},ou=people,o=test");
        assert_eq!(directory.bind_dn("alice"), "uid=alice,ou=people,o=test");
        let escaped = directory.bind_dn("a,uid=admin");
        assert_eq!(
            escaped,
            format!("uid={},ou=people,o=test", dn_escape("a,uid=admin"))
        );
        assert!(!escaped.starts_with("uid=a,uid=admin"));
    }

    #[test]
    fn test_search_requests_member_of() {
        assert!(SEARCH_ATTRIBUTES.contains(&"*"));
        assert!(SEARCH_ATTRIBUTES.contains(&MEMBER_OF));
    }
}
