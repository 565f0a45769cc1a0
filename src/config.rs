//! Configuration manager for ldapsync.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;
use validator::{Validate, ValidationError};

use crate::error::Result;
use crate::ldap::{ConnectionOptions, SaslMechanism, USER_PLACEHOLDER};
use crate::membership::RequirementExpression;
use crate::user::{UserField, UserFlag};

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const LDAP_SCHEMES: [&str; 3] = ["ldap", "ldaps", "ldapi"];

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    /// Related to directory authentication.
    #[serde(default)]
    #[validate(nested)]
    pub ldap: LdapSettings,
    /// Related to PostgreSQL configuration.
    /// In-memory storage is used when missing.
    #[serde(skip_serializing)]
    pub postgres: Option<Postgres>,
    #[serde(skip)]
    path: PathBuf,
}

/// One server URI or an ordered list of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerUri {
    One(String),
    List(Vec<String>),
}

impl ServerUri {
    /// Servers in the order they must be tried.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            ServerUri::One(uri) => vec![uri.clone()],
            ServerUri::List(uris) => uris.clone(),
        }
    }
}

impl Default for ServerUri {
    fn default() -> Self {
        ServerUri::One("ldap://localhost".into())
    }
}

/// Directory and synchronization settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct LdapSettings {
    /// Servers tried in order until one gives a decisive answer.
    #[validate(custom(function = "validate_servers"))]
    pub server_uri: ServerUri,
    /// Options applied to each session after bind.
    pub connection_options: ConnectionOptions,
    /// Flags set from `memberOf`.
    pub user_flags_by_group: BTreeMap<UserFlag, RequirementExpression>,
    /// Local groups granted (or revoked) from `memberOf`.
    pub user_groups_by_group: BTreeMap<String, RequirementExpression>,
    /// Local field to directory attribute.
    pub user_attr_map: BTreeMap<UserField, String>,
    pub sasl_mech: SaslMechanism,
    /// Login name to bind name, used by `SIMPLE` binds.
    #[validate(custom(function = "validate_placeholder"))]
    pub bind_template: String,
    /// Search base.
    #[validate(length(min = 1, message = "Search DN must not be empty."))]
    pub search_dn: String,
    /// Search filter, `{user}` is replaced with the escaped login name.
    #[validate(custom(function = "validate_placeholder"))]
    pub search_filter: String,
    /// Bind and search timeout, in seconds.
    #[validate(range(min = 1, message = "Timeout must be positive."))]
    pub timeout: u64,
    pub starttls: bool,
    pub no_tls_verify: bool,
    /// Protocol logging verbosity.
    pub trace_level: u8,
}

impl Default for LdapSettings {
    fn default() -> Self {
        Self {
            server_uri: ServerUri::default(),
            connection_options: ConnectionOptions::default(),
            user_flags_by_group: BTreeMap::new(),
            user_groups_by_group: BTreeMap::new(),
            user_attr_map: BTreeMap::new(),
            sasl_mech: SaslMechanism::default(),
            bind_template: USER_PLACEHOLDER.into(),
            search_dn: "DC=localdomain,DC=ORG".into(),
            search_filter: "(sAMAccountName={user})".into(),
            timeout: 10,
            starttls: false,
            no_tls_verify: false,
            trace_level: 0,
        }
    }
}

impl LdapSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// PostgreSQL configuration.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Postgres {
    /// Hostname:(?port) for PostgreSQL instance.
    pub address: String,
    /// Database name.
    pub database: Option<String>,
    /// Username credential to connect.
    pub username: Option<String>,
    /// Password credential to connect.
    pub password: Option<String>,
    /// Maximum pool connections.
    pub pool_size: Option<u32>,
}

fn validate_servers(servers: &ServerUri) -> std::result::Result<(), ValidationError> {
    let servers = servers.to_vec();
    if servers.is_empty() {
        return Err(ValidationError::new("server_uri")
            .with_message("At least one server is required.".into()));
    }

    for server in servers {
        let valid = Url::parse(&server)
            .map(|url| LDAP_SCHEMES.contains(&url.scheme()))
            .unwrap_or(false);
        if !valid {
            return Err(ValidationError::new("server_uri").with_message(
                format!("`{server}` is not an ldap, ldaps or ldapi URI.")
                    .into(),
            ));
        }
    }

    Ok(())
}

fn validate_placeholder(value: &str) -> std::result::Result<(), ValidationError> {
    if value.contains(USER_PLACEHOLDER) {
        Ok(())
    } else {
        Err(ValidationError::new("placeholder")
            .with_message("Template must contain `{user}`.".into()))
    }
}

impl Configuration {
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Replace the `ldap` section.
    pub fn with_ldap(mut self, ldap: LdapSettings) -> Self {
        self.ldap = ldap;
        self
    }

    /// Reads and validates the `config.yaml` file from the specified path
    /// or the default location.
    pub fn read(self) -> Result<Arc<Self>> {
        let file_path = if self.path.as_os_str().is_empty() {
            PathBuf::from(DEFAULT_CONFIG_PATH)
        } else {
            self.path
        };

        let file = File::open(&file_path).inspect_err(|err| {
            tracing::error!(
                error = %err,
                path = %file_path.display(),
                "cannot open configuration file"
            );
        })?;
        let mut config: Configuration = serde_yaml::from_reader(file)?;
        config.validate()?;
        config.path = file_path;

        tracing::debug!(
            path = %config.path.display(),
            servers = config.ldap.server_uri.to_vec().len(),
            "configuration loaded"
        );

        Ok(Arc::new(config))
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(document: &str) -> Result<Self> {
        let config: Configuration = serde_yaml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap::{ConnectionOption, Deref};

    const FULL: &str = r#"
ldap:
  server_uri:
    - ldap://down-host
    - ldaps://good-host:636
  connection_options:
    referrals: false
    size_limit: 2
    deref: always
  user_flags_by_group:
    is_superuser: cn=superuser
    is_staff:
      - cn=staff,ou=groups
      - cn=admins
  user_groups_by_group:
    MyPonies: cn=fake,cn=superuser,ou=foo
  user_attr_map:
    first_name: givenName
    email: mail
  sasl_mech: SIMPLE
  bind_template: "{user}@corp.example"
  search_dn: o=test
  search_filter: "(uid={user})"
  timeout: 3
postgres:
  address: localhost:5432
"#;

    #[test]
    fn test_full_document() {
        let config = Configuration::from_yaml(FULL).unwrap();
        let ldap = &config.ldap;

        assert_eq!(
            ldap.server_uri.to_vec(),
            vec!["ldap://down-host", "ldaps://good-host:636"]
        );
        assert_eq!(
            ldap.connection_options.to_vec(),
            vec![
                ConnectionOption::Referrals(false),
                ConnectionOption::SizeLimit(2),
                ConnectionOption::Deref(Deref::Always),
            ]
        );
        assert_eq!(
            ldap.user_flags_by_group[&UserFlag::IsSuperuser],
            RequirementExpression::from("cn=superuser")
        );
        assert_eq!(
            ldap.user_flags_by_group[&UserFlag::IsStaff],
            RequirementExpression::from(vec!["cn=staff,ou=groups", "cn=admins"])
        );
        assert_eq!(ldap.user_attr_map[&UserField::FirstName], "givenName");
        assert_eq!(ldap.sasl_mech, SaslMechanism::Simple);
        assert_eq!(ldap.timeout(), Duration::from_secs(3));
        assert_eq!(config.postgres.unwrap().address, "localhost:5432");
    }

    #[test]
    fn test_defaults() {
        let config = Configuration::from_yaml("ldap: {}").unwrap();
        assert_eq!(config.ldap, LdapSettings::default());
        assert_eq!(config.ldap.server_uri.to_vec(), vec!["ldap://localhost"]);
        assert_eq!(config.ldap.sasl_mech, SaslMechanism::DigestMd5);
        assert_eq!(config.ldap.search_filter, "(sAMAccountName={user})");
        assert!(config.postgres.is_none());
    }

    #[test]
    fn test_single_server() {
        let config =
            Configuration::from_yaml("ldap:\n  server_uri: ldap://localhost/")
                .unwrap();
        assert_eq!(config.ldap.server_uri.to_vec(), vec!["ldap://localhost/"]);
    }

    #[test]
    fn test_rejects_unknown_names() {
        let err = Configuration::from_yaml(
            "ldap:\n  user_flags_by_group:\n    is_wizard: cn=a",
        )
        .unwrap_err();
        assert!(err.is_config());

        let err = Configuration::from_yaml(
            "ldap:\n  user_attr_map:\n    nickname: cn",
        )
        .unwrap_err();
        assert!(err.is_config());

        let err = Configuration::from_yaml(
            "ldap:\n  connection_options:\n    opt1: value1",
        )
        .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_rejects_invalid_values() {
        for document in [
            "ldap:\n  search_filter: (uid=alice)",
            "ldap:\n  bind_template: cn=admin",
            "ldap:\n  server_uri: http://localhost",
            "ldap:\n  server_uri: []",
            "ldap:\n  search_dn: ''",
            "ldap:\n  timeout: 0",
        ] {
            let err = Configuration::from_yaml(document).unwrap_err();
            assert!(err.is_config(), "{document} should be rejected");
        }
    }

    #[test]
    fn test_read_missing_file() {
        let err = Configuration::default()
            .path("/nonexistent/ldapsync.yaml")
            .read()
            .unwrap_err();
        assert!(matches!(err, crate::error::BackendError::Io(_)));
    }
}
