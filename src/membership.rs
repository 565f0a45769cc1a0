//! Group membership matching.
//!
//! A `memberOf` value such as `CN=Admins,OU=Groups,DC=corp` becomes the
//! component list `["cn=admins", "ou=groups", "dc=corp"]`. A requirement
//! `"cn=admins,dc=corp"` holds when one membership contains every required
//! component, in any order.

use serde::{Deserialize, Serialize};

use crate::ldap::DirectoryEntry;

/// Directory attribute listing the groups of an entry.
pub const MEMBER_OF: &str = "memberOf";

/// Lowercased components of every `memberOf` value of an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipList(Vec<Vec<String>>);

impl MembershipList {
    /// Build a [`MembershipList`] from raw distinguished names.
    pub fn new<I, S>(dns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(dns.into_iter().map(|dn| split_lower(dn.as_ref())).collect())
    }

    /// Read `memberOf` from a directory entry. Missing attribute gives an
    /// empty list.
    pub fn from_entry(entry: &DirectoryEntry) -> Self {
        Self::new(entry.values(MEMBER_OF).unwrap_or_default())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    fn iter(&self) -> impl Iterator<Item = &[String]> {
        self.0.iter().map(Vec::as_slice)
    }
}

/// Which memberships grant a flag or a group.
///
/// A single string or a list of strings. Strings are alternatives, the
/// comma-separated components inside one string are all required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequirementExpression {
    One(String),
    Any(Vec<String>),
}

impl RequirementExpression {
    /// Every alternative, as lowercased component lists.
    fn alternatives(&self) -> Vec<Vec<String>> {
        match self {
            RequirementExpression::One(requirement) => {
                vec![split_lower(requirement)]
            },
            RequirementExpression::Any(requirements) => {
                requirements.iter().map(|r| split_lower(r)).collect()
            },
        }
    }
}

impl From<&str> for RequirementExpression {
    fn from(value: &str) -> Self {
        RequirementExpression::One(value.to_owned())
    }
}

impl<S: Into<String>> From<Vec<S>> for RequirementExpression {
    fn from(value: Vec<S>) -> Self {
        RequirementExpression::Any(value.into_iter().map(Into::into).collect())
    }
}

/// Check whether any membership satisfies any alternative of
/// `requirement`.
pub fn satisfied(
    memberships: &MembershipList,
    requirement: &RequirementExpression,
) -> bool {
    if memberships.is_empty() {
        return false;
    }

    requirement.alternatives().iter().any(|required| {
        memberships.iter().any(|membership| {
            required
                .iter()
                .all(|component| membership.contains(component))
        })
    })
}

fn split_lower(value: &str) -> Vec<String> {
    value.to_lowercase().split(',').map(str::to_owned).collect()
}
