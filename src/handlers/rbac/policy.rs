//! Authorization policy evaluation.
//!
//! Policies are CSV documents in the casbin style used by the RBAC ConfigMap:
//!
//! ```text
//! p, role:dba, database-clusters, *, production/*
//! p, role:dba, backup-storages, read, */*
//! g, alice, role:dba
//! ```
//!
//! A `p` line grants `subject` the `action` on objects of `resource` matching
//! `namespace/name`. A `g` line makes a user or role a member of a role.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::ConfigMap;
use tracing::debug;

use crate::handlers::{Error, Result};

/// ConfigMap key holding the CSV policy
pub const POLICY_KEY: &str = "policy.csv";
/// ConfigMap key toggling enforcement ("true"/"false")
pub const ENABLED_KEY: &str = "enabled";

/// Decides whether a subject may perform an action on an object.
pub trait Enforcer: Send + Sync {
    fn enforce(&self, subject: &str, resource: &str, action: &str, object: &str) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub subject: String,
    pub resource: String,
    pub action: String,
    pub object: String,
}

impl PolicyRule {
    fn matches(&self, resource: &str, action: &str, object: &str) -> bool {
        glob_match(&self.resource, resource)
            && glob_match(&self.action, action)
            && object_matches(&self.object, object)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    enabled: bool,
    rules: Vec<PolicyRule>,
    /// member -> roles it belongs to directly
    roles: BTreeMap<String, BTreeSet<String>>,
}

impl Policy {
    /// A policy that allows everything.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn parse(csv: &str) -> Result<Self> {
        let mut policy = Policy {
            enabled: true,
            ..Default::default()
        };

        for (idx, raw) in csv.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            match fields.as_slice() {
                ["p", subject, resource, action, object] => policy.rules.push(PolicyRule {
                    subject: subject.to_string(),
                    resource: resource.to_string(),
                    action: action.to_string(),
                    object: object.to_string(),
                }),
                ["g", member, role] => {
                    policy
                        .roles
                        .entry(member.to_string())
                        .or_default()
                        .insert(role.to_string());
                }
                _ => {
                    return Err(Error::Policy(format!(
                        "line {}: unrecognised policy line '{line}'",
                        idx + 1
                    )));
                }
            }
        }

        debug!(
            rules = policy.rules.len(),
            members = policy.roles.len(),
            "Parsed authorization policy"
        );
        Ok(policy)
    }

    /// Build a policy from the RBAC ConfigMap. A missing `enabled` key means
    /// enforcement is on.
    pub fn from_config_map(cm: &ConfigMap) -> Result<Self> {
        let data = cm.data.clone().unwrap_or_default();
        let enabled = match data.get(ENABLED_KEY).map(|v| v.trim()) {
            None | Some("true") => true,
            Some("false") => false,
            Some(other) => {
                return Err(Error::Policy(format!("invalid '{ENABLED_KEY}' value '{other}'")));
            }
        };
        if !enabled {
            return Ok(Self::disabled());
        }
        Self::parse(data.get(POLICY_KEY).map(String::as_str).unwrap_or_default())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// The subject itself plus every role it belongs to, transitively.
    fn subjects_of<'a>(&'a self, subject: &'a str) -> BTreeSet<&'a str> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![subject];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(roles) = self.roles.get(current) {
                stack.extend(roles.iter().map(String::as_str));
            }
        }
        seen
    }
}

impl Enforcer for Policy {
    fn enforce(&self, subject: &str, resource: &str, action: &str, object: &str) -> Result<bool> {
        if !self.enabled {
            return Ok(true);
        }
        let subjects = self.subjects_of(subject);
        Ok(self
            .rules
            .iter()
            .any(|r| subjects.contains(r.subject.as_str()) && r.matches(resource, action, object)))
    }
}

/// `*` matches anything; a trailing `*` matches by prefix.
fn glob_match(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

/// Compare `namespace/name` objects segment by segment.
fn object_matches(pattern: &str, object: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match (pattern.split_once('/'), object.split_once('/')) {
        (Some((pat_ns, pat_name)), Some((ns, name))) => {
            glob_match(pat_ns, ns) && glob_match(pat_name, name)
        }
        (None, None) => glob_match(pattern, object),
        _ => false,
    }
}
