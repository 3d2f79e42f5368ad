//! Identities and permission checks.

use common_error::{StrataError, StrataResult};
use serde::{Deserialize, Serialize};

/// An ordered allow/deny rule over a dotted permission prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Grant (`true`) or deny (`false`) on match.
    pub allow: bool,
    /// Permission path prefix the rule matches.
    pub perm: Vec<String>,
    /// Restrict the rule to a single auth gate (layer or view iden).
    pub gate: Option<String>,
}

impl Rule {
    fn matches(&self, perm: &[&str], gate: Option<&str>) -> bool {
        if let Some(ref rulegate) = self.gate {
            if gate != Some(rulegate.as_str()) {
                return false;
            }
        }
        if self.perm.len() > perm.len() {
            return false;
        }
        self.perm.iter().zip(perm.iter()).all(|(a, b)| a == b)
    }
}

/// The acting identity for a runtime, daemon, or detached task.
///
/// Permission checks walk the rules in order; the first matching rule
/// decides. Admins bypass rule evaluation entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    /// Stable identity iden.
    pub iden: String,
    /// Display name.
    pub name: String,
    /// Admin identities pass every permission check.
    pub admin: bool,
    /// Ordered permission rules.
    pub rules: Vec<Rule>,
}

impl Identity {
    /// Create an admin identity.
    pub fn root(iden: impl Into<String>) -> Self {
        let iden = iden.into();
        Self {
            name: iden.clone(),
            iden,
            admin: true,
            rules: Vec::new(),
        }
    }

    /// Create a non-admin identity with no rules.
    pub fn user(iden: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            iden: iden.into(),
            name: name.into(),
            admin: false,
            rules: Vec::new(),
        }
    }

    /// Append an allow rule for a permission prefix.
    pub fn allow(mut self, perm: &[&str]) -> Self {
        self.rules.push(Rule {
            allow: true,
            perm: perm.iter().map(|p| p.to_string()).collect(),
            gate: None,
        });
        self
    }

    /// Append an allow rule scoped to a gate.
    pub fn allow_on(mut self, gate: impl Into<String>, perm: &[&str]) -> Self {
        self.rules.push(Rule {
            allow: true,
            perm: perm.iter().map(|p| p.to_string()).collect(),
            gate: Some(gate.into()),
        });
        self
    }

    /// Append a deny rule for a permission prefix.
    pub fn deny(mut self, perm: &[&str]) -> Self {
        self.rules.push(Rule {
            allow: false,
            perm: perm.iter().map(|p| p.to_string()).collect(),
            gate: None,
        });
        self
    }

    /// Check a permission without failing.
    pub fn allowed(&self, perm: &[&str], gate: Option<&str>) -> bool {
        if self.admin {
            return true;
        }
        for rule in &self.rules {
            if rule.matches(perm, gate) {
                return rule.allow;
            }
        }
        false
    }

    /// Require a permission, failing with `AuthDeny` when absent.
    pub fn confirm(&self, perm: &[&str], gate: Option<&str>) -> StrataResult<()> {
        if self.allowed(perm, gate) {
            return Ok(());
        }
        let mesg = format!("User {} requires permission {}", self.name, perm.join("."));
        Err(StrataError::auth_deny(mesg, perm))
    }

    /// True when the identity is an admin (optionally for a gate).
    pub fn is_admin(&self, _gate: Option<&str>) -> bool {
        self.admin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_bypass() {
        let root = Identity::root("root");
        assert!(root.allowed(&["node", "add", "inet:ipv4"], None));
        assert!(root.confirm(&["anything"], Some("layr00")).is_ok());
    }

    #[test]
    fn test_rule_prefix_match() {
        let user = Identity::user("u01", "visi").allow(&["node", "tag", "add"]);
        assert!(user.allowed(&["node", "tag", "add", "cno", "mal"], None));
        assert!(!user.allowed(&["node", "tag", "del", "cno"], None));
    }

    #[test]
    fn test_rule_order_first_wins() {
        let user = Identity::user("u01", "visi")
            .deny(&["node", "add", "inet:fqdn"])
            .allow(&["node", "add"]);
        assert!(!user.allowed(&["node", "add", "inet:fqdn"], None));
        assert!(user.allowed(&["node", "add", "inet:ipv4"], None));
    }

    #[test]
    fn test_gate_scoping() {
        let user = Identity::user("u01", "visi").allow_on("layr00", &["node", "del"]);
        assert!(user.allowed(&["node", "del", "it:dev:str"], Some("layr00")));
        assert!(!user.allowed(&["node", "del", "it:dev:str"], Some("layr01")));
        assert!(!user.allowed(&["node", "del", "it:dev:str"], None));
    }

    #[test]
    fn test_confirm_denied() {
        let user = Identity::user("u01", "visi");
        let err = user.confirm(&["view", "read"], Some("view00")).unwrap_err();
        assert!(err.is_auth_deny());
    }
}
