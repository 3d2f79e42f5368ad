//! Command and daemon definition records.
//!
//! These are the records the package system hands to the runtime: a
//! declarative command (`CmdDef`) with its argument specs and query body,
//! and a daemon registration (`DaemonDef`). Both validate at load time so
//! execution never starts on a malformed definition.

use std::collections::BTreeMap;

use common_error::{StrataError, StrataResult};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::value::Value;

/// How an argument consumes tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgAction {
    /// Store a single (or nargs-counted) value.
    #[default]
    Store,
    /// Store `true`, consuming no tokens.
    StoreTrue,
    /// Store `false`, consuming no tokens.
    StoreFalse,
    /// Accumulate repeated values into a list.
    Append,
}

/// Argument arity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nargs {
    /// Exactly `n` tokens.
    Exact(usize),
    /// Zero or one token (`?`).
    Opt,
    /// Zero or more tokens (`*`).
    Star,
    /// One or more tokens (`+`).
    Plus,
}

impl Serialize for Nargs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Exact(n) => serializer.serialize_u64(*n as u64),
            Self::Opt => serializer.serialize_str("?"),
            Self::Star => serializer.serialize_str("*"),
            Self::Plus => serializer.serialize_str("+"),
        }
    }
}

impl<'de> Deserialize<'de> for Nargs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Count(usize),
            Glyph(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Count(n) => Ok(Self::Exact(n)),
            Raw::Glyph(s) => match s.as_str() {
                "?" => Ok(Self::Opt),
                "*" => Ok(Self::Star),
                "+" => Ok(Self::Plus),
                other => Err(D::Error::custom(format!("invalid nargs: {other}"))),
            },
        }
    }
}

/// One argument spec within a command definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdArgDef {
    /// Argument spellings; a leading dash marks an option.
    pub name: String,
    /// Alternate spellings (e.g. a short form).
    #[serde(default)]
    pub names: Vec<String>,
    /// Help text shown in usage output.
    #[serde(default)]
    pub help: Option<String>,
    /// Token consumption behavior.
    #[serde(default)]
    pub action: ArgAction,
    /// Arity; `None` means exactly one token.
    #[serde(default)]
    pub nargs: Option<Nargs>,
    /// Model type name used to normalize values.
    #[serde(default, rename = "type")]
    pub argtype: Option<String>,
    /// Default value when the argument is absent.
    #[serde(default)]
    pub default: Option<Value>,
    /// Required options produce a help state when missing.
    #[serde(default)]
    pub required: bool,
}

impl CmdArgDef {
    /// Create a spec with defaults for everything but the name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            names: Vec::new(),
            help: None,
            action: ArgAction::Store,
            nargs: None,
            argtype: None,
            default: None,
            required: false,
        }
    }
}

/// A declarative (data-defined) command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdDef {
    /// Dotted command name, e.g. `foo.bar.baz`.
    pub name: String,
    /// One-line description.
    #[serde(default)]
    pub descr: Option<String>,
    /// Query body executed per invocation.
    pub storm: String,
    /// Argument specs, in declaration order.
    #[serde(default)]
    pub cmdargs: Vec<CmdArgDef>,
    /// Run the body with elevated privileges (permission gated).
    #[serde(default)]
    pub asroot: bool,
    /// Free-form configuration passed into the nested scope.
    #[serde(default)]
    pub cmdconf: BTreeMap<String, Value>,
}

impl CmdDef {
    /// Validate the definition, failing with `BadDef` on problems.
    ///
    /// Command names are dotted sequences of lowercase segments, each
    /// starting with a letter.
    pub fn validate(&self) -> StrataResult<()> {
        if self.name.is_empty() {
            return Err(StrataError::bad_def("Command name may not be empty"));
        }
        for part in self.name.split('.') {
            let mut chars = part.chars();
            let valid = match chars.next() {
                Some(c) if c.is_ascii_lowercase() => {
                    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
                }
                _ => false,
            };
            if !valid {
                return Err(StrataError::bad_def(format!(
                    "Invalid command name: {}",
                    self.name
                )));
            }
        }
        if self.storm.is_empty() {
            return Err(StrataError::bad_def(format!(
                "Command {} has no storm body",
                self.name
            )));
        }
        Ok(())
    }
}

/// Per-daemon query options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonOpts {
    /// Target view iden.
    #[serde(default)]
    pub view: Option<String>,
    /// Variables seeded into the daemon's runtime.
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
}

/// A registered background daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonDef {
    /// Stable daemon iden.
    pub iden: String,
    /// Display name.
    #[serde(default = "DaemonDef::default_name")]
    pub name: String,
    /// Query text the daemon runs.
    pub storm: String,
    /// Query options (target view, seeded vars).
    #[serde(default)]
    pub stormopts: DaemonOpts,
    /// Disabled daemons are registered but not started.
    #[serde(default = "DaemonDef::default_enabled")]
    pub enabled: bool,
    /// Owning identity iden.
    pub user: String,
}

impl DaemonDef {
    fn default_name() -> String {
        "daemon".to_string()
    }

    fn default_enabled() -> bool {
        true
    }

    /// Validate the definition, failing with `BadDef` on problems.
    pub fn validate(&self) -> StrataResult<()> {
        if self.iden.is_empty() {
            return Err(StrataError::bad_def("Daemon iden may not be empty"));
        }
        if self.storm.is_empty() {
            return Err(StrataError::bad_def(format!(
                "Daemon {} has no storm body",
                self.iden
            )));
        }
        if self.user.is_empty() {
            return Err(StrataError::bad_def(format!(
                "Daemon {} has no owning user",
                self.iden
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmddef_validate() {
        let mut cdef = CmdDef {
            name: "foo.bar".to_string(),
            descr: None,
            storm: "help".to_string(),
            cmdargs: vec![],
            asroot: false,
            cmdconf: BTreeMap::new(),
        };
        assert!(cdef.validate().is_ok());

        cdef.name = "Foo.bar".to_string();
        assert!(cdef.validate().is_err());

        cdef.name = "foo..bar".to_string();
        assert!(cdef.validate().is_err());
    }

    #[test]
    fn test_cmddef_deserialize() {
        let text = r#"{
            "name": "testcmd",
            "storm": "help",
            "cmdargs": [
                {"name": "--degrees", "type": "int", "default": {"Int": 1}},
                {"name": "query", "help": "The query."}
            ]
        }"#;
        let cdef: CmdDef = serde_json::from_str(text).unwrap();
        assert!(cdef.validate().is_ok());
        assert_eq!(cdef.cmdargs.len(), 2);
        assert_eq!(cdef.cmdargs[0].argtype.as_deref(), Some("int"));
        assert_eq!(cdef.cmdargs[0].default, Some(Value::Int(1)));
        assert!(!cdef.asroot);
    }

    #[test]
    fn test_nargs_serde() {
        let specs: Vec<Nargs> = serde_json::from_str(r#"["?", "*", "+", 2]"#).unwrap();
        assert_eq!(specs, vec![Nargs::Opt, Nargs::Star, Nargs::Plus, Nargs::Exact(2)]);
        assert_eq!(serde_json::to_string(&Nargs::Star).unwrap(), "\"*\"");
    }

    #[test]
    fn test_daemondef_validate() {
        let ddef = DaemonDef {
            iden: "dmon00".to_string(),
            name: DaemonDef::default_name(),
            storm: "it:dev:str".to_string(),
            stormopts: DaemonOpts {
                view: Some("view00".to_string()),
                vars: BTreeMap::new(),
            },
            enabled: true,
            user: "root".to_string(),
        };
        assert!(ddef.validate().is_ok());

        let bad = DaemonDef {
            storm: String::new(),
            ..ddef
        };
        assert!(bad.validate().is_err());
    }
}
