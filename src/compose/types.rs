//! Compose document types.
//!
//! A pragmatic subset of the Compose specification: what the base template
//! emits plus the keys users commonly put in an override file. Unknown keys are
//! ignored.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Root of a compose document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposeFile {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,

    /// Named networks; a `null` body means "defaults".
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, Option<NetworkDefinition>>,

    /// Named volumes; a `null` body means "defaults".
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, Option<VolumeDefinition>>,
}

/// One service of the stack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<CommandSpec>,

    #[serde(default, skip_serializing_if = "Environment::is_empty")]
    pub environment: Environment,

    #[serde(default, skip_serializing_if = "StringOrList::is_empty")]
    pub env_file: StringOrList,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortEntry>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,

    #[serde(default, skip_serializing_if = "NameList::is_empty")]
    pub networks: NameList,

    #[serde(default, skip_serializing_if = "NameList::is_empty")]
    pub depends_on: NameList,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// `command`/`entrypoint`: a shell-style string or an exec-form list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Exec(Vec<String>),
    Shell(String),
}

/// Environment as a key/value map or a list of `KEY=VALUE` strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Environment {
    Map(BTreeMap<String, serde_yaml::Value>),
    List(Vec<String>),
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Map(BTreeMap::new())
    }
}

impl Environment {
    pub fn is_empty(&self) -> bool {
        match self {
            Environment::Map(map) => map.is_empty(),
            Environment::List(list) => list.is_empty(),
        }
    }

    /// Flatten to key/value pairs. Later entries win. A key without a value
    /// takes the value from `lookup` (the caller's environment) or is dropped.
    pub fn to_map(&self, lookup: impl Fn(&str) -> Option<String>) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        match self {
            Environment::Map(map) => {
                for (key, value) in map {
                    let value = match value {
                        serde_yaml::Value::Null => lookup(key),
                        serde_yaml::Value::String(s) => Some(s.clone()),
                        serde_yaml::Value::Bool(b) => Some(b.to_string()),
                        serde_yaml::Value::Number(n) => Some(n.to_string()),
                        other => serde_yaml::to_string(other)
                            .ok()
                            .map(|s| s.trim_end().to_string()),
                    };
                    if let Some(value) = value {
                        out.insert(key.clone(), value);
                    }
                }
            }
            Environment::List(list) => {
                for entry in list {
                    match entry.split_once('=') {
                        Some((key, value)) => {
                            out.insert(key.to_string(), value.to_string());
                        }
                        None => {
                            if let Some(value) = lookup(entry) {
                                out.insert(entry.clone(), value);
                            }
                        }
                    }
                }
            }
        }
        out
    }
}

/// A value that may be a single string or a list of strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl Default for StringOrList {
    fn default() -> Self {
        StringOrList::Many(Vec::new())
    }
}

impl StringOrList {
    pub fn is_empty(&self) -> bool {
        match self {
            StringOrList::One(_) => false,
            StringOrList::Many(list) => list.is_empty(),
        }
    }

    pub fn items(&self) -> Vec<&str> {
        match self {
            StringOrList::One(s) => vec![s.as_str()],
            StringOrList::Many(list) => list.iter().map(String::as_str).collect(),
        }
    }
}

/// Service names given as a list or as a map whose values carry options
/// (e.g. `depends_on: {postgres: {condition: service_started}}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NameList {
    List(Vec<String>),
    Map(BTreeMap<String, serde_yaml::Value>),
}

impl Default for NameList {
    fn default() -> Self {
        NameList::List(Vec::new())
    }
}

impl NameList {
    pub fn is_empty(&self) -> bool {
        match self {
            NameList::List(list) => list.is_empty(),
            NameList::Map(map) => map.is_empty(),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        match self {
            NameList::List(list) => list.iter().map(String::as_str).collect(),
            NameList::Map(map) => map.keys().map(String::as_str).collect(),
        }
    }
}

/// Port entries may be written as bare numbers (`- 5432`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortEntry {
    Number(u16),
    Text(String),
}

impl std::fmt::Display for PortEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortEntry::Number(n) => write!(f, "{}", n),
            PortEntry::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
}
