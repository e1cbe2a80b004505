/// Action types
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A single unit of provisioning work: run `image` with `cmd`/`args` until it exits.
///
/// Actions are produced by a transport and consumed once by the agent loop. They are never
/// mutated after creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    /// Name of the task the action belongs to (set by the polling transport)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task_name: String,

    /// Action identifier (workflow id for the polling transport)
    #[serde(default)]
    pub id: String,

    /// Human readable action name
    #[serde(default)]
    pub name: String,

    /// OCI image reference
    #[serde(default)]
    pub image: String,

    /// Executable launched in the container. Empty means the image default.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cmd: String,

    /// Arguments passed to `cmd`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment variables, order preserved, duplicate keys kept
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<Env>,

    /// Raw `src:dst[:opts]` volume strings
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    /// Linux namespaces to share with the host
    #[serde(default, skip_serializing_if = "Namespaces::is_empty")]
    pub namespaces: Namespaces,

    /// Number of attempts; 0 and 1 both mean a single attempt
    #[serde(default)]
    pub retries: i32,

    /// Deadline covering all attempts; 0 means no deadline
    #[serde(default)]
    pub timeout_seconds: i64,
}

impl Action {
    /// Number of sequential execution attempts this action is allowed.
    pub fn attempts(&self) -> u32 {
        self.retries.max(1) as u32
    }

    /// Deadline for the whole action, if any.
    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_seconds <= 0 {
            None
        } else {
            Some(Duration::from_secs(self.timeout_seconds as u64))
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (id: {}, image: {})", self.name, self.id, self.image)
    }
}

/// Environment variable key/value pair
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Env {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

impl Env {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Parse a `KEY=VALUE` string, splitting on the first `=`.
    ///
    /// A string without `=` yields an empty value.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('=') {
            Some((key, value)) => Self::new(key, value),
            None => Self::new(raw, ""),
        }
    }
}

/// Volume specification in the form `{SRC-VOLUME-NAME | SRC-HOST-DIR}:TGT-CONTAINER-DIR[:OPTIONS]`.
///
/// Examples: `/etc/data:/data:ro` (read-only bind mount), `shared_volume:/data` (named volume).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Volume(pub String);

impl Volume {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Volume {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Volume {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Linux namespaces the action container should join. `"host"` shares the host namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespaces {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pid: String,
}

impl Namespaces {
    pub fn is_empty(&self) -> bool {
        self.network.is_empty() && self.pid.is_empty()
    }

    pub fn host_pid(&self) -> bool {
        self.pid == "host"
    }

    pub fn host_network(&self) -> bool {
        self.network == "host"
    }
}
