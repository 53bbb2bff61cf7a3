//! Human-chosen identifiers and the scopes they are unique within.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

const MAX_IDENTIFIER_LEN: usize = 100;

/// A user-chosen name for a cluster or scheduled job.
///
/// Matches `^[\w-]{1,100}$`: letters, digits, underscore and hyphen. The
/// identifier is also the cluster name shown in the control-plane console.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        let len = raw.chars().count();
        let valid_chars = raw
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-');
        if len == 0 || len > MAX_IDENTIFIER_LEN || !valid_chars {
            return Err(ModelError::InvalidIdentifier(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a typed confirmation matches this identifier exactly.
    pub fn confirms(&self, confirmation: &str) -> bool {
        self.0 == confirmation
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identifier {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identifier {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.0
    }
}

/// Namespace an identifier is unique within.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Clusters,
    Jobs,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Clusters => "clusters",
            Scope::Jobs => "jobs",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clusters" => Ok(Scope::Clusters),
            "jobs" => Ok(Scope::Jobs),
            other => Err(ModelError::UnknownVariant {
                kind: "scope",
                value: other.to_string(),
            }),
        }
    }
}
