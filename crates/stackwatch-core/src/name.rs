//! Stack names.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Longest accepted stack name, in bytes.
pub const MAX_NAME_LEN: usize = 128;

/// Name of a stack. Doubles as the pending-store key and as the project
/// directory name, so it is restricted to a single safe path segment:
/// ASCII alphanumerics plus `.`, `_` and `-`, starting with an alphanumeric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(try_from = "String", into = "String")]
#[display("{_0}")]
pub struct StackName(String);

impl StackName {
    /// Validate and wrap a stack name.
    pub fn new(name: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        validate(&name).map_err(|reason| Error::InvalidName {
            name: name.clone(),
            reason,
        })?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate(name: &str) -> Result<(), &'static str> {
    let Some(first) = name.chars().next() else {
        return Err("must not be empty");
    };
    if name.len() > MAX_NAME_LEN {
        return Err("too long");
    }
    if !first.is_ascii_alphanumeric() {
        return Err("must start with an ASCII letter or digit");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err("may only contain ASCII letters, digits, '.', '_' and '-'");
    }
    Ok(())
}

impl TryFrom<String> for StackName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<StackName> for String {
    fn from(name: StackName) -> Self {
        name.0
    }
}

impl std::str::FromStr for StackName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for StackName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<std::path::Path> for StackName {
    fn as_ref(&self) -> &std::path::Path {
        std::path::Path::new(&self.0)
    }
}
