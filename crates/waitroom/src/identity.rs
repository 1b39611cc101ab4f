//! Opaque client identity issued by the registration step.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Token identifying the waiting participant.
///
/// Immutable for the lifetime of one admission attempt. Construction never
/// fails; [`ClientIdentity::validate`] is checked before any request is built
/// because the value is embedded in request paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientIdentity(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidIdentity {
    #[error("client identity is empty")]
    Empty,
    #[error("client identity contains a path separator: {0:?}")]
    PathSeparator(String),
}

impl ClientIdentity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn validate(&self) -> Result<(), InvalidIdentity> {
        if self.0.trim().is_empty() {
            return Err(InvalidIdentity::Empty);
        }
        if self.0.contains('/') {
            return Err(InvalidIdentity::PathSeparator(self.0.clone()));
        }
        Ok(())
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientIdentity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ClientIdentity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_identity() {
        assert!(ClientIdentity::new("user_8f2c").validate().is_ok());
    }

    #[test]
    fn empty_identity_is_invalid() {
        assert_eq!(
            ClientIdentity::new("").validate(),
            Err(InvalidIdentity::Empty)
        );
        assert_eq!(
            ClientIdentity::new("   ").validate(),
            Err(InvalidIdentity::Empty)
        );
    }

    #[test]
    fn slash_is_invalid() {
        assert!(matches!(
            ClientIdentity::new("a/b").validate(),
            Err(InvalidIdentity::PathSeparator(_))
        ));
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = ClientIdentity::new("user_1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"user_1\"");
    }
}
