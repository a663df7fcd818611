//! `name:tag` image reference parsing

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("image '{image}' not in expected format 'image:tag'")]
    InvalidFormat { image: String },
}

/// A validated `repository:tag` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    repository: String,
    tag: String,
}

impl ImageReference {
    /// Parse a reference of the form `name:tag`
    ///
    /// Exactly one colon is accepted. Inputs with a registry port or a digest
    /// (`host:5000/app:v1`, `app@sha256:...`) are rejected rather than guessed at.
    pub fn parse(raw: &str) -> Result<Self, ReferenceError> {
        let invalid = || ReferenceError::InvalidFormat {
            image: raw.to_string(),
        };

        let mut parts = raw.split(':');
        let (Some(repository), Some(tag), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        if repository.is_empty() || tag.is_empty() || raw.contains('@') {
            return Err(invalid());
        }

        Ok(Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl FromStr for ImageReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}
