// ABOUTME: Validated manifest names used as keys throughout the engine state.
// ABOUTME: Names are DNS-label-like so they can double as span and log prefixes.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

const MAX_LEN: usize = 63;

#[derive(Debug, Error)]
pub enum ManifestNameError {
    #[error("manifest name cannot be empty")]
    Empty,

    #[error("manifest name exceeds maximum length of {MAX_LEN} characters")]
    TooLong,

    #[error("manifest name cannot start with a hyphen")]
    StartsWithHyphen,

    #[error("manifest name cannot end with a hyphen")]
    EndsWithHyphen,

    #[error("manifest name must be lowercase")]
    NotLowercase,

    #[error("invalid character in manifest name: '{0}'")]
    InvalidChar(char),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManifestName(String);

impl ManifestName {
    pub fn new(value: &str) -> Result<Self, ManifestNameError> {
        if value.is_empty() {
            return Err(ManifestNameError::Empty);
        }

        if value.len() > MAX_LEN {
            return Err(ManifestNameError::TooLong);
        }

        if value.starts_with('-') {
            return Err(ManifestNameError::StartsWithHyphen);
        }

        if value.ends_with('-') {
            return Err(ManifestNameError::EndsWithHyphen);
        }

        for c in value.chars() {
            if c.is_ascii_uppercase() {
                return Err(ManifestNameError::NotLowercase);
            }
            if !c.is_ascii_lowercase() && !c.is_ascii_digit() && !matches!(c, '-' | '_' | '.') {
                return Err(ManifestNameError::InvalidChar(c));
            }
        }

        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ManifestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for ManifestName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ManifestName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ManifestName::new(&s).map_err(serde::de::Error::custom)
    }
}
