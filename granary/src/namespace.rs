//! Namespaces.
//!
//! Every request is scoped to exactly one namespace. A namespace owns
//! its index keyspace and signing keys, while chunks are shared across
//! namespaces (they are content-addressed and carry no tenant data).
//!
//! Namespace labels can be up to 50 characters long and can only
//! consist of ASCII alphanumeric characters (A-Za-z0-9), dashes ('-'),
//! underscores ('_'), and plus signs ('+'). They must start with an
//! alphanumeric character.

use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{de, Deserialize, Serialize};

use crate::error::{GranaryError, GranaryResult};

lazy_static! {
    static ref NAMESPACE_REGEX: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9-_+]{0,49}$").unwrap();
}

/// The label of a namespace.
#[derive(Serialize, Deserialize, Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Namespace(#[serde(deserialize_with = "Namespace::deserialize")] String);

impl Namespace {
    /// Creates a namespace label from a String.
    pub fn new(name: String) -> GranaryResult<Self> {
        validate_namespace(&name)?;
        Ok(Self(name))
    }

    /// Returns the string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deserializes a potentially-invalid namespace label.
    fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        use de::Error;
        String::deserialize(deserializer).and_then(|s| {
            validate_namespace(&s).map_err(|e| Error::custom(e.to_string()))?;
            Ok(s)
        })
    }
}

impl FromStr for Namespace {
    type Err = GranaryError;

    fn from_str(name: &str) -> GranaryResult<Self> {
        Self::new(name.to_owned())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_namespace(name: &str) -> GranaryResult<()> {
    if NAMESPACE_REGEX.is_match(name) {
        Ok(())
    } else {
        Err(GranaryError::InvalidNamespace {
            name: name.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! ns {
        ($n:expr) => {
            Namespace::new($n.to_string())
        };
    }

    #[test]
    fn test_valid_labels() {
        ns!("oss").unwrap();
        ns!("team-infra").unwrap();
        ns!("zhaofengli+shared").unwrap();
        ns!("0cool").unwrap();
    }

    #[test]
    fn test_invalid_labels() {
        ns!("").unwrap_err();
        ns!("-leading-dash").unwrap_err();
        ns!("_leading-underscore").unwrap_err();
        ns!("with/slash").unwrap_err();
        ns!("with space").unwrap_err();
        ns!("with.dot").unwrap_err();
        ns!("looooooooooooooooooooooooooooooooooooooooooooooooong").unwrap_err();
    }

    #[test]
    fn test_serde() {
        let ns: Namespace = serde_json::from_str("\"prod\"").unwrap();
        assert_eq!("prod", ns.as_str());

        let bad: Result<Namespace, _> = serde_json::from_str("\"../escape\"");
        assert!(bad.is_err());
    }
}
