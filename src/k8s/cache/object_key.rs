use crate::error::{Error, Result};
use kube::ResourceExt;
use std::fmt;
use std::str::FromStr;

/// `namespace/name` identity of a watched object
///
/// A bare `name` parses with an empty namespace; callers decide which
/// namespace that stands for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse `namespace/name` or a bare `name`
    ///
    /// # Errors
    ///
    /// Returns a parse error on an empty name or more than one separator.
    pub fn parse(key: &str) -> Result<Self> {
        let mut parts = key.split('/');
        let (namespace, name) = match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => ("", name),
            (Some(namespace), Some(name), None) => (namespace, name),
            _ => return Err(Error::parse(format!("unexpected key format: '{key}'"))),
        };
        if name.is_empty() {
            return Err(Error::parse(format!("missing object name in key '{key}'")));
        }
        Ok(Self::new(namespace, name))
    }

    /// Qualify a bare reference with `namespace`; qualified references are kept as is
    ///
    /// # Errors
    ///
    /// Returns a parse error if `reference` is malformed.
    pub fn qualified(namespace: &str, reference: &str) -> Result<Self> {
        let mut key = Self::parse(reference)?;
        if key.namespace.is_empty() {
            key.namespace = namespace.to_string();
        }
        Ok(key)
    }

    pub fn from_resource<K: ResourceExt>(obj: &K) -> Self {
        Self::new(obj.namespace().unwrap_or_default(), obj.name_any())
    }

    /// File-name friendly form, `namespace_name`
    #[must_use]
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.namespace, self.name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
