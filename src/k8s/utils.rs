use crate::error::{Error, Result};
use std::collections::BTreeMap;

pub(crate) fn format_label_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<String>>()
        .join(",")
}

// return true if all of selector pairs can be found in labels
pub(crate) fn select<K, V>(selector: &BTreeMap<K, V>, labels: &BTreeMap<K, V>) -> bool
where
    K: Ord + Eq,
    V: Eq,
{
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

/// Equality-only label selector, the conjunction of `key=value` terms
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    terms: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Build a selector from a label map such as a service's `spec.selector`
    ///
    /// # Errors
    ///
    /// Returns a parse error if a key is empty or a key/value carries a
    /// selector metacharacter.
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self> {
        for (key, value) in map {
            if key.is_empty() || !is_plain_term(key) || !is_plain_term(value) {
                return Err(Error::parse(format!(
                    "invalid label selector term '{key}={value}'"
                )));
            }
        }
        Ok(Self { terms: map.clone() })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// An empty selector matches every label set.
    #[must_use]
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        match labels {
            Some(labels) => select(&self.terms, labels),
            None => self.terms.is_empty(),
        }
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format_label_selector(&self.terms))
    }
}

fn is_plain_term(term: &str) -> bool {
    !term
        .chars()
        .any(|c| matches!(c, ',' | '=' | '!' | '(' | ')') || c.is_whitespace())
}
