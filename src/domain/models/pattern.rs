//! Name patterns used for handler routing and fallback lookup.
//!
//! A pattern is either an exact name (`tool:search`, `agent.start`) or a
//! prefix ending in `*` (`agent:*`, `agent.*`). A lone `*` matches anything.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum NamePattern {
    Exact(String),
    Prefix(String),
}

impl NamePattern {
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => Self::Prefix(prefix.to_string()),
            None => Self::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == name,
            Self::Prefix(prefix) => name.starts_with(prefix.as_str()),
        }
    }

    /// Ranking used when several patterns match: exact beats any prefix,
    /// longer prefixes beat shorter ones.
    pub fn specificity(&self) -> usize {
        match self {
            Self::Exact(_) => usize::MAX,
            Self::Prefix(prefix) => prefix.len(),
        }
    }
}

impl From<&str> for NamePattern {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<String> for NamePattern {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<NamePattern> for String {
    fn from(value: NamePattern) -> Self {
        value.to_string()
    }
}

impl std::fmt::Display for NamePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact(exact) => f.write_str(exact),
            Self::Prefix(prefix) => write!(f, "{prefix}*"),
        }
    }
}

/// Pick the most specific pattern matching `name`.
pub fn best_match<'a, T>(
    entries: impl IntoIterator<Item = &'a (NamePattern, T)>,
    name: &str,
) -> Option<&'a T>
where
    T: 'a,
{
    entries
        .into_iter()
        .filter(|(pattern, _)| pattern.matches(name))
        .max_by_key(|(pattern, _)| pattern.specificity())
        .map(|(_, value)| value)
}
