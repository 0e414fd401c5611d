use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{DroverError, Result};

/// Joins the clauses of one requirement expression.
pub const AND_SEPARATOR: &str = "&&";
/// Separates a clause key from its expected value.
pub const EQ_SEPARATOR: &str = "==";

/// A single `key==value` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub key: String,
    pub value: String,
}

impl Clause {
    fn parse(raw: &str) -> Result<Self> {
        let (key, value) = raw
            .split_once(EQ_SEPARATOR)
            .ok_or_else(|| DroverError::InvalidRequirement(raw.to_string()))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(DroverError::InvalidRequirement(raw.to_string()));
        }
        Ok(Self {
            key: key.to_string(),
            value: value.trim().to_string(),
        })
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.key, EQ_SEPARATOR, self.value)
    }
}

/// A task's resource requirements.
///
/// The map is kept verbatim for snapshots; every value is parsed as a conjunction
/// of clauses, e.g. `{"resources": "cpu==4 && memory==8g"}`. The map keys only
/// group expressions and play no part in matching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requirements {
    raw: BTreeMap<String, String>,
    clauses: Vec<Clause>,
}

impl Requirements {
    pub fn parse(raw: BTreeMap<String, String>) -> Result<Self> {
        let mut clauses = Vec::new();
        for expression in raw.values() {
            for segment in expression.split(AND_SEPARATOR) {
                if segment.trim().is_empty() {
                    continue;
                }
                clauses.push(Clause::parse(segment)?);
            }
        }
        Ok(Self { raw, clauses })
    }

    pub fn raw(&self) -> &BTreeMap<String, String> {
        &self.raw
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}

/// What a worker declares about itself, and which clause keys it understands.
///
/// A clause whose key is outside `domain` is ignored, so a container worker
/// is not rejected because a task also carries cluster-only clauses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    domain: BTreeSet<String>,
    values: BTreeMap<String, String>,
}

impl Capabilities {
    pub fn new<I, S>(domain: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domain: domain.into_iter().map(Into::into).collect(),
            values: BTreeMap::new(),
        }
    }

    /// Declare a value. The key joins the domain.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.domain.insert(key.clone());
        self.values.insert(key, value.into());
        self
    }

    pub fn with_tags(self, tags: &BTreeMap<String, String>) -> Self {
        tags.iter().fold(self, |caps, (k, v)| caps.with(k, v))
    }

    pub fn recognizes(&self, key: &str) -> bool {
        self.domain.contains(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn satisfies(&self, requirements: &Requirements) -> bool {
        requirements
            .clauses()
            .iter()
            .filter(|clause| self.recognizes(&clause.key))
            .all(|clause| self.get(&clause.key) == Some(clause.value.as_str()))
    }
}
