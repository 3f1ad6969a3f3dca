//! Selectors and selector-set matching.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{Result, TrustplaneError};

/// A `(type, value)` attribute produced by attestation, e.g. `unix:uid:1000`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Selector {
    #[serde(rename = "type")]
    pub selector_type: String,
    pub value: String,
}

impl Selector {
    pub fn new<T: Into<String>, V: Into<String>>(selector_type: T, value: V) -> Self {
        Self { selector_type: selector_type.into(), value: value.into() }
    }

    /// Parse the `type:value` form. The value may itself contain ':'.
    pub fn parse(s: &str) -> Result<Self> {
        let (selector_type, value) = s.split_once(':').ok_or_else(|| {
            TrustplaneError::invalid_field(
                format!("selector '{}' must be in type:value form", s),
                "selectors",
            )
        })?;
        let selector = Self::new(selector_type, value);
        selector.validate()?;
        Ok(selector)
    }

    pub fn validate(&self) -> Result<()> {
        if self.selector_type.is_empty() {
            return Err(TrustplaneError::invalid_field("selector type is empty", "selectors"));
        }
        if self.selector_type.contains(':') {
            return Err(TrustplaneError::invalid_field(
                format!("selector type '{}' must not contain ':'", self.selector_type),
                "selectors",
            ));
        }
        if self.value.is_empty() {
            return Err(TrustplaneError::invalid_field(
                format!("selector value for type '{}' is empty", self.selector_type),
                "selectors",
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.selector_type, self.value)
    }
}

/// Sort and de-duplicate a selector list so it can be compared as a set
pub fn normalize(mut selectors: Vec<Selector>) -> Vec<Selector> {
    selectors.sort();
    selectors.dedup();
    selectors
}

/// True when every selector in `subset` appears in `superset`
pub fn is_subset(subset: &[Selector], superset: &[Selector]) -> bool {
    subset.iter().all(|s| superset.contains(s))
}

/// How a selector filter is compared against a record's selector set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchBehavior {
    /// Record selectors equal the filter selectors
    #[default]
    Exact,
    /// Record selectors are a subset of the filter selectors
    Subset,
    /// Record selectors are a superset of the filter selectors
    Superset,
    /// Record shares at least one selector with the filter
    MatchAny,
}

impl MatchBehavior {
    /// Evaluate the filter against a record's selectors
    pub fn matches(&self, record: &[Selector], filter: &[Selector]) -> bool {
        match self {
            MatchBehavior::Exact => is_subset(record, filter) && is_subset(filter, record),
            MatchBehavior::Subset => is_subset(record, filter),
            MatchBehavior::Superset => is_subset(filter, record),
            MatchBehavior::MatchAny => record.iter().any(|s| filter.contains(s)),
        }
    }
}
