//! Identifier types for the trust store.
//!
//! Trust domain names, SPIFFE IDs and registration entry IDs are NewType
//! wrappers so they cannot be mixed up at compile time. Parsing validates the
//! input; the `*_unchecked` constructors exist for records read back from
//! storage.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::{Result, TrustplaneError};

const SPIFFE_SCHEME: &str = "spiffe://";
const MAX_TRUST_DOMAIN_LEN: usize = 255;
const MAX_ENTRY_ID_LEN: usize = 255;

static TRUST_DOMAIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9._-]+$").expect("static regex is valid"));
static PATH_SEGMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("static regex is valid"));
static ENTRY_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("static regex is valid"));

/// Name of a trust domain, e.g. `example.org`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TrustDomain(String);

impl TrustDomain {
    /// Validate and wrap a trust domain name
    pub fn new<S: Into<String>>(name: S) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_TRUST_DOMAIN_LEN {
            return Err(TrustplaneError::invalid_field(
                format!("trust domain name must be 1-{} characters", MAX_TRUST_DOMAIN_LEN),
                "trust_domain",
            ));
        }
        if !TRUST_DOMAIN_RE.is_match(&name) {
            return Err(TrustplaneError::invalid_field(
                format!("trust domain '{}' contains characters outside [a-z0-9._-]", name),
                "trust_domain",
            ));
        }
        Ok(Self(name))
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The SPIFFE ID of the trust domain itself (`spiffe://<name>`)
    pub fn id(&self) -> SpiffeId {
        SpiffeId { trust_domain: self.clone(), path: String::new() }
    }

    /// The SPIFFE ID of the server for this trust domain
    pub fn server_id(&self) -> SpiffeId {
        SpiffeId { trust_domain: self.clone(), path: "/spire/server".to_string() }
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TrustDomain {
    type Err = TrustplaneError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for TrustDomain {
    type Error = TrustplaneError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<TrustDomain> for String {
    fn from(td: TrustDomain) -> Self {
        td.0
    }
}

/// A SPIFFE ID: `spiffe://<trust-domain><path>`
///
/// The path is either empty (the trust domain itself) or a sequence of
/// `/segment` components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SpiffeId {
    trust_domain: TrustDomain,
    path: String,
}

impl SpiffeId {
    /// Parse a SPIFFE ID from its URI form
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri.strip_prefix(SPIFFE_SCHEME).ok_or_else(|| {
            TrustplaneError::invalid_argument(format!(
                "'{}' is not a SPIFFE ID: scheme must be spiffe",
                uri
            ))
        })?;

        if rest.contains('?') || rest.contains('#') {
            return Err(TrustplaneError::invalid_argument(format!(
                "'{}' is not a SPIFFE ID: query and fragment are not allowed",
                uri
            )));
        }

        let (td, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        let trust_domain = TrustDomain::new(td)?;
        validate_path(path)?;

        Ok(Self { trust_domain, path: path.to_string() })
    }

    /// Build a SPIFFE ID from a trust domain and path segments
    pub fn from_segments(trust_domain: &TrustDomain, segments: &[&str]) -> Result<Self> {
        let path: String = segments.iter().map(|s| format!("/{}", s)).collect();
        validate_path(&path)?;
        Ok(Self { trust_domain: trust_domain.clone(), path })
    }

    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// True when the ID names the trust domain itself
    pub fn is_trust_domain_id(&self) -> bool {
        self.path.is_empty()
    }

    pub fn is_member_of(&self, trust_domain: &TrustDomain) -> bool {
        &self.trust_domain == trust_domain
    }
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Ok(());
    }
    // leading '/' yields one empty first segment
    for segment in path.split('/').skip(1) {
        if segment.is_empty() {
            return Err(TrustplaneError::invalid_argument(format!(
                "path '{}' contains an empty segment",
                path
            )));
        }
        if segment == "." || segment == ".." {
            return Err(TrustplaneError::invalid_argument(format!(
                "path '{}' contains a dot segment",
                path
            )));
        }
        if !PATH_SEGMENT_RE.is_match(segment) {
            return Err(TrustplaneError::invalid_argument(format!(
                "path segment '{}' contains characters outside [A-Za-z0-9._-]",
                segment
            )));
        }
    }
    Ok(())
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", SPIFFE_SCHEME, self.trust_domain, self.path)
    }
}

impl FromStr for SpiffeId {
    type Err = TrustplaneError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SpiffeId {
    type Error = TrustplaneError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SpiffeId> for String {
    fn from(id: SpiffeId) -> Self {
        id.to_string()
    }
}

/// Registration entry identifier.
///
/// Generated as a UUID unless the caller supplies a custom ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    /// Create a new ID from a UUID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create an ID from an existing string (for storage retrieval)
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    /// Parse and validate a caller-supplied ID
    pub fn parse(s: &str) -> Result<Self> {
        let id = Self(s.to_string());
        id.validate()?;
        Ok(id)
    }

    /// Check the ID is 1-255 characters of `[A-Za-z0-9._-]`
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() || self.0.len() > MAX_ENTRY_ID_LEN {
            return Err(TrustplaneError::invalid_field(
                format!("entry ID must be 1-{} characters", MAX_ENTRY_ID_LEN),
                "id",
            ));
        }
        if !ENTRY_ID_RE.is_match(&self.0) {
            return Err(TrustplaneError::invalid_field(
                format!("entry ID '{}' contains characters outside [A-Za-z0-9._-]", self.0),
                "id",
            ));
        }
        Ok(())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to inner string value
    pub fn into_string(self) -> String {
        self.0
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntryId {
    type Err = TrustplaneError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl AsRef<str> for EntryId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
