//! CA journal: per trust domain record of signing authorities and their
//! rotation state.
//!
//! Each authority moves `Prepared -> Active -> Old`. `Tainted` and `Revoked`
//! can be entered from any non-terminal state; a tainted authority stays
//! queryable until it is revoked, and a revoked authority accepts no further
//! transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::id::TrustDomain;
use crate::errors::{Result, TrustplaneError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityStatus {
    Prepared,
    Active,
    Old,
    Tainted,
    Revoked,
}

impl fmt::Display for AuthorityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthorityStatus::Prepared => "prepared",
            AuthorityStatus::Active => "active",
            AuthorityStatus::Old => "old",
            AuthorityStatus::Tainted => "tainted",
            AuthorityStatus::Revoked => "revoked",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityKind {
    X509,
    Jwt,
}

impl fmt::Display for AuthorityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthorityKind::X509 => write!(f, "x509"),
            AuthorityKind::Jwt => write!(f, "jwt"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityEntry {
    /// Subject key ID for X.509 authorities, key ID for JWT authorities
    pub authority_id: String,
    pub public_key: Vec<u8>,
    pub status: AuthorityStatus,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub upstream_authority_id: Option<String>,
}

impl AuthorityEntry {
    pub fn prepared(
        authority_id: impl Into<String>,
        public_key: Vec<u8>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            authority_id: authority_id.into(),
            public_key,
            status: AuthorityStatus::Prepared,
            issued_at,
            expires_at,
            upstream_authority_id: None,
        }
    }

    fn transition(&mut self, to: AuthorityStatus) -> Result<()> {
        use AuthorityStatus::*;
        let allowed = matches!(
            (self.status, to),
            (Prepared, Active)
                | (Active, Old)
                | (Prepared | Active | Old, Tainted)
                | (Prepared | Active | Old | Tainted, Revoked)
        );
        if !allowed {
            return Err(TrustplaneError::invalid_argument(format!(
                "authority '{}' cannot move from {} to {}",
                self.authority_id, self.status, to
            )));
        }
        self.status = to;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaJournal {
    /// Assigned by the store on first write
    #[serde(default)]
    pub id: Option<u64>,
    pub trust_domain: TrustDomain,
    /// Lookup key of the journal; the X.509 authority most recently activated
    #[serde(default)]
    pub active_x509_authority_id: String,
    #[serde(default)]
    pub x509_authorities: Vec<AuthorityEntry>,
    #[serde(default)]
    pub jwt_authorities: Vec<AuthorityEntry>,
}

impl CaJournal {
    pub fn new(trust_domain: TrustDomain) -> Self {
        Self {
            id: None,
            trust_domain,
            active_x509_authority_id: String::new(),
            x509_authorities: Vec::new(),
            jwt_authorities: Vec::new(),
        }
    }

    pub fn authorities(&self, kind: AuthorityKind) -> &[AuthorityEntry] {
        match kind {
            AuthorityKind::X509 => &self.x509_authorities,
            AuthorityKind::Jwt => &self.jwt_authorities,
        }
    }

    fn authorities_mut(&mut self, kind: AuthorityKind) -> &mut Vec<AuthorityEntry> {
        match kind {
            AuthorityKind::X509 => &mut self.x509_authorities,
            AuthorityKind::Jwt => &mut self.jwt_authorities,
        }
    }

    pub fn find(&self, kind: AuthorityKind, authority_id: &str) -> Option<&AuthorityEntry> {
        self.authorities(kind).iter().find(|a| a.authority_id == authority_id)
    }

    fn find_mut(&mut self, kind: AuthorityKind, authority_id: &str) -> Result<&mut AuthorityEntry> {
        let trust_domain = &self.trust_domain;
        let authorities = match kind {
            AuthorityKind::X509 => &mut self.x509_authorities,
            AuthorityKind::Jwt => &mut self.jwt_authorities,
        };
        authorities
            .iter_mut()
            .find(|a| a.authority_id == authority_id)
            .ok_or_else(|| {
                TrustplaneError::invalid_argument(format!(
                    "no {} authority '{}' in journal for '{}'",
                    kind, authority_id, trust_domain
                ))
            })
    }

    /// Record a freshly prepared authority
    pub fn add_prepared(&mut self, kind: AuthorityKind, entry: AuthorityEntry) -> Result<()> {
        if self.find(kind, &entry.authority_id).is_some() {
            return Err(TrustplaneError::already_exists(
                format!("{}_authority", kind),
                entry.authority_id,
            ));
        }
        let entry = AuthorityEntry { status: AuthorityStatus::Prepared, ..entry };
        self.authorities_mut(kind).push(entry);
        Ok(())
    }

    /// Activate a prepared authority, retiring the previously active one
    pub fn activate(&mut self, kind: AuthorityKind, authority_id: &str) -> Result<()> {
        self.find_mut(kind, authority_id)?.transition(AuthorityStatus::Active)?;
        for other in self.authorities_mut(kind).iter_mut() {
            if other.authority_id != authority_id && other.status == AuthorityStatus::Active {
                other.status = AuthorityStatus::Old;
            }
        }
        if kind == AuthorityKind::X509 {
            self.active_x509_authority_id = authority_id.to_string();
        }
        Ok(())
    }

    pub fn taint(&mut self, kind: AuthorityKind, authority_id: &str) -> Result<()> {
        self.find_mut(kind, authority_id)?.transition(AuthorityStatus::Tainted)
    }

    pub fn revoke(&mut self, kind: AuthorityKind, authority_id: &str) -> Result<()> {
        self.find_mut(kind, authority_id)?.transition(AuthorityStatus::Revoked)
    }

    /// The authority of `kind` currently in the `Active` state
    pub fn active(&self, kind: AuthorityKind) -> Option<&AuthorityEntry> {
        self.authorities(kind).iter().find(|a| a.status == AuthorityStatus::Active)
    }

    /// Authorities that still validate credentials (everything but revoked)
    pub fn trusted_authorities(&self, kind: AuthorityKind) -> Vec<&AuthorityEntry> {
        self.authorities(kind).iter().filter(|a| a.status != AuthorityStatus::Revoked).collect()
    }

    /// True when every authority of both kinds expired before `threshold`
    pub fn all_expired_before(&self, threshold: DateTime<Utc>) -> bool {
        self.x509_authorities
            .iter()
            .chain(self.jwt_authorities.iter())
            .all(|a| a.expires_at < threshold)
    }

    /// Check journal-wide invariants
    pub fn validate(&self) -> Result<()> {
        for kind in [AuthorityKind::X509, AuthorityKind::Jwt] {
            let active = self
                .authorities(kind)
                .iter()
                .filter(|a| a.status == AuthorityStatus::Active)
                .count();
            if active > 1 {
                return Err(TrustplaneError::invalid_argument(format!(
                    "journal for '{}' has {} active {} authorities",
                    self.trust_domain, active, kind
                )));
            }
            let mut ids: Vec<&str> =
                self.authorities(kind).iter().map(|a| a.authority_id.as_str()).collect();
            ids.sort_unstable();
            if ids.windows(2).any(|w| w[0] == w[1]) {
                return Err(TrustplaneError::invalid_argument(format!(
                    "journal for '{}' has duplicate {} authority IDs",
                    self.trust_domain, kind
                )));
            }
        }
        Ok(())
    }
}
