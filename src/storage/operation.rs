//! Generic descriptor of a storage operation, used for metric labels and
//! tracing.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Bundle,
    AttestedNode,
    AttestedNodeEvent,
    NodeSelectors,
    RegistrationEntry,
    RegistrationEntryEvent,
    JoinToken,
    FederationRelationship,
    CaJournal,
    X509Authority,
    JwtAuthority,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Bundle => "bundle",
            EntityKind::AttestedNode => "attested_node",
            EntityKind::AttestedNodeEvent => "attested_node_event",
            EntityKind::NodeSelectors => "node_selectors",
            EntityKind::RegistrationEntry => "registration_entry",
            EntityKind::RegistrationEntryEvent => "registration_entry_event",
            EntityKind::JoinToken => "join_token",
            EntityKind::FederationRelationship => "federation_relationship",
            EntityKind::CaJournal => "ca_journal",
            EntityKind::X509Authority => "x509_authority",
            EntityKind::JwtAuthority => "jwt_authority",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Create,
    CreateOrReturn,
    Fetch,
    FetchMany,
    Update,
    Set,
    Append,
    Delete,
    List,
    Count,
    Prune,
    Taint,
    Revoke,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Create => "create",
            Verb::CreateOrReturn => "create_or_return",
            Verb::Fetch => "fetch",
            Verb::FetchMany => "fetch_many",
            Verb::Update => "update",
            Verb::Set => "set",
            Verb::Append => "append",
            Verb::Delete => "delete",
            Verb::List => "list",
            Verb::Count => "count",
            Verb::Prune => "prune",
            Verb::Taint => "taint",
            Verb::Revoke => "revoke",
        }
    }
}

/// An `(entity kind, verb)` pair, rendered as `kind.verb`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operation {
    pub kind: EntityKind,
    pub verb: Verb,
}

impl Operation {
    pub const fn new(kind: EntityKind, verb: Verb) -> Self {
        Self { kind, verb }
    }

    pub fn label(&self) -> String {
        format!("{}.{}", self.kind.as_str(), self.verb.as_str())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind.as_str(), self.verb.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_label() {
        let op = Operation::new(EntityKind::RegistrationEntry, Verb::CreateOrReturn);
        assert_eq!(op.label(), "registration_entry.create_or_return");
        assert_eq!(op.to_string(), op.label());
    }
}
