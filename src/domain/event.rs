//! Change-log rows for attested nodes and registration entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::id::{EntryId, SpiffeId};

/// Kind of mutation an event records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOp {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for EventOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventOp::Created => write!(f, "created"),
            EventOp::Updated => write!(f, "updated"),
            EventOp::Deleted => write!(f, "deleted"),
        }
    }
}

/// Common view over event rows of any kind
pub trait StoreEvent: Clone + Send + Sync + 'static {
    fn event_id(&self) -> u64;
    fn created_at(&self) -> DateTime<Utc>;
    fn op(&self) -> EventOp;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestedNodeEvent {
    pub event_id: u64,
    pub spiffe_id: SpiffeId,
    pub op: EventOp,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationEntryEvent {
    pub event_id: u64,
    pub entry_id: EntryId,
    pub op: EventOp,
    pub created_at: DateTime<Utc>,
}

impl StoreEvent for AttestedNodeEvent {
    fn event_id(&self) -> u64 {
        self.event_id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn op(&self) -> EventOp {
        self.op
    }
}

impl StoreEvent for RegistrationEntryEvent {
    fn event_id(&self) -> u64 {
        self.event_id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn op(&self) -> EventOp {
        self.op
    }
}
