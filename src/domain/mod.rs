//! Domain layer
//!
//! Pure records of the trust store with no storage dependencies. Each type
//! carries its own parsing and state-transition rules.
//!
//! ## Module Organization
//!
//! - `id`: trust domains, SPIFFE IDs and entry IDs
//! - `selector`: selectors and selector-set matching
//! - `bundle`: trust bundles and bundle masks
//! - `node`: attested nodes
//! - `entry`: registration entries and their uniqueness key
//! - `event`: node and entry change events
//! - `journal`: CA journals and the authority state machine
//! - `federation`: federation relationships
//! - `join_token`: one-time attestation tokens

pub mod bundle;
pub mod entry;
pub mod event;
pub mod federation;
pub mod id;
pub mod join_token;
pub mod journal;
pub mod node;
pub mod selector;
pub mod validation;

pub use bundle::{Bundle, BundleMask, DeleteMode, PublicKey, RootCa};
pub use entry::{EntryKey, RegistrationEntry, RegistrationEntryMask};
pub use event::{AttestedNodeEvent, EventOp, RegistrationEntryEvent, StoreEvent};
pub use federation::{BundleEndpointProfile, FederationRelationship, FederationRelationshipMask};
pub use id::{EntryId, SpiffeId, TrustDomain};
pub use join_token::JoinToken;
pub use journal::{AuthorityEntry, AuthorityKind, AuthorityStatus, CaJournal};
pub use node::{AttestedNode, AttestedNodeMask};
pub use selector::{MatchBehavior, Selector};
