//! Trust store services
//!
//! Components built on top of the [`DataStore`](crate::storage::DataStore)
//! contract rather than inside a backend.

pub mod authorized_entries;
pub mod maintenance;

pub use authorized_entries::AuthorizedEntryResolver;
pub use maintenance::{MaintenanceService, PruneReport};
