//! Input validation performed before any mutation is attempted.
//!
//! Field rules live on the domain records as `#[validate(...)]` attributes.
//! A record that fails here never reaches the backend, so a rejected call
//! leaves both the entity tables and the event log untouched. Checks that
//! need other records (federated bundles, dependent entries) stay with the
//! backend.

use validator::Validate;

use crate::errors::{Result, TrustplaneError};

pub fn validate_record<T: Validate>(record: &T) -> Result<()> {
    record.validate().map_err(TrustplaneError::invalid_record)
}
