use chrono::{DateTime, Utc};

use crate::domain::JoinToken;
use crate::errors::{Result, TrustplaneError};
use crate::storage::validation::validate_record;

use super::State;

const RESOURCE: &str = "join_token";

impl State {
    pub(super) fn create_join_token(&mut self, token: JoinToken) -> Result<JoinToken> {
        validate_record(&token)?;
        if self.join_tokens.contains_key(&token.token) {
            // the token value is a secret; keep it out of the error
            return Err(TrustplaneError::already_exists(RESOURCE, "<redacted>"));
        }
        self.join_tokens.insert(token.token.clone(), token.clone());
        Ok(token)
    }

    pub(super) fn fetch_join_token(&self, token: &str) -> Option<JoinToken> {
        self.join_tokens.get(token).cloned()
    }

    pub(super) fn delete_join_token(&mut self, token: &str) -> Result<()> {
        self.join_tokens
            .remove(token)
            .map(|_| ())
            .ok_or_else(|| TrustplaneError::not_found(RESOURCE, "<redacted>"))
    }

    pub(super) fn prune_join_tokens(&mut self, expires_before: DateTime<Utc>) -> usize {
        let before = self.join_tokens.len();
        self.join_tokens.retain(|_, t| t.expires_at >= expires_before);
        before - self.join_tokens.len()
    }
}
