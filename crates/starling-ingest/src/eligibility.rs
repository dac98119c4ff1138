//! Storage-eligibility strategies.
//!
//! Which events may enter durable storage is deployment policy, not
//! protocol: some operators store anything their policy approves, others
//! only what local or followed identities author. The pipeline consults a
//! strategy object and never hardcodes either rule.

use async_trait::async_trait;
use starling_common::Event;
use starling_common::event::KIND_FOLLOWS;
use starling_common::filter::Filter;
use starling_store::policy::PolicyVerdict;
use starling_store::{QueryOptions, Storage, StorageError};
use std::collections::HashSet;

/// Outcome of an eligibility check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    /// Client-safe reason, surfaced as `blocked: <reason>`.
    Ineligible(String),
}

#[async_trait]
pub trait EligibilityPolicy: Send + Sync {
    async fn check(
        &self,
        event: &Event,
        verdict: &PolicyVerdict,
        storage: &dyn Storage,
    ) -> Result<Eligibility, StorageError>;
}

/// Anything the policy approved may be stored.
#[derive(Debug, Default)]
pub struct PolicyGate;

#[async_trait]
impl EligibilityPolicy for PolicyGate {
    async fn check(
        &self,
        _event: &Event,
        verdict: &PolicyVerdict,
        _storage: &dyn Storage,
    ) -> Result<Eligibility, StorageError> {
        if verdict.allowed {
            Ok(Eligibility::Eligible)
        } else {
            Ok(Eligibility::Ineligible(
                "rejected by relay policy".to_string(),
            ))
        }
    }
}

/// Only admins and identities an admin follows may post into storage.
pub struct KnownAuthors {
    admins: HashSet<String>,
}

impl KnownAuthors {
    pub fn new(admins: impl IntoIterator<Item = String>) -> Self {
        Self {
            admins: admins.into_iter().collect(),
        }
    }
}

#[async_trait]
impl EligibilityPolicy for KnownAuthors {
    async fn check(
        &self,
        event: &Event,
        _verdict: &PolicyVerdict,
        storage: &dyn Storage,
    ) -> Result<Eligibility, StorageError> {
        if self.admins.contains(&event.pubkey) {
            return Ok(Eligibility::Eligible);
        }

        // Followed by any admin: an admin's follow list carries the author
        // as a p tag.
        let follows = storage
            .query(
                &[Filter::new()
                    .kinds([KIND_FOLLOWS])
                    .authors(self.admins.iter().cloned())],
                QueryOptions::default(),
            )
            .await?;

        let followed = follows
            .iter()
            .any(|list| list.tag_values("p").any(|p| p == event.pubkey));

        if followed {
            Ok(Eligibility::Eligible)
        } else {
            Ok(Eligibility::Ineligible(
                "only registered users can post".to_string(),
            ))
        }
    }
}
