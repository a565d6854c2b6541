//! Pluggable lexicon record validation.
//!
//! The core never knows what a `app.bsky.feed.post` is shaped like; it only needs an
//! answer to "is this record acceptable for this collection". Callers wire in whatever
//! schema engine they have (a generated lexicon validator, a JSON-schema check, or just
//! [`NoopValidator`] for tests) and [`crate::manager::RepoManager`] calls it once per
//! write before the record is committed.

use crate::error::RepoError;
use crate::types::RepoRecord;
use async_trait::async_trait;

#[async_trait]
pub trait RecordValidator: Send + Sync {
    /// Validates a record destined for `collection`. Returning `Err` aborts the whole
    /// batch the record was part of with [`RepoError::ValidationError`].
    async fn validate(&self, collection: &str, record: &RepoRecord) -> Result<(), RepoError>;
}

/// Accepts every record. Useful for tests and for embedders that validate upstream of
/// this crate (e.g. at the RPC layer) and don't need it done again here.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopValidator;

#[async_trait]
impl RecordValidator for NoopValidator {
    async fn validate(&self, _collection: &str, _record: &RepoRecord) -> Result<(), RepoError> {
        Ok(())
    }
}
