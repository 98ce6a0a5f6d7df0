use std::sync::Arc;

use ahash::AHashSet;
use log::{debug, info, warn};

use crate::cleanup::CleanupRequest;
use crate::data_model::{AttemptState, DocId, DocRecord, DocumentLookupResult};
use crate::errors::{AttemptError, KvError};
use crate::forward_compat::{self, InteractionPoint};
use crate::repository::{AtrRepository, DocumentRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The attempt's documents were settled and its entry removed.
    Cleaned(AttemptState),
    /// The entry was already gone.
    AlreadyCleaned,
}

/// Drives an attempt to its conclusion from the outside.
///
/// Committed attempts have their staged changes made visible; anything
/// earlier is rolled back. Only documents still carrying the attempt's own
/// metadata are touched, so processing the same request twice is harmless.
pub struct Cleaner {
    docs: Arc<dyn DocumentRepository>,
    atrs: Arc<dyn AtrRepository>,
}

impl Cleaner {
    pub fn new(docs: Arc<dyn DocumentRepository>, atrs: Arc<dyn AtrRepository>) -> Self {
        Self { docs, atrs }
    }

    pub async fn process(&self, request: &CleanupRequest) -> Result<CleanupOutcome, AttemptError> {
        forward_compat::check(
            request.forward_compatibility.as_ref(),
            InteractionPoint::CleanupEntry,
        )
        .await?;

        let entry = match self
            .atrs
            .find_entry(&request.atr_ref, &request.attempt_id)
            .await
        {
            Ok(Some(entry)) => entry,
            Ok(None) | Err(KvError::DocumentNotFound) | Err(KvError::PathNotFound) => {
                debug!(
                    "Attempt {} has no entry in {}, nothing to clean",
                    request.attempt_id, request.atr_ref
                );
                return Ok(CleanupOutcome::AlreadyCleaned);
            }
            Err(e) => return Err(e.into()),
        };
        forward_compat::check(
            entry.forward_compatibility.as_ref(),
            InteractionPoint::CleanupEntry,
        )
        .await?;

        let state = entry.attempt_state()?;
        let inserted = merged(&entry.inserted, &request.inserted);
        let replaced = merged(&entry.replaced, &request.replaced);
        let removed = merged(&entry.removed, &request.removed);
        debug!(
            "Cleaning attempt {} in state {} ({} inserted, {} replaced, {} removed)",
            request.attempt_id,
            state,
            inserted.len(),
            replaced.len(),
            removed.len()
        );

        match state {
            AttemptState::Committed => {
                for record in inserted.iter().chain(&replaced) {
                    self.commit_doc(request, record).await?;
                }
                for record in &removed {
                    self.remove_doc(request, record).await?;
                }
            }
            // A pending entry lists no documents, so an attempt abandoned
            // before commit leaves its staged inserts behind. They stay
            // tombstones that readers skip once the entry is gone.
            AttemptState::Pending | AttemptState::Aborted => {
                for record in &inserted {
                    self.rollback_doc(request, record, true).await?;
                }
                for record in replaced.iter().chain(&removed) {
                    self.rollback_doc(request, record, false).await?;
                }
            }
            AttemptState::NothingWritten | AttemptState::Completed | AttemptState::RolledBack => {}
        }

        match self
            .atrs
            .remove_entry(&request.atr_ref, &request.attempt_id)
            .await
        {
            Ok(()) | Err(KvError::PathNotFound) | Err(KvError::DocumentNotFound) => {}
            Err(e) => return Err(e.into()),
        }
        info!(
            "Cleaned up attempt {} ({}) in {}",
            request.attempt_id, state, request.atr_ref
        );
        Ok(CleanupOutcome::Cleaned(state))
    }

    /// The document if it still carries this attempt's staged change.
    async fn owned_doc(
        &self,
        request: &CleanupRequest,
        id: &DocId,
    ) -> Result<Option<DocumentLookupResult>, AttemptError> {
        let Some(doc) = self.docs.lookup_document(id, true).await? else {
            debug!("{} is gone, skipping", id);
            return Ok(None);
        };
        let owner = doc.xattrs.as_ref().and_then(|x| x.attempt_id());
        if owner != Some(request.attempt_id.as_str()) {
            debug!(
                "{} is no longer staged by attempt {} (owner {:?}), skipping",
                id, request.attempt_id, owner
            );
            return Ok(None);
        }
        Ok(Some(doc))
    }

    async fn commit_doc(&self, request: &CleanupRequest, record: &DocRecord) -> Result<(), AttemptError> {
        let id = record.doc_id();
        let Some(doc) = self.owned_doc(request, &id).await? else {
            return Ok(());
        };
        let Some(content) = doc.xattrs.as_ref().and_then(|x| x.staged_content()) else {
            warn!("{} is staged without content, skipping", id);
            return Ok(());
        };
        self.docs
            .unstage_insert_or_replace(&id, doc.cas, content, doc.is_deleted, request.durability_level)
            .await?;
        debug!("Committed {} for attempt {}", id, request.attempt_id);
        Ok(())
    }

    async fn remove_doc(&self, request: &CleanupRequest, record: &DocRecord) -> Result<(), AttemptError> {
        let id = record.doc_id();
        let Some(doc) = self.owned_doc(request, &id).await? else {
            return Ok(());
        };
        self.docs
            .unstage_remove(&id, doc.cas, request.durability_level)
            .await?;
        debug!("Removed {} for attempt {}", id, request.attempt_id);
        Ok(())
    }

    async fn rollback_doc(
        &self,
        request: &CleanupRequest,
        record: &DocRecord,
        staged_insert: bool,
    ) -> Result<(), AttemptError> {
        let id = record.doc_id();
        let Some(doc) = self.owned_doc(request, &id).await? else {
            return Ok(());
        };
        self.docs
            .clear_transaction_metadata(&id, doc.cas, staged_insert || doc.is_deleted)
            .await?;
        debug!("Rolled back {} for attempt {}", id, request.attempt_id);
        Ok(())
    }
}

/// Document lists of the entry, plus any the request knows of that the entry
/// does not (a pending entry lists nothing).
fn merged(from_entry: &[DocRecord], from_request: &[DocRecord]) -> Vec<DocRecord> {
    let mut seen = AHashSet::new();
    from_entry
        .iter()
        .chain(from_request)
        .filter(|r| seen.insert((*r).clone()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str) -> DocRecord {
        DocRecord {
            bucket: "b".into(),
            scope: "_default".into(),
            collection: "_default".into(),
            key: key.into(),
        }
    }

    #[test]
    fn test_merged_keeps_order_and_drops_duplicates() {
        let merged = merged(&[record("a"), record("b")], &[record("b"), record("c")]);
        let keys: Vec<_> = merged.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }
}
