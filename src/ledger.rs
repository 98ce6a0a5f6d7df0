//! The per-attempt record of staged document changes.

use ahash::AHashMap as HashMap;
use serde_json::Value;

use crate::data_model::{DocId, DocRecord, TransactionGetResult};
use crate::errors::AttemptError;
use crate::repository::MutationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StagedMutationKind {
    Insert,
    Replace,
    Remove,
}

/// One pending document change.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedMutation {
    /// The document as it looked after staging; its CAS guards unstaging.
    pub doc: TransactionGetResult,
    /// Staged content for inserts and replaces.
    pub content: Option<Value>,
    pub kind: StagedMutationKind,
    pub mutation_token: Option<MutationToken>,
}

impl StagedMutation {
    pub fn id(&self) -> &DocId {
        self.doc.id()
    }

    pub fn cas(&self) -> u64 {
        self.doc.cas()
    }

    pub fn as_doc_record(&self) -> DocRecord {
        DocRecord::from(self.id())
    }
}

/// Ordered set of staged mutations, at most one per document identity.
///
/// Restaging a document replaces its entry in place, so commit and rollback
/// visit documents in first-staged order.
#[derive(Debug, Default)]
pub struct StagedMutationLedger {
    entries: Vec<StagedMutation>,
    index: HashMap<DocId, usize>,
}

impl StagedMutationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, id: &DocId) -> Option<&StagedMutation> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, id: &DocId) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StagedMutation> {
        self.entries.iter()
    }

    /// Owned copy for walking the ledger across await points.
    pub fn snapshot(&self) -> Vec<StagedMutation> {
        self.entries.clone()
    }

    pub fn of_kind(&self, kind: StagedMutationKind) -> impl Iterator<Item = &StagedMutation> {
        self.entries.iter().filter(move |m| m.kind == kind)
    }

    pub fn doc_records(&self, kind: StagedMutationKind) -> Vec<DocRecord> {
        self.of_kind(kind).map(StagedMutation::as_doc_record).collect()
    }

    /// Adds `mutation`, replacing any entry for the same document.
    pub fn upsert(&mut self, mutation: StagedMutation) {
        match self.index.get(mutation.id()) {
            Some(&i) => self.entries[i] = mutation,
            None => {
                self.index.insert(mutation.id().clone(), self.entries.len());
                self.entries.push(mutation);
            }
        }
    }

    pub fn stage_insert(
        &mut self,
        doc: TransactionGetResult,
        content: Value,
        token: Option<MutationToken>,
    ) {
        self.upsert(StagedMutation {
            doc,
            content: Some(content),
            kind: StagedMutationKind::Insert,
            mutation_token: token,
        });
    }

    /// A replace of a document this attempt inserted stays an insert.
    pub fn stage_replace(
        &mut self,
        doc: TransactionGetResult,
        content: Value,
        token: Option<MutationToken>,
    ) -> StagedMutationKind {
        let kind = match self.find(doc.id()) {
            Some(prev) if prev.kind == StagedMutationKind::Insert => StagedMutationKind::Insert,
            _ => StagedMutationKind::Replace,
        };
        self.upsert(StagedMutation {
            doc,
            content: Some(content),
            kind,
            mutation_token: token,
        });
        kind
    }

    /// Removing a document this attempt inserted cannot be expressed as one
    /// staged operation and is rejected.
    pub fn stage_remove(
        &mut self,
        doc: TransactionGetResult,
        token: Option<MutationToken>,
    ) -> Result<(), AttemptError> {
        if self.is_staged_insert(doc.id()) {
            return Err(AttemptError::illegal_state(format!(
                "document {} is being removed after being inserted in the same attempt",
                doc.id()
            )));
        }
        self.upsert(StagedMutation {
            doc,
            content: None,
            kind: StagedMutationKind::Remove,
            mutation_token: token,
        });
        Ok(())
    }

    pub fn is_staged_insert(&self, id: &DocId) -> bool {
        self.find(id)
            .is_some_and(|m| m.kind == StagedMutationKind::Insert)
    }

    pub(crate) fn update_cas(&mut self, id: &DocId, cas: u64) {
        if let Some(&i) = self.index.get(id) {
            self.entries[i].doc.cas = cas;
        }
    }

    pub fn mutation_tokens(&self) -> Vec<MutationToken> {
        self.entries
            .iter()
            .filter_map(|m| m.mutation_token.clone())
            .collect()
    }
}
