use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::data_model::ids::DocId;
use crate::data_model::xattrs::{DocumentMetadata, StagedOperationType, TransactionXattrs};

/// A raw document lookup: body, transaction metadata and document metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentLookupResult {
    pub id: DocId,
    pub cas: u64,
    /// True for tombstones, including tombstones carrying a staged insert.
    pub is_deleted: bool,
    pub body: Option<Value>,
    pub xattrs: Option<TransactionXattrs>,
    pub metadata: Option<DocumentMetadata>,
}

impl DocumentLookupResult {
    /// The document as it was before any staged change.
    pub fn pre_transaction_result(&self) -> TransactionGetResult {
        TransactionGetResult {
            id: self.id.clone(),
            cas: self.cas,
            content: self.body.clone(),
            xattrs: self.xattrs.clone(),
            is_deleted: self.is_deleted,
            metadata: self.metadata.clone(),
            txn_meta: None,
        }
    }

    /// The document as it will be once its staged change is committed.
    pub fn post_transaction_result(&self) -> TransactionGetResult {
        let content = self
            .xattrs
            .as_ref()
            .and_then(|x| x.staged_content())
            .cloned();
        TransactionGetResult {
            id: self.id.clone(),
            cas: self.cas,
            content,
            xattrs: self.xattrs.clone(),
            is_deleted: self.is_deleted,
            metadata: self.metadata.clone(),
            txn_meta: None,
        }
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.xattrs
            .as_ref()
            .and_then(|x| x.transaction_id())
            .is_some()
    }
}

/// A document as seen from inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionGetResult {
    pub(crate) id: DocId,
    pub(crate) cas: u64,
    pub(crate) content: Option<Value>,
    pub(crate) xattrs: Option<TransactionXattrs>,
    pub(crate) is_deleted: bool,
    pub(crate) metadata: Option<DocumentMetadata>,
    /// Opaque transaction metadata returned by the query service.
    pub(crate) txn_meta: Option<Value>,
}

impl TransactionGetResult {
    pub(crate) fn new(id: DocId, cas: u64, content: Option<Value>) -> Self {
        Self {
            id,
            cas,
            content,
            xattrs: None,
            is_deleted: false,
            metadata: None,
            txn_meta: None,
        }
    }

    pub fn id(&self) -> &DocId {
        &self.id
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    pub fn content(&self) -> Option<&Value> {
        self.content.as_ref()
    }

    pub fn content_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.content.clone().unwrap_or(Value::Null))
    }

    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    pub fn transaction_xattrs(&self) -> Option<&TransactionXattrs> {
        self.xattrs.as_ref()
    }

    pub fn metadata(&self) -> Option<&DocumentMetadata> {
        self.metadata.as_ref()
    }

    pub(crate) fn staged_operation(&self) -> Option<StagedOperationType> {
        self.xattrs.as_ref().and_then(|x| x.operation_type())
    }

    pub(crate) fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub(crate) fn with_content(mut self, content: Option<Value>) -> Self {
        self.content = content;
        self
    }
}
