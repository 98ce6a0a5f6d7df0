//! Common utilities for Atrium integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use atrium::cleanup::{ClientRecordDetails, CleanerRepository, ClusterTopology};
use atrium::config::DurabilityLevel;
use atrium::data_model::{
    AtrEntry, AtrRef, CompositeId, DocId, DocumentLookupResult, DocumentMetadata,
    STAGED_REMOVE_SENTINEL, StagedOperationType, TransactionGetResult, TransactionXattrs,
};
use atrium::errors::KvError;
use atrium::hooks::TestHooks;
use atrium::query::{QueryEngine, QueryRequest, QueryResult};
use atrium::repository::{
    AtrMutations, AtrRepository, DocumentRepository, KvResult, MutationResult, MutationToken,
    StagingContext,
};
use atrium::{Keyspace, TransactionConfig, Transactions};

pub const BUCKET: &str = "default";
const FOREIGN_ATR: &str = "_txn:atr-foreign";

pub fn doc_id(key: &str) -> DocId {
    DocId::new(Keyspace::default_collection(BUCKET), key)
}

/// Config for tests: no background cleanup unless a test asks for it.
pub fn test_config() -> TransactionConfig {
    TransactionConfig::builder()
        .expiration_time(Duration::from_secs(5))
        .cleanup_client_attempts(false)
        .cleanup_lost_attempts(false)
        .build()
}

/// Helper function to create a Transactions instance over a fresh cluster.
pub fn setup(config: TransactionConfig) -> (Arc<MockCluster>, Transactions) {
    let cluster = Arc::new(MockCluster::new());
    let transactions = Transactions::new(config, cluster.clone(), cluster.clone());
    (cluster, transactions)
}

pub fn setup_with_hooks(
    config: TransactionConfig,
) -> (Arc<MockCluster>, Arc<FaultInjector>, Transactions) {
    let cluster = Arc::new(MockCluster::new());
    let hooks = Arc::new(FaultInjector::default());
    let transactions = Transactions::builder(config, cluster.clone(), cluster.clone())
        .test_hooks(hooks.clone())
        .build();
    (cluster, hooks, transactions)
}

// --- MockCluster ---

#[derive(Debug, Clone)]
pub struct StoredDoc {
    pub cas: u64,
    pub body: Option<Value>,
    pub deleted: bool,
    pub xattrs: Option<TransactionXattrs>,
}

/// An in-memory cluster with CAS checks and tombstones, implementing every
/// storage collaborator.
#[derive(Default)]
pub struct MockCluster {
    docs: Mutex<HashMap<DocId, StoredDoc>>,
    atrs: Mutex<HashMap<AtrRef, BTreeMap<String, AtrEntry>>>,
    clients: Mutex<HashMap<String, BTreeMap<String, Instant>>>,
    cas_counter: AtomicU64,
    pub atr_commit_calls: AtomicUsize,
    /// Number of document lookups served.
    pub lookups: AtomicUsize,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_cas(&self) -> u64 {
        self.cas_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn result(&self, id: &DocId, cas: u64) -> MutationResult {
        MutationResult {
            cas,
            token: Some(MutationToken {
                bucket: id.bucket().to_string(),
                vbucket_id: 0,
                vbucket_uuid: 1,
                sequence_number: cas,
            }),
        }
    }

    /// Writes a plain document outside any transaction.
    pub fn upsert(&self, key: &str, body: Value) -> u64 {
        let cas = self.next_cas();
        self.docs.lock().insert(
            doc_id(key),
            StoredDoc {
                cas,
                body: Some(body),
                deleted: false,
                xattrs: None,
            },
        );
        cas
    }

    pub fn stored(&self, key: &str) -> Option<StoredDoc> {
        self.docs.lock().get(&doc_id(key)).cloned()
    }

    /// Body of a live document, as a non-transactional reader sees it.
    pub fn body(&self, key: &str) -> Option<Value> {
        self.stored(key).filter(|d| !d.deleted).and_then(|d| d.body)
    }

    pub fn has_txn_metadata(&self, key: &str) -> bool {
        self.stored(key).is_some_and(|d| d.xattrs.is_some())
    }

    pub fn atr_entries(&self) -> Vec<AtrEntry> {
        self.atrs
            .lock()
            .values()
            .flat_map(|entries| entries.values().cloned())
            .collect()
    }

    pub fn atr_entry(&self, attempt_id: &str) -> Option<AtrEntry> {
        self.atr_entries()
            .into_iter()
            .find(|e| e.attempt_id == attempt_id)
    }

    pub fn client_count(&self, bucket: &str) -> usize {
        self.clients.lock().get(bucket).map_or(0, BTreeMap::len)
    }

    /// Stages `op` on `key` the way an attempt of another transaction would,
    /// adding a pending-style ATR entry in `state` unless it is `None`.
    /// Returns the foreign attempt id.
    pub fn stage_foreign(
        &self,
        key: &str,
        op: StagedOperationType,
        staged: Option<Value>,
        state: Option<&str>,
    ) -> String {
        let attempt_id = format!("foreign-attempt-{}", self.next_cas());
        let staging = StagingContext {
            id: CompositeId {
                transaction_id: format!("foreign-txn-{attempt_id}"),
                attempt_id: attempt_id.clone(),
            },
            atr_ref: AtrRef::new(&Keyspace::default_collection(BUCKET), FOREIGN_ATR),
            durability: DurabilityLevel::None,
        };

        let cas = self.next_cas();
        let mut docs = self.docs.lock();
        let previous = docs.get(&doc_id(key)).cloned();
        let committed = previous.as_ref().and_then(|d| d.body.clone());
        let (body, deleted, staged) = match op {
            StagedOperationType::Insert => (None, true, staged),
            StagedOperationType::Replace => (committed, false, staged),
            StagedOperationType::Remove => (committed, false, Some(json!(STAGED_REMOVE_SENTINEL))),
        };
        let restore = previous.map(|d| DocumentMetadata {
            cas: Some(d.cas.to_string()),
            ..Default::default()
        });
        docs.insert(
            doc_id(key),
            StoredDoc {
                cas,
                body,
                deleted,
                xattrs: Some(staging.xattrs(op, staged, restore)),
            },
        );
        drop(docs);

        if let Some(state) = state {
            self.atrs.lock().entry(staging.atr_ref.clone()).or_default().insert(
                attempt_id.clone(),
                AtrEntry {
                    attempt_id: attempt_id.clone(),
                    transaction_id: staging.id.transaction_id.clone(),
                    state: state.to_string(),
                    timestamp_start_ms: now_ms(),
                    expires_after_ms: 60_000,
                    pending_sentinel: (state == "pending").then_some(0),
                    durability_level: None,
                    inserted: vec![],
                    replaced: vec![],
                    removed: vec![],
                    forward_compatibility: None,
                },
            );
        }
        attempt_id
    }

    pub fn set_atr_state(&self, attempt_id: &str, state: &str) {
        for entries in self.atrs.lock().values_mut() {
            if let Some(entry) = entries.get_mut(attempt_id) {
                entry.state = state.to_string();
            }
        }
    }

    /// Backdates an entry so that it has outlived its expiry budget.
    pub fn expire_atr_entry(&self, attempt_id: &str) {
        for entries in self.atrs.lock().values_mut() {
            if let Some(entry) = entries.get_mut(attempt_id) {
                entry.timestamp_start_ms = 0;
            }
        }
    }

    pub fn drop_atr_entry(&self, attempt_id: &str) {
        for entries in self.atrs.lock().values_mut() {
            entries.remove(attempt_id);
        }
    }

    fn with_entry<T>(
        &self,
        atr: &AtrRef,
        attempt_id: &str,
        f: impl FnOnce(&mut AtrEntry) -> T,
    ) -> KvResult<T> {
        let mut atrs = self.atrs.lock();
        let entries = atrs.get_mut(atr).ok_or(KvError::DocumentNotFound)?;
        let entry = entries.get_mut(attempt_id).ok_or(KvError::PathNotFound)?;
        Ok(f(entry))
    }

    fn check_cas(doc: &StoredDoc, cas: u64) -> KvResult<()> {
        if cas != 0 && doc.cas != cas {
            return Err(KvError::CasMismatch);
        }
        Ok(())
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[async_trait]
impl DocumentRepository for MockCluster {
    async fn lookup_document(
        &self,
        id: &DocId,
        _full_document: bool,
    ) -> KvResult<Option<DocumentLookupResult>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.docs.lock().get(id).map(|doc| DocumentLookupResult {
            id: id.clone(),
            cas: doc.cas,
            is_deleted: doc.deleted,
            body: doc.body.clone(),
            xattrs: doc.xattrs.clone(),
            metadata: Some(DocumentMetadata {
                cas: Some(doc.cas.to_string()),
                ..Default::default()
            }),
        }))
    }

    async fn mutate_staged_insert(
        &self,
        id: &DocId,
        content: &Value,
        staging: &StagingContext,
        cas: Option<u64>,
    ) -> KvResult<MutationResult> {
        let mut docs = self.docs.lock();
        match (docs.get(id), cas) {
            (Some(_), None) => return Err(KvError::DocumentExists),
            (None, Some(_)) => return Err(KvError::DocumentNotFound),
            (Some(existing), Some(cas)) => {
                if !existing.deleted {
                    return Err(KvError::DocumentExists);
                }
                Self::check_cas(existing, cas)?;
            }
            (None, None) => {}
        }
        let cas = self.next_cas();
        docs.insert(
            id.clone(),
            StoredDoc {
                cas,
                body: None,
                deleted: true,
                xattrs: Some(staging.xattrs(
                    StagedOperationType::Insert,
                    Some(content.clone()),
                    None,
                )),
            },
        );
        Ok(self.result(id, cas))
    }

    async fn mutate_staged_replace(
        &self,
        doc: &TransactionGetResult,
        content: &Value,
        staging: &StagingContext,
        access_deleted: bool,
    ) -> KvResult<MutationResult> {
        let mut docs = self.docs.lock();
        let stored = docs.get_mut(doc.id()).ok_or(KvError::DocumentNotFound)?;
        if stored.deleted && !access_deleted {
            return Err(KvError::DocumentNotFound);
        }
        Self::check_cas(stored, doc.cas())?;
        stored.cas = self.next_cas();
        stored.xattrs = Some(staging.xattrs(
            StagedOperationType::Replace,
            Some(content.clone()),
            doc.metadata().cloned(),
        ));
        Ok(self.result(doc.id(), stored.cas))
    }

    async fn mutate_staged_remove(
        &self,
        doc: &TransactionGetResult,
        staging: &StagingContext,
    ) -> KvResult<MutationResult> {
        let mut docs = self.docs.lock();
        let stored = docs.get_mut(doc.id()).ok_or(KvError::DocumentNotFound)?;
        if stored.deleted {
            return Err(KvError::DocumentNotFound);
        }
        Self::check_cas(stored, doc.cas())?;
        stored.cas = self.next_cas();
        stored.xattrs = Some(staging.xattrs(
            StagedOperationType::Remove,
            Some(json!(STAGED_REMOVE_SENTINEL)),
            doc.metadata().cloned(),
        ));
        Ok(self.result(doc.id(), stored.cas))
    }

    async fn unstage_insert_or_replace(
        &self,
        id: &DocId,
        cas: u64,
        content: &Value,
        insert_mode: bool,
        _durability: DurabilityLevel,
    ) -> KvResult<MutationResult> {
        let mut docs = self.docs.lock();
        match docs.get(id) {
            Some(existing) if insert_mode && !existing.deleted => {
                return Err(KvError::DocumentExists);
            }
            Some(existing) if !insert_mode => {
                if existing.deleted {
                    return Err(KvError::DocumentNotFound);
                }
                Self::check_cas(existing, cas)?;
            }
            None if !insert_mode => return Err(KvError::DocumentNotFound),
            _ => {}
        }
        let cas = self.next_cas();
        docs.insert(
            id.clone(),
            StoredDoc {
                cas,
                body: Some(content.clone()),
                deleted: false,
                xattrs: None,
            },
        );
        Ok(self.result(id, cas))
    }

    async fn unstage_remove(
        &self,
        id: &DocId,
        cas: u64,
        _durability: DurabilityLevel,
    ) -> KvResult<MutationResult> {
        let mut docs = self.docs.lock();
        let stored = docs.get_mut(id).ok_or(KvError::DocumentNotFound)?;
        Self::check_cas(stored, cas)?;
        stored.cas = self.next_cas();
        stored.deleted = true;
        stored.body = None;
        stored.xattrs = None;
        Ok(self.result(id, stored.cas))
    }

    async fn clear_transaction_metadata(
        &self,
        id: &DocId,
        cas: u64,
        _is_deleted: bool,
    ) -> KvResult<()> {
        let mut docs = self.docs.lock();
        let stored = docs.get_mut(id).ok_or(KvError::DocumentNotFound)?;
        if stored.xattrs.is_none() {
            return Err(KvError::PathNotFound);
        }
        Self::check_cas(stored, cas)?;
        stored.cas = self.next_cas();
        stored.xattrs = None;
        Ok(())
    }
}

#[async_trait]
impl AtrRepository for MockCluster {
    async fn mutate_atr_pending(
        &self,
        atr: &AtrRef,
        id: &CompositeId,
        expires_after_ms: u64,
        durability: DurabilityLevel,
    ) -> KvResult<()> {
        let mut atrs = self.atrs.lock();
        let entries = atrs.entry(atr.clone()).or_default();
        if entries.contains_key(&id.attempt_id) {
            return Err(KvError::PathExists);
        }
        entries.insert(
            id.attempt_id.clone(),
            AtrEntry {
                attempt_id: id.attempt_id.clone(),
                transaction_id: id.transaction_id.clone(),
                state: "pending".into(),
                timestamp_start_ms: now_ms(),
                expires_after_ms,
                pending_sentinel: Some(0),
                durability_level: Some(durability.as_atr_code().to_string()),
                inserted: vec![],
                replaced: vec![],
                removed: vec![],
                forward_compatibility: None,
            },
        );
        Ok(())
    }

    async fn mutate_atr_commit(
        &self,
        atr: &AtrRef,
        attempt_id: &str,
        mutations: &AtrMutations,
    ) -> KvResult<()> {
        self.atr_commit_calls.fetch_add(1, Ordering::SeqCst);
        self.with_entry(atr, attempt_id, |entry| {
            if entry.state != "pending" {
                return Err(KvError::PathNotFound);
            }
            entry.state = "committed".into();
            entry.pending_sentinel = None;
            entry.inserted = mutations.inserted.clone();
            entry.replaced = mutations.replaced.clone();
            entry.removed = mutations.removed.clone();
            Ok(())
        })?
    }

    async fn mutate_atr_complete(&self, atr: &AtrRef, attempt_id: &str) -> KvResult<()> {
        self.with_entry(atr, attempt_id, |entry| entry.state = "completed".into())
    }

    async fn mutate_atr_aborted(
        &self,
        atr: &AtrRef,
        attempt_id: &str,
        mutations: &AtrMutations,
    ) -> KvResult<()> {
        self.with_entry(atr, attempt_id, |entry| {
            entry.state = "aborted".into();
            entry.inserted = mutations.inserted.clone();
            entry.replaced = mutations.replaced.clone();
            entry.removed = mutations.removed.clone();
        })
    }

    async fn mutate_atr_rolled_back(&self, atr: &AtrRef, attempt_id: &str) -> KvResult<()> {
        self.with_entry(atr, attempt_id, |entry| entry.state = "rolled_back".into())
    }

    async fn lookup_atr_state(&self, atr: &AtrRef, attempt_id: &str) -> KvResult<String> {
        self.with_entry(atr, attempt_id, |entry| entry.state.clone())
    }

    async fn find_entry(&self, atr: &AtrRef, attempt_id: &str) -> KvResult<Option<AtrEntry>> {
        let atrs = self.atrs.lock();
        let entries = atrs.get(atr).ok_or(KvError::DocumentNotFound)?;
        Ok(entries.get(attempt_id).cloned())
    }

    async fn lookup_entries(&self, atr: &AtrRef) -> KvResult<Vec<AtrEntry>> {
        let atrs = self.atrs.lock();
        let entries = atrs.get(atr).ok_or(KvError::DocumentNotFound)?;
        Ok(entries.values().cloned().collect())
    }

    async fn remove_entry(&self, atr: &AtrRef, attempt_id: &str) -> KvResult<()> {
        let mut atrs = self.atrs.lock();
        let entries = atrs.get_mut(atr).ok_or(KvError::DocumentNotFound)?;
        entries
            .remove(attempt_id)
            .map(|_| ())
            .ok_or(KvError::PathNotFound)
    }
}

#[async_trait]
impl ClusterTopology for MockCluster {
    async fn bucket_names(&self) -> KvResult<Vec<String>> {
        Ok(vec![BUCKET.to_string()])
    }
}

#[async_trait]
impl CleanerRepository for MockCluster {
    async fn create_or_update_client_record(
        &self,
        bucket: &str,
        client_uuid: &str,
        client_expiry: Duration,
    ) -> KvResult<ClientRecordDetails> {
        let mut clients = self.clients.lock();
        let record = clients.entry(bucket.to_string()).or_default();
        record.insert(client_uuid.to_string(), Instant::now());
        let expired_client_ids: Vec<String> = record
            .iter()
            .filter(|(_, seen)| seen.elapsed() > client_expiry)
            .map(|(id, _)| id.clone())
            .collect();
        let active: Vec<&String> = record
            .keys()
            .filter(|id| !expired_client_ids.contains(*id))
            .collect();
        let index_of_this_client = active
            .iter()
            .position(|id| id.as_str() == client_uuid)
            .unwrap_or(0);
        Ok(ClientRecordDetails {
            client_uuid: client_uuid.to_string(),
            index_of_this_client,
            num_active_clients: active.len(),
            expired_client_ids,
        })
    }

    async fn remove_client_record(&self, bucket: &str, client_uuid: &str) -> KvResult<()> {
        if let Some(record) = self.clients.lock().get_mut(bucket) {
            record.remove(client_uuid);
        }
        Ok(())
    }
}

// --- ScriptedQueryEngine ---

/// Answers statements from a script, recording every request.
#[derive(Default)]
pub struct ScriptedQueryEngine {
    script: Mutex<HashMap<String, VecDeque<Result<QueryResult, KvError>>>>,
    pub requests: Mutex<Vec<QueryRequest>>,
}

impl ScriptedQueryEngine {
    /// Queues a response for the next execution of `statement`. Statements
    /// without a queued response succeed with no rows.
    pub fn respond(&self, statement: &str, response: Result<QueryResult, KvError>) {
        self.script
            .lock()
            .entry(statement.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn statements(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .map(|r| r.statement.clone())
            .collect()
    }
}

pub fn rows(rows: Vec<Value>) -> QueryResult {
    QueryResult {
        rows,
        dispatched_to: Some("node-1".to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl QueryEngine for ScriptedQueryEngine {
    async fn query(&self, request: QueryRequest) -> Result<QueryResult, KvError> {
        let statement = request.statement.clone();
        self.requests.lock().push(request);
        self.script
            .lock()
            .get_mut(&statement)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(rows(vec![])))
    }
}

// --- FaultInjector ---

/// Test hooks failing named steps with scripted errors.
#[derive(Default)]
pub struct FaultInjector {
    faults: Mutex<HashMap<&'static str, VecDeque<KvError>>>,
    fired: Mutex<HashMap<&'static str, usize>>,
    expire_at: Mutex<Option<String>>,
}

impl FaultInjector {
    /// The next call of hook `name` fails with `err`.
    pub fn fail_once(&self, name: &'static str, err: KvError) {
        self.faults.lock().entry(name).or_default().push_back(err);
    }

    /// Every attempt is considered expired from stage `stage` on.
    pub fn expire_at(&self, stage: &str) {
        *self.expire_at.lock() = Some(stage.to_string());
    }

    pub fn fired(&self, name: &str) -> usize {
        self.fired.lock().get(name).copied().unwrap_or(0)
    }

    fn fire(&self, name: &'static str) -> KvResult<()> {
        *self.fired.lock().entry(name).or_default() += 1;
        match self.faults.lock().get_mut(name).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TestHooks for FaultInjector {
    async fn before_atr_pending(&self, _attempt_id: &str) -> KvResult<()> {
        self.fire("before_atr_pending")
    }

    async fn before_atr_commit(&self, _attempt_id: &str) -> KvResult<()> {
        self.fire("before_atr_commit")
    }

    async fn after_atr_commit(&self, _attempt_id: &str) -> KvResult<()> {
        self.fire("after_atr_commit")
    }

    async fn before_atr_commit_ambiguity_resolution(&self, _attempt_id: &str) -> KvResult<()> {
        self.fire("before_atr_commit_ambiguity_resolution")
    }

    async fn before_atr_complete(&self, _attempt_id: &str) -> KvResult<()> {
        self.fire("before_atr_complete")
    }

    async fn before_atr_aborted(&self, _attempt_id: &str) -> KvResult<()> {
        self.fire("before_atr_aborted")
    }

    async fn before_staged_insert(&self, _attempt_id: &str, _key: &str) -> KvResult<()> {
        self.fire("before_staged_insert")
    }

    async fn before_staged_replace(&self, _attempt_id: &str, _key: &str) -> KvResult<()> {
        self.fire("before_staged_replace")
    }

    async fn before_doc_committed(&self, _attempt_id: &str, _key: &str) -> KvResult<()> {
        self.fire("before_doc_committed")
    }

    async fn before_doc_rolled_back(&self, _attempt_id: &str, _key: &str) -> KvResult<()> {
        self.fire("before_doc_rolled_back")
    }

    fn has_expired_client_side(&self, _attempt_id: &str, stage: &str, _key: Option<&str>) -> bool {
        self.expire_at.lock().as_deref() == Some(stage)
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
