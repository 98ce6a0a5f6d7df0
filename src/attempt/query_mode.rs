use std::sync::atomic::Ordering;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_json::{Value, json};

use super::AttemptContext;
use crate::atr_ids::NUM_ATRS;
use crate::data_model::{AttemptState, DocId, TransactionGetResult};
use crate::errors::{
    AttemptError, ErrorBuilder, ErrorClass, FinalError, KvError, Result,
    TransactionOperationFailed,
};
use crate::hooks::stage;
use crate::ledger::StagedMutationKind;
use crate::query::{
    QueryEngine, QueryOptions, QueryRequest, QueryResult, QueryStatus, TxData,
    TxDataConfig, TxDataMutation, TxDataState, codes,
};

/// Query operations are refused when less than this is left of the budget.
pub const EXPIRY_THRESHOLD: Duration = Duration::from_millis(10);

/// Flags of one statement sent on behalf of the attempt.
#[derive(Debug, Clone, Copy)]
struct StatementKind {
    stage: &'static str,
    is_begin_work: bool,
    check_previous_errors: bool,
    /// Off for rollback, which must still run once done or expired.
    check_done_and_expiry: bool,
}

impl StatementKind {
    const fn new(stage: &'static str) -> Self {
        Self {
            stage,
            is_begin_work: false,
            check_previous_errors: true,
            check_done_and_expiry: true,
        }
    }
}

impl AttemptContext {
    /// Runs `statement` inside this attempt. The first call switches the
    /// attempt into query mode; every later operation then goes through the
    /// query service.
    pub async fn query(&self, statement: &str, options: QueryOptions) -> Result<QueryResult> {
        self.query_with_context(statement, options, None).await
    }

    /// Like [`AttemptContext::query`], scoped to `query_context` (`bucket.scope`).
    pub async fn query_with_context(
        &self,
        statement: &str,
        options: QueryOptions,
        query_context: Option<String>,
    ) -> Result<QueryResult> {
        match self
            .query_wrapper(
                statement,
                options,
                query_context,
                StatementKind::new(stage::QUERY),
                None,
            )
            .await
        {
            Ok(result) => Ok(result),
            Err(AttemptError::Operation(op)) => Err(op),
            Err(err) => self.record(Err(ErrorBuilder::new(err.classify()).cause(err).build())),
        }
    }

    async fn query_wrapper(
        &self,
        statement: &str,
        options: QueryOptions,
        query_context: Option<String>,
        kind: StatementKind,
        txdata: Option<Value>,
    ) -> std::result::Result<QueryResult, AttemptError> {
        if !self.is_query_mode() {
            self.query_begin_work().await?;
        }
        self.execute_query(statement, options, query_context, kind, txdata)
            .await
    }

    /// Sends `BEGIN WORK`, handing the query service everything staged so far.
    async fn query_begin_work(&self) -> std::result::Result<(), AttemptError> {
        let _guard = self.query_begin.lock().await;
        if self.is_query_mode() {
            return Ok(());
        }
        info!("Attempt {} entering query mode", self.attempt_id);

        let txdata = serde_json::to_value(self.build_txdata())
            .map_err(|e| AttemptError::illegal_state(format!("cannot encode txdata: {e}")))?;
        let mut options = QueryOptions::default()
            .scan_consistency(self.config.scan_consistency)
            .raw(
                "durability_level",
                self.config.durability_level.as_query_param(),
            )
            .raw(
                "txtimeout",
                format!("{}ms", self.overall.remaining().as_millis()),
            )
            .raw("numatrs", NUM_ATRS);
        if let Some(collection) = &self.config.metadata_collection {
            options = options.raw("atrcollection", collection.to_query_keyspace());
        }

        let kind = StatementKind {
            is_begin_work: true,
            ..StatementKind::new(stage::QUERY_BEGIN_WORK)
        };
        let result = self
            .execute_query("BEGIN WORK", options, None, kind, Some(txdata))
            .await?;
        for row in &result.rows {
            if let Some(txid) = row.get("txid").and_then(Value::as_str) {
                if txid != self.attempt_id {
                    warn!(
                        "Attempt {} got transaction id {} from BEGIN WORK",
                        self.attempt_id, txid
                    );
                    let err = ErrorBuilder::new(ErrorClass::FailOther)
                        .cause(AttemptError::illegal_state(format!(
                            "BEGIN WORK started transaction {txid} for attempt {}",
                            self.attempt_id
                        )))
                        .build();
                    self.save_error(&err);
                    return Err(err.into());
                }
            }
        }
        self.query_mode.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn build_txdata(&self) -> TxData {
        let ledger = self.ledger.lock();
        let mutations = ledger
            .iter()
            .map(|m| {
                let id = m.id();
                TxDataMutation {
                    scp: id.keyspace.scope.clone(),
                    coll: id.keyspace.collection.clone(),
                    bkt: id.keyspace.bucket.clone(),
                    id: id.key.clone(),
                    cas: m.cas().to_string(),
                    op_type: match m.kind {
                        StagedMutationKind::Insert => "INSERT",
                        StagedMutationKind::Replace => "REPLACE",
                        StagedMutationKind::Remove => "REMOVE",
                    },
                }
            })
            .collect();
        TxData {
            id: self.composite_id(),
            state: TxDataState {
                time_left_ms: u64::try_from(self.overall.remaining().as_millis())
                    .unwrap_or(u64::MAX),
            },
            config: TxDataConfig {
                kv_timeout_ms: u64::try_from(self.config.key_value_timeout.as_millis())
                    .unwrap_or(u64::MAX),
                num_atrs: NUM_ATRS,
                durability_level: self.config.durability_level.as_query_param(),
            },
            atr_ref: self.atr_ref(),
            mutations,
        }
    }

    fn query_pre_check(&self, statement: &str, kind: StatementKind) -> Result<()> {
        if kind.check_done_and_expiry {
            self.done_check()?;
        }
        if kind.check_previous_errors {
            self.check_errors()?;
        }
        if !kind.check_done_and_expiry {
            return Ok(());
        }
        let expires_soon = self.overall.remaining() < EXPIRY_THRESHOLD;
        if expires_soon || self.has_expired_client_side(kind.stage, Some(statement)) {
            return Err(ErrorBuilder::new(ErrorClass::FailExpiry)
                .cause(self.expired(kind.stage))
                .do_not_rollback_attempt()
                .raise(FinalError::TransactionExpired)
                .build());
        }
        Ok(())
    }

    fn query_engine(&self) -> std::result::Result<&dyn QueryEngine, AttemptError> {
        self.query_engine.as_deref().ok_or_else(|| {
            AttemptError::Operation(
                ErrorBuilder::new(ErrorClass::FailOther)
                    .cause(KvError::FeatureNotAvailable(
                        "no query engine configured".to_string(),
                    ))
                    .build(),
            )
        })
    }

    async fn execute_query(
        &self,
        statement: &str,
        mut options: QueryOptions,
        query_context: Option<String>,
        kind: StatementKind,
        txdata: Option<Value>,
    ) -> std::result::Result<QueryResult, AttemptError> {
        debug!(
            "Attempt {} executing {} ({})",
            self.attempt_id, statement, kind.stage
        );
        self.query_pre_check(statement, kind)?;
        if !kind.is_begin_work {
            options = options.raw("txid", self.attempt_id.clone());
            if let Some(node) = self.last_dispatched_node.lock().clone() {
                options.target_node = Some(node);
            }
        }
        if let Some(txdata) = txdata {
            options = options.raw("txdata", txdata);
        }
        let engine = self.query_engine()?;
        let request = QueryRequest {
            statement: statement.to_string(),
            query_context,
            options,
        };

        let res: std::result::Result<QueryResult, AttemptError> = async {
            self.hooks.before_query(&self.attempt_id, statement).await?;
            let result = engine.query(request).await?;
            self.hooks.after_query(&self.attempt_id, statement).await?;
            Ok(result)
        }
        .await;

        match res {
            Ok(result) => {
                if result.status == QueryStatus::Fatal {
                    let err = ErrorBuilder::new(ErrorClass::FailOther)
                        .cause(AttemptError::illegal_state(format!(
                            "query {statement} returned a fatal status"
                        )))
                        .build();
                    self.save_error(&err);
                    return Err(err.into());
                }
                if let Some(node) = &result.dispatched_to {
                    *self.last_dispatched_node.lock() = Some(node.clone());
                }
                Ok(result)
            }
            Err(err) => {
                error!(
                    "Attempt {} statement {} failed: {}",
                    self.attempt_id, statement, err
                );
                let converted = self.convert_query_error(err);
                if let AttemptError::Operation(op) = &converted {
                    self.save_error(op);
                }
                Err(converted)
            }
        }
    }

    /// Maps query-service failures onto the attempt's error model.
    fn convert_query_error(&self, err: AttemptError) -> AttemptError {
        let query_error = match &err {
            AttemptError::Kv(KvError::Timeout) => return self.expired(stage::QUERY),
            AttemptError::Kv(KvError::Query(query_error)) => query_error,
            _ => return err,
        };
        let Some(chosen) = query_error.choose() else {
            return err;
        };
        match chosen.code {
            codes::FEATURE_NOT_AVAILABLE => ErrorBuilder::new(ErrorClass::FailOther)
                .cause(KvError::FeatureNotAvailable(chosen.message.clone()))
                .build()
                .into(),
            codes::ATTEMPT_NOT_FOUND => AttemptError::AttemptNotFoundOnQuery,
            codes::TIMEOUT | codes::ATTEMPT_EXPIRED => ErrorBuilder::new(ErrorClass::FailExpiry)
                .cause(self.expired(stage::QUERY))
                .raise(FinalError::TransactionExpired)
                .build()
                .into(),
            codes::DOCUMENT_EXISTS => KvError::DocumentExists.into(),
            codes::DOCUMENT_NOT_FOUND => KvError::DocumentNotFound.into(),
            codes::CAS_MISMATCH => KvError::CasMismatch.into(),
            _ => match &chosen.cause {
                Some(cause) => {
                    let mut builder = ErrorBuilder::new(ErrorClass::FailOther).cause(err.clone());
                    if cause.retry == Some(true) {
                        builder = builder.retry_transaction();
                    }
                    if cause.rollback == Some(false) {
                        builder = builder.do_not_rollback_attempt();
                    }
                    builder = builder.raise(match cause.raise.as_deref() {
                        Some("expired") => FinalError::TransactionExpired,
                        Some("commit_ambiguous") => FinalError::TransactionCommitAmbiguous,
                        Some("failed_post_commit") => FinalError::TransactionFailedPostCommit,
                        _ => FinalError::TransactionFailed,
                    });
                    builder.build().into()
                }
                None => err,
            },
        }
    }

    fn kv_statement_options(&self, id: &DocId, extra: Vec<Value>) -> QueryOptions {
        let mut options = QueryOptions::default()
            .parameter(id.keyspace.to_query_keyspace())
            .parameter(id.key.clone());
        options.positional_parameters.extend(extra);
        options
    }

    fn doc_from_row(
        &self,
        id: &DocId,
        row: &Value,
        content: Option<Value>,
    ) -> Result<TransactionGetResult> {
        let Some(cas) = row
            .get("scas")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<u64>().ok())
        else {
            return Err(self.malformed_response(format!(
                "query response for {id} carries no usable scas"
            )));
        };
        let content = content.or_else(|| row.get("doc").cloned());
        let mut doc = TransactionGetResult::new(id.clone(), cas, content);
        doc.txn_meta = row.get("txnMeta").cloned();
        Ok(doc)
    }

    /// Turns a failed KV-over-query statement into an operation error,
    /// recording it unless it was already recorded.
    fn query_kv_failure(&self, err: AttemptError, retry_on: &[ErrorClass]) -> TransactionOperationFailed {
        if let AttemptError::Operation(op) = err {
            return op;
        }
        let class = err.classify();
        let builder = ErrorBuilder::new(class).cause(err);
        let failure = if retry_on.contains(&class) {
            builder.retry_transaction().build()
        } else {
            builder.build()
        };
        self.save_error(&failure);
        failure
    }

    pub(super) async fn get_with_query(&self, id: &DocId) -> Result<Option<TransactionGetResult>> {
        let res = self
            .query_wrapper(
                "EXECUTE __get",
                self.kv_statement_options(id, vec![json!({})]),
                None,
                StatementKind::new(stage::QUERY_KV_GET),
                Some(json!({"kv": true})),
            )
            .await;
        match res {
            Ok(result) => match result.rows.first() {
                Some(row) => self.doc_from_row(id, row, None).map(Some),
                None => Ok(None),
            },
            Err(AttemptError::Kv(KvError::DocumentNotFound)) => Ok(None),
            Err(err) => Err(self.query_kv_failure(err, &[])),
        }
    }

    pub(super) async fn insert_with_query(
        &self,
        id: &DocId,
        content: Value,
    ) -> Result<TransactionGetResult> {
        let res = self
            .query_wrapper(
                "EXECUTE __insert",
                self.kv_statement_options(id, vec![content.clone(), json!({})]),
                None,
                StatementKind::new(stage::QUERY_KV_INSERT),
                Some(json!({"kv": true})),
            )
            .await;
        match res {
            Ok(result) => match result.rows.first() {
                Some(row) => self.doc_from_row(id, row, Some(content)),
                None => Err(self.malformed_response(format!("query returned no row for {id}"))),
            },
            // The application may want to handle this one; it is not recorded.
            Err(AttemptError::Kv(KvError::DocumentExists)) => {
                Err(ErrorBuilder::new(ErrorClass::FailDocAlreadyExists)
                    .cause(KvError::DocumentExists)
                    .build())
            }
            Err(err) => Err(self.query_kv_failure(err, &[])),
        }
    }

    pub(super) async fn replace_with_query(
        &self,
        doc: &TransactionGetResult,
        content: Value,
    ) -> Result<TransactionGetResult> {
        let id = doc.id();
        let txdata = match &doc.txn_meta {
            Some(meta) => json!({"kv": true, "scas": doc.cas().to_string(), "txnMeta": meta}),
            None => json!({"kv": true, "scas": doc.cas().to_string()}),
        };
        let res = self
            .query_wrapper(
                "EXECUTE __update",
                self.kv_statement_options(id, vec![content.clone(), json!({})]),
                None,
                StatementKind::new(stage::QUERY_KV_REPLACE),
                Some(txdata),
            )
            .await;
        match res {
            Ok(result) => match result.rows.first() {
                Some(row) => self.doc_from_row(id, row, Some(content)),
                None => Err(self.malformed_response(format!("query returned no row for {id}"))),
            },
            Err(err) => Err(self.query_kv_failure(
                err,
                &[ErrorClass::FailDocNotFound, ErrorClass::FailCasMismatch],
            )),
        }
    }

    pub(super) async fn remove_with_query(&self, doc: &TransactionGetResult) -> Result<()> {
        let id = doc.id();
        let txdata = match &doc.txn_meta {
            Some(meta) => json!({"kv": true, "scas": doc.cas().to_string(), "txnMeta": meta}),
            None => json!({"kv": true, "scas": doc.cas().to_string()}),
        };
        let res = self
            .query_wrapper(
                "EXECUTE __delete",
                self.kv_statement_options(id, vec![json!({})]),
                None,
                StatementKind::new(stage::QUERY_KV_REMOVE),
                Some(txdata),
            )
            .await;
        match res {
            Ok(_) => Ok(()),
            Err(err) => Err(self.query_kv_failure(
                err,
                &[ErrorClass::FailDocNotFound, ErrorClass::FailCasMismatch],
            )),
        }
    }

    pub(super) async fn commit_with_query(&self) -> Result<()> {
        let res = self
            .execute_query(
                "COMMIT",
                QueryOptions::default(),
                None,
                StatementKind::new(stage::QUERY_COMMIT),
                None,
            )
            .await;
        self.is_done.store(true, Ordering::SeqCst);
        match res {
            Ok(_) => {
                self.set_state(AttemptState::Completed);
                self.unstaging_complete.store(true, Ordering::SeqCst);
                info!("Attempt {} committed through query", self.attempt_id);
                Ok(())
            }
            Err(AttemptError::Operation(op)) => Err(op),
            Err(err) => {
                let class = err.classify();
                let builder = ErrorBuilder::new(class).cause(err).do_not_rollback_attempt();
                let builder = if class == ErrorClass::FailExpiry {
                    builder.raise(FinalError::TransactionCommitAmbiguous)
                } else {
                    builder
                };
                self.record(Err(builder.build()))
            }
        }
    }

    pub(super) async fn rollback_with_query(&self, is_app_rollback: bool) -> Result<()> {
        if is_app_rollback {
            self.done_check()?;
        }
        let kind = StatementKind {
            check_previous_errors: false,
            check_done_and_expiry: false,
            ..StatementKind::new(stage::QUERY_ROLLBACK)
        };
        let res = self
            .execute_query("ROLLBACK", QueryOptions::default(), None, kind, None)
            .await;
        self.is_done.store(true, Ordering::SeqCst);
        match res {
            Ok(_) => {
                self.set_state(AttemptState::RolledBack);
                info!("Attempt {} rolled back through query", self.attempt_id);
                Ok(())
            }
            Err(AttemptError::AttemptNotFoundOnQuery) => {
                debug!(
                    "Attempt {} unknown to the query service, nothing to roll back",
                    self.attempt_id
                );
                self.set_state(AttemptState::RolledBack);
                Ok(())
            }
            Err(AttemptError::Operation(op)) => Err(op),
            Err(err) => self.record(Err(ErrorBuilder::new(err.classify())
                .cause(err)
                .do_not_rollback_attempt()
                .build())),
        }
    }

    fn malformed_response(&self, message: String) -> TransactionOperationFailed {
        let err = ErrorBuilder::new(ErrorClass::FailOther)
            .cause(AttemptError::illegal_state(message))
            .build();
        self.save_error(&err);
        err
    }
}
