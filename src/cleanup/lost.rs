use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ahash::AHashMap;
use futures::future::join_all;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;

use crate::atr_ids;
use crate::cleanup::{Cleaner, CleanerRepository, CleanupRequest, ClusterTopology};
use crate::config::TransactionConfig;
use crate::data_model::{AtrRef, Keyspace};
use crate::errors::{AttemptError, KvError};
use crate::repository::AtrRepository;

/// How often the set of buckets is refreshed.
pub const DISCOVER_BUCKETS_PERIOD: Duration = Duration::from_secs(10);

/// Grace added to the cleanup window before a silent client is considered gone.
const CLIENT_RECORD_SAFETY_MARGIN: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq)]
pub struct LostCleanupConfig {
    /// Time over which each bucket's share of ATRs is swept once.
    pub cleanup_window: Duration,
    /// Collection holding ATRs, when not the buckets' default collections.
    pub metadata_collection: Option<Keyspace>,
}

impl From<&TransactionConfig> for LostCleanupConfig {
    fn from(config: &TransactionConfig) -> Self {
        Self {
            cleanup_window: config.cleanup_window,
            metadata_collection: config.metadata_collection.clone(),
        }
    }
}

/// Finds attempts abandoned by crashed clients and finishes them.
///
/// One cleaner task runs per bucket. Every cleanup window each cleaner
/// registers this client in the bucket's client record, takes its share of
/// the bucket's ATRs and cleans every expired entry in them.
pub struct LostTransactionManager {
    inner: Arc<ManagerInner>,
    discovery: Mutex<Option<JoinHandle<()>>>,
}

struct ManagerInner {
    client_uuid: String,
    topology: Arc<dyn ClusterTopology>,
    client_records: Arc<dyn CleanerRepository>,
    atrs: Arc<dyn AtrRepository>,
    cleaner: Arc<Cleaner>,
    config: LostCleanupConfig,
    cleaners: Mutex<AHashMap<String, PerBucketCleaner>>,
    /// Serializes discovery rounds with each other and with shutdown.
    discovery_guard: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl LostTransactionManager {
    /// Spawns bucket discovery on the current Tokio runtime. The first round
    /// runs immediately.
    pub fn start(
        topology: Arc<dyn ClusterTopology>,
        client_records: Arc<dyn CleanerRepository>,
        atrs: Arc<dyn AtrRepository>,
        cleaner: Arc<Cleaner>,
        config: LostCleanupConfig,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let inner = Arc::new(ManagerInner {
            client_uuid: uuid::Uuid::new_v4().to_string(),
            topology,
            client_records,
            atrs,
            cleaner,
            config,
            cleaners: Mutex::new(AHashMap::new()),
            discovery_guard: tokio::sync::Mutex::new(()),
            shutdown,
        });
        info!(
            "Starting lost transaction cleanup as client {}",
            inner.client_uuid
        );

        let task_inner = Arc::clone(&inner);
        let discovery = tokio::spawn(async move {
            let mut interval = time::interval(DISCOVER_BUCKETS_PERIOD);
            loop {
                tokio::select! {
                    _ = interval.tick() => task_inner.discover_buckets().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("Bucket discovery stopped");
        });

        Self {
            inner,
            discovery: Mutex::new(Some(discovery)),
        }
    }

    pub fn client_uuid(&self) -> &str {
        &self.inner.client_uuid
    }

    /// Runs a discovery round now instead of waiting for the next tick.
    pub async fn discover_buckets(&self) {
        self.inner.discover_buckets().await;
    }

    pub fn discovered_bucket_count(&self) -> usize {
        self.inner.cleaners.lock().len()
    }

    pub fn running_count(&self) -> usize {
        self.inner
            .cleaners
            .lock()
            .values()
            .filter(|c| c.is_running())
            .count()
    }

    /// Completed sweeps across the current per-bucket cleaners.
    pub fn total_run_count(&self) -> u64 {
        self.inner
            .cleaners
            .lock()
            .values()
            .map(|c| c.run_count.load(Ordering::SeqCst))
            .sum()
    }

    /// Stops discovery and every per-bucket cleaner, removing this client
    /// from the buckets' client records.
    pub async fn shutdown(&self) {
        debug!("Shutting down lost transaction cleanup");
        let _ = self.inner.shutdown.send(true);
        let discovery = self.discovery.lock().take();
        if let Some(discovery) = discovery {
            if let Err(e) = discovery.await {
                warn!("Bucket discovery task did not stop cleanly: {}", e);
            }
        }

        let _guard = self.inner.discovery_guard.lock().await;
        let cleaners: Vec<PerBucketCleaner> = self
            .inner
            .cleaners
            .lock()
            .drain()
            .map(|(_, cleaner)| cleaner)
            .collect();
        join_all(cleaners.into_iter().map(PerBucketCleaner::stop)).await;
        info!(
            "Lost transaction cleanup for client {} stopped",
            self.inner.client_uuid
        );
    }
}

impl ManagerInner {
    async fn discover_buckets(self: &Arc<Self>) {
        let _guard = self.discovery_guard.lock().await;
        if *self.shutdown.borrow() {
            return;
        }

        let buckets = match self.topology.bucket_names().await {
            Ok(buckets) => buckets,
            Err(e) => {
                warn!("Bucket discovery failed: {}", e);
                return;
            }
        };

        let (stale, missing) = {
            let mut cleaners = self.cleaners.lock();
            let stale_names: Vec<String> = cleaners
                .iter()
                .filter(|(name, cleaner)| !cleaner.is_running() || !buckets.contains(*name))
                .map(|(name, _)| name.clone())
                .collect();
            let stale: Vec<PerBucketCleaner> = stale_names
                .iter()
                .filter_map(|name| cleaners.remove(name))
                .collect();
            let missing: Vec<String> = buckets
                .iter()
                .filter(|name| !cleaners.contains_key(*name))
                .cloned()
                .collect();
            (stale, missing)
        };

        for cleaner in stale {
            info!(
                "Removing cleaner for bucket '{}' (running: {})",
                cleaner.bucket,
                cleaner.is_running()
            );
            cleaner.stop().await;
        }
        for bucket in missing {
            debug!("Discovered bucket '{}'", bucket);
            let cleaner = PerBucketCleaner::start(Arc::clone(self), bucket.clone());
            self.cleaners.lock().insert(bucket, cleaner);
        }
    }

    fn atr_keyspace(&self, bucket: &str) -> Keyspace {
        match &self.config.metadata_collection {
            Some(keyspace) if keyspace.bucket == bucket => keyspace.clone(),
            _ => Keyspace::default_collection(bucket),
        }
    }
}

struct PerBucketCleaner {
    bucket: String,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
    run_count: Arc<AtomicU64>,
}

impl PerBucketCleaner {
    fn start(manager: Arc<ManagerInner>, bucket: String) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let run_count = Arc::new(AtomicU64::new(0));
        let task = BucketSweep {
            keyspace: manager.atr_keyspace(&bucket),
            manager,
            bucket: bucket.clone(),
            run_count: Arc::clone(&run_count),
            stop: stop_rx,
        };
        let handle = tokio::spawn(task.run());
        Self {
            bucket,
            stop,
            handle,
            run_count,
        }
    }

    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            warn!("Cleaner for bucket '{}' did not stop cleanly: {}", self.bucket, e);
        }
    }
}

/// The task behind one [`PerBucketCleaner`].
struct BucketSweep {
    manager: Arc<ManagerInner>,
    bucket: String,
    keyspace: Keyspace,
    run_count: Arc<AtomicU64>,
    stop: watch::Receiver<bool>,
}

impl BucketSweep {
    async fn run(mut self) {
        info!(
            "Cleaner for bucket '{}' started (client {})",
            self.bucket, self.manager.client_uuid
        );
        while !self.stopped() {
            let started = time::Instant::now();
            match self.sweep().await {
                Ok(cleaned) => {
                    self.run_count.fetch_add(1, Ordering::SeqCst);
                    debug!(
                        "Cleaner for bucket '{}' swept in {:?}, {} attempt(s) cleaned",
                        self.bucket,
                        started.elapsed(),
                        cleaned
                    );
                }
                Err(e) => {
                    warn!("Cleaner for bucket '{}' sweep failed: {}", self.bucket, e);
                    // Wait out the window before trying again.
                    self.pause_until(started + self.manager.config.cleanup_window)
                        .await;
                }
            }
        }

        if let Err(e) = self
            .manager
            .client_records
            .remove_client_record(&self.bucket, &self.manager.client_uuid)
            .await
        {
            warn!(
                "Could not remove client {} from bucket '{}': {}",
                self.manager.client_uuid, self.bucket, e
            );
        }
        info!("Cleaner for bucket '{}' stopped", self.bucket);
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow() || self.stop.has_changed().is_err()
    }

    /// Sleeps until `deadline`, returning early if told to stop.
    async fn pause_until(&mut self, deadline: time::Instant) {
        tokio::select! {
            _ = time::sleep_until(deadline) => {}
            _ = self.stop.changed() => {}
        }
    }

    /// One pass over this client's share of the bucket's ATRs, paced to take
    /// the cleanup window. Returns how many attempts were cleaned.
    async fn sweep(&mut self) -> Result<usize, KvError> {
        let window = self.manager.config.cleanup_window;
        let details = self
            .manager
            .client_records
            .create_or_update_client_record(
                &self.bucket,
                &self.manager.client_uuid,
                window + CLIENT_RECORD_SAFETY_MARGIN,
            )
            .await?;
        for expired in &details.expired_client_ids {
            debug!(
                "Removing expired client {} from bucket '{}'",
                expired, self.bucket
            );
            if let Err(e) = self
                .manager
                .client_records
                .remove_client_record(&self.bucket, expired)
                .await
            {
                debug!("Could not remove expired client {}: {}", expired, e);
            }
        }

        let atr_ids = owned_atr_ids(details.index_of_this_client, details.num_active_clients);
        debug!(
            "Client {} is {} of {} in bucket '{}', sweeping {} ATRs",
            self.manager.client_uuid,
            details.index_of_this_client,
            details.num_active_clients,
            self.bucket,
            atr_ids.len()
        );
        let pace = window
            .checked_div(u32::try_from(atr_ids.len()).unwrap_or(u32::MAX))
            .unwrap_or(window);

        let mut cleaned = 0;
        for atr_id in atr_ids {
            if self.stopped() {
                break;
            }
            let started = time::Instant::now();
            let atr = AtrRef::new(&self.keyspace, atr_id.as_str());
            cleaned += self.clean_atr(&atr).await;
            self.pause_until(started + pace).await;
        }
        Ok(cleaned)
    }

    async fn clean_atr(&self, atr: &AtrRef) -> usize {
        let entries = match self.manager.atrs.lookup_entries(atr).await {
            Ok(entries) => entries,
            Err(KvError::DocumentNotFound) => return 0,
            Err(e) => {
                debug!("Could not read {}: {}", atr, e);
                return 0;
            }
        };

        let mut cleaned = 0;
        for entry in entries.iter().filter(|e| e.is_expired()) {
            let outcome: Result<_, AttemptError> = async {
                let request = CleanupRequest::from_atr_entry(atr, entry)?;
                info!(
                    "Found lost attempt {} ({}, {}ms old) in {}",
                    entry.attempt_id,
                    entry.state,
                    entry.age_ms(),
                    atr
                );
                self.manager.cleaner.process(&request).await
            }
            .await;
            match outcome {
                Ok(_) => cleaned += 1,
                Err(e) => warn!(
                    "Could not clean lost attempt {} in {}: {}",
                    entry.attempt_id, atr, e
                ),
            }
        }
        cleaned
    }
}

/// The ATRs a client handles when it is `index` of `active` clients.
fn owned_atr_ids(index: usize, active: usize) -> Vec<&'static String> {
    let active = active.max(1);
    atr_ids::all_atr_ids()
        .iter()
        .enumerate()
        .filter(|(i, _)| i % active == index)
        .map(|(_, id)| id)
        .collect()
}
