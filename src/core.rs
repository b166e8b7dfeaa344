//! Core database logic: main API, background flush thread, recovery, and
//! orchestration of WAL, ingest queue, chunks, adaptive index, and store.

use crate::chunk::ColumnarChunk;
use crate::compression::{select_timestamp_codec, select_value_codec};
use crate::error::DbError;
use crate::index::AdaptiveIndex;
use crate::query::scan_chunk;
use crate::queue::IngestQueue;
use crate::store::ChunkStore;
use crate::telemetry::{db_metrics, noop_event_listener, DbEvent, DbEventListener};
use crate::types::{Sample, TagSet, Timestamp};
use crate::wal::WriteAheadLog;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Base directory holding one subdirectory per database.
pub const DEFAULT_BASE_DIR: &str = ".waffledb";

const METADATA_FILE: &str = "metadata.txt";
const KV_SUFFIX: &str = "_string.kv";

/// Commands sent to the background flush thread.
enum FlushCommand {
    Flush {
        ack: Option<mpsc::Sender<Result<(), DbError>>>,
    },
    Shutdown,
}

/// Configuration options for the database engine.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Directory under which each database occupies `<base_dir>/<name>/`.
    pub base_dir: PathBuf,
    /// Interval between automatic ingest-queue drains.
    pub flush_interval: Duration,
    /// Whether sealed chunks are held compressed in memory. A query that
    /// touches a compressed chunk decompresses it once; it then stays raw.
    pub compress_sealed: bool,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn DbEventListener>,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            base_dir: PathBuf::from(DEFAULT_BASE_DIR),
            flush_interval: crate::DEFAULT_FLUSH_INTERVAL,
            compress_sealed: true,
            event_listener: noop_event_listener(),
        }
    }
}

/// Per-metric chunk state shared between the flusher (writer) and query
/// readers. The write lock is held for seals, deletes, and decompression;
/// queries share the read lock.
#[derive(Debug, Default)]
struct ChunkSet {
    active: HashMap<String, ColumnarChunk>,
    sealed: HashMap<String, Vec<ColumnarChunk>>,
}

/// Fingerprint of one stored row, used to deduplicate WAL replay against
/// rows already present in sealed chunks. Tag pairs are canonically sorted
/// so equal tag maps hash identically.
#[derive(Debug, PartialEq, Eq, Hash)]
struct SampleKey {
    metric: String,
    timestamp: Timestamp,
    value_bits: u64,
    tags: Vec<(String, String)>,
}

impl SampleKey {
    fn from_row(metric: &str, timestamp: Timestamp, value: f64, tags: &TagSet) -> Self {
        let mut pairs: Vec<(String, String)> =
            tags.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        pairs.sort();
        SampleKey {
            metric: metric.to_string(),
            timestamp,
            value_bits: value.to_bits(),
            tags: pairs,
        }
    }

    fn of(sample: &Sample) -> Self {
        Self::from_row(&sample.metric, sample.timestamp, sample.value, &sample.tags)
    }
}

/// The embedded time-series database engine.
///
/// Producers call [`write`]/[`write_batch`] from any thread; a dedicated
/// background flusher drains the ingest queue into per-metric chunks;
/// readers run [`query`] and the aggregates concurrently.
///
/// [`write`]: Database::write
/// [`write_batch`]: Database::write_batch
/// [`query`]: Database::query
#[derive(Debug)]
pub struct Database {
    dir: PathBuf,
    wal: Arc<Mutex<WriteAheadLog>>,
    queue: Arc<IngestQueue>,
    chunks: Arc<RwLock<ChunkSet>>,
    metrics: Arc<Mutex<BTreeSet<String>>>,
    index: Arc<AdaptiveIndex>,
    store: Arc<ChunkStore>,
    kv: Arc<Mutex<HashMap<String, String>>>,
    flush_cmd_tx: mpsc::Sender<FlushCommand>,
    flush_handle: Option<JoinHandle<()>>,
    config: DbConfig,
}

impl Database {
    /// Creates (or re-opens) the database `<base>/<name>/` with defaults.
    pub fn create_empty(name: &str) -> Result<Database, DbError> {
        Self::create_empty_with_config(name, DbConfig::default())
    }

    /// Creates (or re-opens) the database `<base>/<name>/`.
    pub fn create_empty_with_config(name: &str, config: DbConfig) -> Result<Database, DbError> {
        let dir = config.base_dir.join(name);
        fs::create_dir_all(&dir)?;
        Self::open_at(dir, config)
    }

    /// Opens an existing database; fails if its directory is absent.
    pub fn load(name: &str) -> Result<Database, DbError> {
        Self::load_with_config(name, DbConfig::default())
    }

    /// Opens an existing database with the given configuration.
    pub fn load_with_config(name: &str, config: DbConfig) -> Result<Database, DbError> {
        let dir = config.base_dir.join(name);
        if !dir.is_dir() {
            return Err(DbError::ConfigError(format!(
                "Database directory {:?} does not exist",
                dir
            )));
        }
        Self::open_at(dir, config)
    }

    fn open_at(dir: PathBuf, config: DbConfig) -> Result<Database, DbError> {
        let events = config.event_listener.clone();
        let store = Arc::new(ChunkStore::open(&dir)?);
        let wal = Arc::new(Mutex::new(WriteAheadLog::open(&dir)?));
        let index = Arc::new(AdaptiveIndex::new());
        let queue = Arc::new(IngestQueue::new());

        // Load metadata and the sealed chunks it records, registering each
        // with the index and collecting row fingerprints for WAL dedup.
        let metadata = read_metadata(&dir, events.as_ref());
        let mut metric_names = metadata.metrics;
        let mut chunk_set = ChunkSet::default();
        let mut fingerprints: HashSet<SampleKey> = HashSet::new();

        for (metric, count) in &metadata.chunk_counts {
            let mut loaded: Vec<ColumnarChunk> = Vec::new();
            for id in 0..*count {
                match store.load_chunk(metric, id) {
                    Ok(Some(chunk)) => loaded.push(chunk),
                    Ok(None) => {
                        events.on_event(DbEvent::ChunkLoadFailed {
                            metric: metric.clone(),
                            chunk_id: id,
                            error: "chunk file missing".to_string(),
                        });
                        db_metrics::record_chunk_load_failure();
                    }
                    Err(e) => {
                        events.on_event(DbEvent::ChunkLoadFailed {
                            metric: metric.clone(),
                            chunk_id: id,
                            error: e.to_string(),
                        });
                        db_metrics::record_chunk_load_failure();
                    }
                }
            }
            for (pos, chunk) in loaded.iter().enumerate() {
                index.add_chunk(
                    pos as u64,
                    metric,
                    chunk.min_timestamp(),
                    chunk.max_timestamp(),
                    chunk.tag_presence(),
                );
                let timestamps = chunk.timestamps();
                let values = chunk.values();
                let tags = chunk.tags();
                for i in 0..chunk.len() {
                    fingerprints.insert(SampleKey::from_row(
                        metric,
                        timestamps[i],
                        values[i],
                        &tags[i],
                    ));
                }
            }
            if !loaded.is_empty() {
                metric_names.insert(metric.clone());
                if config.compress_sealed {
                    for chunk in &mut loaded {
                        chunk.compress();
                    }
                }
                chunk_set.sealed.insert(metric.clone(), loaded);
            }
        }

        // Replay the WAL unconditionally. Rows already present in sealed
        // chunks are dropped; survivors go straight onto the ingest queue
        // (they are already durable in the log, so no re-append). The log
        // itself is cleared only at clean close, once everything in it has
        // been sealed to disk.
        {
            let mut wal_guard = wal.lock()?;
            let recovered = wal_guard.recover();
            if let Some(offset) = recovered.truncated_at {
                events.on_event(DbEvent::WalRecoveryTruncated { offset });
            }
            let total = recovered.samples.len();
            let mut kept = 0usize;
            for sample in recovered.samples {
                if fingerprints.contains(&SampleKey::of(&sample)) {
                    continue;
                }
                metric_names.insert(sample.metric.clone());
                queue.push(sample);
                kept += 1;
            }
            if total > 0 {
                events.on_event(DbEvent::WalReplayed {
                    recovered: total,
                    deduplicated: total - kept,
                });
            }
        }

        let kv = Arc::new(Mutex::new(load_kv_files(&dir)?));
        let metrics = Arc::new(Mutex::new(metric_names));
        let chunks = Arc::new(RwLock::new(chunk_set));

        // Spawn the background flush thread.
        let (flush_cmd_tx, flush_cmd_rx) = mpsc::channel::<FlushCommand>();
        let queue_clone = Arc::clone(&queue);
        let chunks_clone = Arc::clone(&chunks);
        let wal_clone = Arc::clone(&wal);
        let index_clone = Arc::clone(&index);
        let store_clone = Arc::clone(&store);
        let metrics_clone = Arc::clone(&metrics);
        let events_clone = events.clone();
        let dir_clone = dir.clone();
        let flush_interval = config.flush_interval;
        let compress_sealed = config.compress_sealed;

        let flush_handle = thread::spawn(move || {
            events_clone.on_event(DbEvent::FlushThreadStarted);

            let do_flush = |ack: Option<mpsc::Sender<Result<(), DbError>>>| -> bool {
                let result = flush_cycle(
                    &queue_clone,
                    &chunks_clone,
                    &wal_clone,
                    &index_clone,
                    &store_clone,
                    compress_sealed,
                    events_clone.as_ref(),
                );
                let keep_running = !matches!(result, Err(DbError::LockError(_)));
                if let Some(ack) = ack {
                    let _ = ack.send(result);
                }
                keep_running
            };

            loop {
                match flush_cmd_rx.recv_timeout(flush_interval) {
                    Ok(FlushCommand::Flush { ack }) => {
                        if !do_flush(ack) {
                            break;
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if !do_flush(None) {
                            break;
                        }
                    }
                    Ok(FlushCommand::Shutdown) => {
                        // Final drain, seal everything with samples in it,
                        // record the layout, then retire the WAL.
                        let _ = flush_cycle(
                            &queue_clone,
                            &chunks_clone,
                            &wal_clone,
                            &index_clone,
                            &store_clone,
                            compress_sealed,
                            events_clone.as_ref(),
                        );
                        if let Ok(mut chunk_guard) = chunks_clone.write() {
                            let metric_list: Vec<String> =
                                chunk_guard.active.keys().cloned().collect();
                            for metric in metric_list {
                                seal_active(
                                    &mut chunk_guard,
                                    &metric,
                                    &index_clone,
                                    &store_clone,
                                    compress_sealed,
                                    events_clone.as_ref(),
                                );
                            }
                            if let Ok(metrics_guard) = metrics_clone.lock() {
                                let _ = write_metadata(
                                    &dir_clone,
                                    &metrics_guard,
                                    &chunk_guard.sealed,
                                );
                            }
                        }
                        if let Ok(mut wal_guard) = wal_clone.lock() {
                            if let Err(e) = wal_guard.clear() {
                                events_clone.on_event(DbEvent::WalCheckpointFailed {
                                    error: e.to_string(),
                                });
                            }
                        }
                        events_clone.on_event(DbEvent::FlushThreadStopping);
                        break;
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        events_clone.on_event(DbEvent::FlushThreadStopping);
                        break;
                    }
                }
            }
        });

        Ok(Database {
            dir,
            wal,
            queue,
            chunks,
            metrics,
            index,
            store,
            kv,
            flush_cmd_tx,
            flush_handle: Some(flush_handle),
            config,
        })
    }

    /// Durably appends one sample and stages it for ingestion.
    ///
    /// Returns only after the sample is in the WAL file; visibility to
    /// queries follows the next flush cycle. An `Err` from the WAL append
    /// means the durability contract is broken and the engine should be
    /// abandoned.
    pub fn write(&self, sample: Sample) -> Result<(), DbError> {
        {
            let mut wal_guard = self.wal.lock()?;
            wal_guard.append(&sample)?;
        }
        self.metrics.lock()?.insert(sample.metric.clone());
        self.queue.push(sample);
        db_metrics::record_ingest_points(1);
        Ok(())
    }

    /// Durably appends a batch; durability is per-sample, in order.
    pub fn write_batch(&self, samples: Vec<Sample>) -> Result<(), DbError> {
        if samples.is_empty() {
            return Ok(());
        }
        {
            let mut wal_guard = self.wal.lock()?;
            wal_guard.append_batch(&samples)?;
        }
        {
            let mut metrics_guard = self.metrics.lock()?;
            for sample in &samples {
                metrics_guard.insert(sample.metric.clone());
            }
        }
        let count = samples.len() as u64;
        for sample in samples {
            self.queue.push(sample);
        }
        db_metrics::record_ingest_points(count);
        Ok(())
    }

    /// All samples of `metric` with `timestamp in [start, end]` whose tags
    /// are a superset of `tags`, sorted by timestamp. Unknown metrics yield
    /// an empty result.
    pub fn query(
        &self,
        metric: &str,
        start: Timestamp,
        end: Timestamp,
        tags: &TagSet,
    ) -> Result<Vec<Sample>, DbError> {
        // Fast path: everything raw, scan under the shared read lock. The
        // index is only consulted while a chunks lock is held, so sealing
        // cannot slip chunks past the candidate list.
        {
            let chunk_guard = self.chunks.read()?;
            let ids = self.index.find_chunks(metric, start, end, tags);
            if !candidates_compressed(&chunk_guard, metric, &ids) {
                return Ok(run_query(&chunk_guard, metric, start, end, tags, &ids));
            }
        }

        // Slow path: a candidate is still compressed. Re-resolve under the
        // write lock, restore its columns once, and scan there.
        let mut chunk_guard = self.chunks.write()?;
        let ids = self.index.find_chunks(metric, start, end, tags);
        decompress_candidates(&mut chunk_guard, metric, &ids)?;
        Ok(run_query(&chunk_guard, metric, start, end, tags, &ids))
    }

    /// Sum of matching values; 0 when the range is empty.
    ///
    /// Note: the `tags` parameter is accepted for signature parity but not
    /// applied inside chunks; aggregates cover every sample of the metric in
    /// range. Callers needing tag-filtered aggregates should compose over
    /// [`query`](Database::query) results.
    pub fn sum(
        &self,
        metric: &str,
        start: Timestamp,
        end: Timestamp,
        _tags: &TagSet,
    ) -> Result<f64, DbError> {
        Ok(self
            .aggregate_range(metric, start, end)?
            .map(|a| a.sum)
            .unwrap_or(0.0))
    }

    /// Mean of matching values; 0 when the range is empty. Tag filters are
    /// not applied inside chunks (see [`sum`](Database::sum)).
    pub fn avg(
        &self,
        metric: &str,
        start: Timestamp,
        end: Timestamp,
        _tags: &TagSet,
    ) -> Result<f64, DbError> {
        Ok(self
            .aggregate_range(metric, start, end)?
            .map(|a| a.sum / a.count as f64)
            .unwrap_or(0.0))
    }

    /// Minimum matching value; 0 when the range is empty. Tag filters are
    /// not applied inside chunks (see [`sum`](Database::sum)).
    pub fn min(
        &self,
        metric: &str,
        start: Timestamp,
        end: Timestamp,
        _tags: &TagSet,
    ) -> Result<f64, DbError> {
        Ok(self
            .aggregate_range(metric, start, end)?
            .map(|a| a.min)
            .unwrap_or(0.0))
    }

    /// Maximum matching value; 0 when the range is empty. Tag filters are
    /// not applied inside chunks (see [`sum`](Database::sum)).
    pub fn max(
        &self,
        metric: &str,
        start: Timestamp,
        end: Timestamp,
        _tags: &TagSet,
    ) -> Result<f64, DbError> {
        Ok(self
            .aggregate_range(metric, start, end)?
            .map(|a| a.max)
            .unwrap_or(0.0))
    }

    fn aggregate_range(
        &self,
        metric: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Option<RangeAggregate>, DbError> {
        {
            let chunk_guard = self.chunks.read()?;
            let ids = self.index.find_chunks(metric, start, end, &TagSet::new());
            if !candidates_compressed(&chunk_guard, metric, &ids) {
                return Ok(run_aggregate(&chunk_guard, metric, start, end, &ids));
            }
        }
        let mut chunk_guard = self.chunks.write()?;
        let ids = self.index.find_chunks(metric, start, end, &TagSet::new());
        decompress_candidates(&mut chunk_guard, metric, &ids)?;
        Ok(run_aggregate(&chunk_guard, metric, start, end, &ids))
    }

    /// Snapshot of the known metric names.
    pub fn get_metrics(&self) -> Result<Vec<String>, DbError> {
        Ok(self.metrics.lock()?.iter().cloned().collect())
    }

    /// Removes all in-memory and on-disk state for `metric`. Unknown
    /// metrics are a no-op.
    pub fn delete_metric(&self, metric: &str) -> Result<(), DbError> {
        let mut chunk_guard = self.chunks.write()?;
        chunk_guard.active.remove(metric);
        chunk_guard.sealed.remove(metric);
        self.index.remove_metric(metric);
        self.store.delete_chunks(metric)?;
        let mut metrics_guard = self.metrics.lock()?;
        metrics_guard.remove(metric);
        write_metadata(&self.dir, &metrics_guard, &chunk_guard.sealed)?;
        Ok(())
    }

    /// Triggers an immediate drain of the ingest queue and waits for it.
    /// After `flush` returns, everything previously written is visible to
    /// queries.
    pub fn flush(&self) -> Result<(), DbError> {
        let (tx, rx) = mpsc::channel();
        self.flush_cmd_tx
            .send(FlushCommand::Flush { ack: Some(tx) })
            .map_err(|e| {
                DbError::BackgroundTaskError(format!("Failed to send flush command: {}", e))
            })?;
        rx.recv().map_err(|e| {
            DbError::BackgroundTaskError(format!("Failed to receive flush ack: {}", e))
        })?
    }

    /// Stores a key-value pair as `<key>_string.kv` under the database
    /// directory and in memory.
    pub fn set_key_value(&self, key: &str, value: &str) -> Result<(), DbError> {
        let path = self.dir.join(format!("{}{}", key, KV_SUFFIX));
        fs::write(&path, value)?;
        self.kv.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Looks up a key-value pair loaded at open or stored since.
    pub fn get_key_value(&self, key: &str) -> Result<Option<String>, DbError> {
        Ok(self.kv.lock()?.get(key).cloned())
    }

    /// The directory this database occupies.
    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Returns a reference to the configuration in effect.
    pub fn get_config(&self) -> &DbConfig {
        &self.config
    }

    /// Shuts down cleanly, then erases the database directory tree.
    pub fn destroy(mut self) -> Result<(), DbError> {
        self.shutdown_flusher();
        if let Ok(mut wal_guard) = self.wal.lock() {
            let _ = wal_guard.close();
        }
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    fn shutdown_flusher(&mut self) {
        let _ = self.flush_cmd_tx.send(FlushCommand::Shutdown);
        if let Some(handle) = self.flush_handle.take() {
            if handle.join().is_err() {
                self.config
                    .event_listener
                    .on_event(DbEvent::FlushThreadPanicked);
            }
        }
    }
}

/// Clean close: drain, seal, persist metadata, clear the WAL.
impl Drop for Database {
    fn drop(&mut self) {
        self.shutdown_flusher();
    }
}

#[derive(Debug, Clone, Copy)]
struct RangeAggregate {
    count: usize,
    sum: f64,
    min: f64,
    max: f64,
}

/// One flusher pass: drain the queue, install per metric (sealing full
/// chunks), then checkpoint the WAL.
fn flush_cycle(
    queue: &IngestQueue,
    chunks: &RwLock<ChunkSet>,
    wal: &Mutex<WriteAheadLog>,
    index: &AdaptiveIndex,
    store: &ChunkStore,
    compress_sealed: bool,
    events: &dyn DbEventListener,
) -> Result<(), DbError> {
    let start = Instant::now();

    let mut drained: Vec<Sample> = Vec::new();
    while let Some(sample) = queue.pop() {
        drained.push(sample);
    }
    let points = drained.len() as u64;

    if !drained.is_empty() {
        let mut by_metric: HashMap<String, Vec<Sample>> = HashMap::new();
        for sample in drained {
            by_metric.entry(sample.metric.clone()).or_default().push(sample);
        }

        let mut chunk_guard = chunks.write()?;
        for (metric, samples) in by_metric {
            for sample in samples {
                let full = chunk_guard
                    .active
                    .get(&metric)
                    .map(|c| !c.can_append())
                    .unwrap_or(false);
                if full {
                    seal_active(&mut chunk_guard, &metric, index, store, compress_sealed, events);
                }
                let active = chunk_guard
                    .active
                    .entry(metric.clone())
                    .or_insert_with(ColumnarChunk::new);
                active.append(sample.timestamp, sample.value, sample.tags)?;
            }
        }
    }

    {
        let mut wal_guard = wal.lock()?;
        if let Err(e) = wal_guard.checkpoint() {
            events.on_event(DbEvent::WalCheckpointFailed {
                error: e.to_string(),
            });
        }
    }

    db_metrics::record_flush(start.elapsed(), points);
    Ok(())
}

/// Seals the active chunk of `metric`: persists it at the next id,
/// registers it with the index (tag presence computed from its tag column),
/// optionally compresses it, and appends it to the sealed list.
fn seal_active(
    chunk_set: &mut ChunkSet,
    metric: &str,
    index: &AdaptiveIndex,
    store: &ChunkStore,
    compress_sealed: bool,
    events: &dyn DbEventListener,
) {
    let Some(mut chunk) = chunk_set.active.remove(metric) else {
        return;
    };
    if chunk.is_empty() {
        return;
    }

    let sealed_list = chunk_set.sealed.entry(metric.to_string()).or_default();
    let chunk_id = sealed_list.len() as u64;

    if let Err(e) = store.save_chunk(metric, chunk_id, &chunk) {
        // The chunk stays queryable in memory; the gap surfaces as a load
        // failure on the next open.
        events.on_event(DbEvent::ChunkPersistFailed {
            metric: metric.to_string(),
            chunk_id,
            error: e.to_string(),
        });
    }

    index.add_chunk(
        chunk_id,
        metric,
        chunk.min_timestamp(),
        chunk.max_timestamp(),
        chunk.tag_presence(),
    );
    events.on_event(DbEvent::ChunkSealed {
        metric: metric.to_string(),
        chunk_id,
        points: chunk.len(),
        timestamp_codec: select_timestamp_codec(chunk.timestamps()).name(),
        value_codec: select_value_codec(chunk.values()).name(),
    });
    db_metrics::record_chunk_sealed();

    if compress_sealed {
        chunk.compress();
    }
    sealed_list.push(chunk);
}

fn candidates_compressed(chunk_set: &ChunkSet, metric: &str, ids: &[u64]) -> bool {
    chunk_set
        .sealed
        .get(metric)
        .map(|sealed| {
            ids.iter().any(|&id| {
                sealed
                    .get(id as usize)
                    .map(|c| c.is_compressed())
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

fn decompress_candidates(
    chunk_set: &mut ChunkSet,
    metric: &str,
    ids: &[u64],
) -> Result<(), DbError> {
    if let Some(sealed) = chunk_set.sealed.get_mut(metric) {
        for &id in ids {
            if let Some(chunk) = sealed.get_mut(id as usize) {
                chunk.decompress()?;
            }
        }
    }
    Ok(())
}

fn run_query(
    chunk_set: &ChunkSet,
    metric: &str,
    start: Timestamp,
    end: Timestamp,
    tags: &TagSet,
    sealed_ids: &[u64],
) -> Vec<Sample> {
    let mut results = Vec::new();

    if let Some(active) = chunk_set.active.get(metric) {
        if !active.is_empty() && active.min_timestamp() <= end && active.max_timestamp() >= start {
            results.extend(scan_chunk(active, metric, start, end, tags));
        }
    }
    if let Some(sealed) = chunk_set.sealed.get(metric) {
        for &id in sealed_ids {
            if let Some(chunk) = sealed.get(id as usize) {
                results.extend(scan_chunk(chunk, metric, start, end, tags));
            }
        }
    }

    results.sort_by_key(|s| s.timestamp);
    results
}

fn run_aggregate(
    chunk_set: &ChunkSet,
    metric: &str,
    start: Timestamp,
    end: Timestamp,
    sealed_ids: &[u64],
) -> Option<RangeAggregate> {
    let mut agg: Option<RangeAggregate> = None;
    let mut visit = |chunk: &ColumnarChunk| {
        let range = chunk.query_time_range(start, end);
        if range.is_empty() {
            return;
        }
        let entry = agg.get_or_insert(RangeAggregate {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        });
        entry.count += range.len();
        entry.sum += chunk.sum(start, end);
        entry.min = entry.min.min(chunk.min(start, end));
        entry.max = entry.max.max(chunk.max(start, end));
    };

    if let Some(active) = chunk_set.active.get(metric) {
        if !active.is_empty() {
            visit(active);
        }
    }
    if let Some(sealed) = chunk_set.sealed.get(metric) {
        for &id in sealed_ids {
            if let Some(chunk) = sealed.get(id as usize) {
                visit(chunk);
            }
        }
    }
    agg
}

#[derive(Debug, Default)]
struct Metadata {
    metrics: BTreeSet<String>,
    chunk_counts: Vec<(String, u64)>,
}

/// Parses `metadata.txt` best-effort: a malformed header yields an empty
/// layout, and individual malformed lines are skipped with a diagnostic.
fn read_metadata(dir: &Path, events: &dyn DbEventListener) -> Metadata {
    let mut metadata = Metadata::default();
    let text = match fs::read_to_string(dir.join(METADATA_FILE)) {
        Ok(text) => text,
        Err(_) => return metadata,
    };

    let mut lines = text.lines();
    let metric_count = match lines
        .next()
        .and_then(|l| l.strip_prefix("metrics:"))
        .and_then(|n| n.trim().parse::<usize>().ok())
    {
        Some(n) => n,
        None => {
            events.on_event(DbEvent::MetadataLineSkipped {
                line: "missing metrics header".to_string(),
            });
            return metadata;
        }
    };

    for _ in 0..metric_count {
        match lines.next() {
            Some(name) if !name.is_empty() => {
                metadata.metrics.insert(name.to_string());
            }
            Some(_) | None => break,
        }
    }

    match lines.next() {
        Some("chunks:") => {}
        Some(other) => {
            events.on_event(DbEvent::MetadataLineSkipped {
                line: other.to_string(),
            });
            return metadata;
        }
        None => return metadata,
    }

    for line in lines {
        if line.is_empty() {
            continue;
        }
        // Metric names may contain ':'; the count is after the last one.
        match line.rsplit_once(':') {
            Some((metric, count)) => match count.parse::<u64>() {
                Ok(count) => metadata.chunk_counts.push((metric.to_string(), count)),
                Err(_) => events.on_event(DbEvent::MetadataLineSkipped {
                    line: line.to_string(),
                }),
            },
            None => events.on_event(DbEvent::MetadataLineSkipped {
                line: line.to_string(),
            }),
        }
    }

    metadata
}

/// Writes `metadata.txt`: `metrics:<N>` header, one metric name per line,
/// a literal `chunks:` line, then `<metric>:<chunk_count>` for metrics with
/// persisted chunks.
fn write_metadata(
    dir: &Path,
    metrics: &BTreeSet<String>,
    sealed: &HashMap<String, Vec<ColumnarChunk>>,
) -> Result<(), DbError> {
    let mut out = String::new();
    out.push_str(&format!("metrics:{}\n", metrics.len()));
    for metric in metrics {
        out.push_str(metric);
        out.push('\n');
    }
    out.push_str("chunks:\n");

    let mut counts: Vec<(&String, usize)> = sealed
        .iter()
        .filter(|(_, chunks)| !chunks.is_empty())
        .map(|(metric, chunks)| (metric, chunks.len()))
        .collect();
    counts.sort();
    for (metric, count) in counts {
        out.push_str(&format!("{}:{}\n", metric, count));
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(dir.join(METADATA_FILE))
        .map_err(DbError::Io)?;
    file.write_all(out.as_bytes())?;
    file.sync_data()?;
    Ok(())
}

fn load_kv_files(dir: &Path) -> Result<HashMap<String, String>, DbError> {
    let mut kv = HashMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(key) = name.strip_suffix(KV_SUFFIX) {
            if let Ok(value) = fs::read_to_string(entry.path()) {
                kv.insert(key.to_string(), value);
            }
        }
    }
    Ok(kv)
}
