use std::sync::Arc;

#[cfg(feature = "prometheus")]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "prometheus")]
use std::sync::Mutex;
#[cfg(feature = "prometheus")]
use std::thread::JoinHandle;

/// Structured, in-process event hook for observability.
///
/// This crate is a library; emitting diagnostics directly (e.g. `eprintln!`)
/// is not acceptable for production. Callers provide an implementation that
/// forwards these events to `tracing`, `log`, metrics, or custom sinks.
pub trait DbEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: DbEvent);
}

/// Structured events emitted by the engine.
#[derive(Debug, Clone)]
pub enum DbEvent {
    FlushThreadStarted,
    FlushThreadStopping,
    FlushThreadPanicked,

    ChunkSealed {
        metric: String,
        chunk_id: u64,
        points: usize,
        timestamp_codec: &'static str,
        value_codec: &'static str,
    },
    ChunkPersistFailed {
        metric: String,
        chunk_id: u64,
        error: String,
    },
    ChunkLoadFailed {
        metric: String,
        chunk_id: u64,
        error: String,
    },

    WalCheckpointFailed {
        error: String,
    },
    WalRecoveryTruncated {
        offset: u64,
    },
    WalReplayed {
        recovered: usize,
        deduplicated: usize,
    },

    MetadataLineSkipped {
        line: String,
    },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl DbEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: DbEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn DbEventListener> {
    Arc::new(NoopEventListener)
}

/// Metrics instrumentation and in-process scraping.
///
/// ## Key properties
/// - Library-safe: emitting metrics is effectively a no-op until a recorder
///   is installed.
/// - Serverless scraping: callers can render Prometheus exposition text
///   in-process (behind the `prometheus` feature).
pub mod db_metrics {
    #[cfg(feature = "prometheus")]
    use super::*;

    #[cfg(feature = "prometheus")]
    use ::metrics::{describe_counter, describe_histogram, Unit};
    use std::time::Duration;

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

    // --- metric names ---
    //
    // Counters are exposed as `<name>_total` by the Prometheus exporter.

    pub const INGEST_POINTS: &str = "waffledb_ingest_points";
    pub const FLUSH_POINTS: &str = "waffledb_flush_points";
    pub const FLUSH_DURATION_SECONDS: &str = "waffledb_flush_duration_seconds";
    pub const WAL_BYTES_WRITTEN: &str = "waffledb_wal_bytes_written";
    pub const CHUNKS_SEALED: &str = "waffledb_chunks_sealed";
    pub const CHUNK_LOAD_FAILURES: &str = "waffledb_chunk_load_failures";

    /// Handle to the in-process Prometheus recorder/scrape renderer.
    ///
    /// This does **not** start an HTTP server. Call
    /// [`InProcessPrometheus::render`] to scrape.
    #[cfg(feature = "prometheus")]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
        stop: Arc<AtomicBool>,
        upkeep_thread: Mutex<Option<JoinHandle<()>>>,
    }

    #[cfg(feature = "prometheus")]
    impl std::fmt::Debug for InProcessPrometheus {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("InProcessPrometheus").finish_non_exhaustive()
        }
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs a global Prometheus recorder (once per process) and
        /// starts a small upkeep thread that keeps histogram internals
        /// bounded.
        pub fn install(upkeep_interval: Duration) -> Result<Self, MetricsInitError> {
            describe_all();

            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let handle_clone = handle.clone();
            let upkeep_thread = std::thread::Builder::new()
                .name("waffledb-metrics-upkeep".to_string())
                .spawn(move || {
                    while !stop_clone.load(Ordering::Relaxed) {
                        std::thread::sleep(upkeep_interval);
                        handle_clone.run_upkeep();
                    }
                })
                .map_err(|e| MetricsInitError::ThreadSpawn(e.to_string()))?;

            Ok(Self {
                handle,
                stop,
                upkeep_thread: Mutex::new(Some(upkeep_thread)),
            })
        }

        /// Renders the current metrics in the Prometheus text exposition
        /// format.
        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    impl Drop for InProcessPrometheus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.upkeep_thread.lock() {
                if let Some(t) = guard.take() {
                    let _ = t.join();
                }
            }
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
        #[error("failed to spawn upkeep thread: {0}")]
        ThreadSpawn(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    #[inline]
    pub fn record_ingest_points(points: u64) {
        if points > 0 {
            ::metrics::counter!(INGEST_POINTS).increment(points);
        }
    }

    #[inline]
    pub fn record_flush(duration: Duration, points: u64) {
        ::metrics::histogram!(FLUSH_DURATION_SECONDS).record(duration.as_secs_f64());
        if points > 0 {
            ::metrics::counter!(FLUSH_POINTS).increment(points);
        }
    }

    #[inline]
    pub fn record_wal_bytes_written(bytes: u64) {
        if bytes > 0 {
            ::metrics::counter!(WAL_BYTES_WRITTEN).increment(bytes);
        }
    }

    #[inline]
    pub fn record_chunk_sealed() {
        ::metrics::counter!(CHUNKS_SEALED).increment(1);
    }

    #[inline]
    pub fn record_chunk_load_failure() {
        ::metrics::counter!(CHUNK_LOAD_FAILURES).increment(1);
    }

    #[cfg(feature = "prometheus")]
    fn describe_all() {
        describe_counter!(
            INGEST_POINTS,
            Unit::Count,
            "Total number of samples accepted by Database::write."
        );
        describe_counter!(
            FLUSH_POINTS,
            Unit::Count,
            "Total number of samples drained from the ingest queue into chunks."
        );
        describe_counter!(
            WAL_BYTES_WRITTEN,
            Unit::Bytes,
            "Logical bytes appended to the write-ahead log."
        );
        describe_counter!(
            CHUNKS_SEALED,
            Unit::Count,
            "Chunks sealed and handed to the chunk store."
        );
        describe_counter!(
            CHUNK_LOAD_FAILURES,
            Unit::Count,
            "Chunk files skipped at open because they failed to deserialize."
        );

        describe_histogram!(
            FLUSH_DURATION_SECONDS,
            Unit::Seconds,
            "Flush processing time in the background flush thread."
        );
    }
}
