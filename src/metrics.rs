//! Metrics for chunklog

use iroh_metrics::{
    core::{Core, Counter, Metric},
    struct_iterable::Iterable,
};

/// Enum of metrics for the module
#[allow(missing_docs)]
#[derive(Debug, Clone, Iterable)]
pub struct Metrics {
    pub appends: Counter,
    pub chunks_filled: Counter,
    pub saves: Counter,

    pub uploads_started: Counter,
    pub uploads_completed: Counter,
    pub uploads_failed: Counter,

    pub assignments_sent: Counter,
    pub assignments_received: Counter,
    pub assignments_buffered: Counter,
    pub assignments_applied: Counter,
    pub handle_mismatches: Counter,

    pub chunk_fetches: Counter,
    pub read_cache_hits: Counter,

    pub actor_tick_main: Counter,
    pub actor_tick_inbox: Counter,
    pub actor_tick_log_event: Counter,
    pub actor_tick_bus: Counter,
    pub actor_tick_upload: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            appends: Counter::new("Number of edits appended to the log"),
            chunks_filled: Counter::new("Number of chunks that reached their full size"),
            saves: Counter::new("Number of save calls"),

            uploads_started: Counter::new("Number of chunk uploads started"),
            uploads_completed: Counter::new("Number of chunk uploads that completed"),
            uploads_failed: Counter::new("Number of chunk uploads that failed"),

            assignments_sent: Counter::new("Number of handle assignments broadcast to peers"),
            assignments_received: Counter::new("Number of handle assignments received from peers"),
            assignments_buffered: Counter::new(
                "Number of received assignments buffered for unfilled chunks",
            ),
            assignments_applied: Counter::new("Number of handle assignments applied to chunks"),
            handle_mismatches: Counter::new("Number of conflicting handle assignments observed"),

            chunk_fetches: Counter::new("Number of chunk payloads fetched from the store"),
            read_cache_hits: Counter::new("Number of reads served from a cached chunk"),

            actor_tick_main: Counter::new("Number of times the engine actor loop ticked"),
            actor_tick_inbox: Counter::new(
                "Number of times the engine actor processed an actor message",
            ),
            actor_tick_log_event: Counter::new(
                "Number of times the engine actor processed a log event",
            ),
            actor_tick_bus: Counter::new("Number of times the engine actor processed a bus message"),
            actor_tick_upload: Counter::new(
                "Number of times the engine actor processed a finished upload",
            ),
        }
    }
}

impl Metric for Metrics {
    fn name() -> &'static str {
        "chunklog"
    }
}

/// Init the metrics collection core.
pub fn init_metrics() {
    Core::init(|reg, metrics| {
        metrics.insert(Metrics::new(reg));
    });
}
