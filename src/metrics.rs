//metrics.rs
use lazy_static::lazy_static;
use prometheus::{register_counter, register_histogram, Counter, Histogram, HistogramOpts, Opts};

// Define metrics
lazy_static! {
    // Firehose metrics. EVENTS_PROCESSED doubles as the sample source for
    // the adaptive throttle's events-per-second estimate.
    pub static ref EVENTS_PROCESSED: Counter = register_counter!(Opts::new(
        "firehose_events_processed_total",
        "Total number of firehose messages processed"
    ))
    .unwrap();

    pub static ref COMMITS_FAILED: Counter = register_counter!(Opts::new(
        "firehose_commits_failed_total",
        "Total number of messages captured into the failed-message queue"
    ))
    .unwrap();

    pub static ref FAILED_REPLAYS: Counter = register_counter!(Opts::new(
        "failed_message_replays_total",
        "Total number of failed-message replay attempts at startup"
    ))
    .unwrap();

    // Outbound API metrics
    pub static ref API_REQUESTS: Counter = register_counter!(Opts::new(
        "appview_requests_total",
        "Total number of outbound appview requests issued"
    ))
    .unwrap();

    pub static ref API_RETRIES: Counter = register_counter!(Opts::new(
        "appview_retries_total",
        "Total number of outbound requests rescheduled after a failure"
    ))
    .unwrap();

    // Cache metrics
    pub static ref USER_CACHE_HITS: Counter = register_counter!(Opts::new(
        "user_presence_cache_hits_total",
        "Total number of user presence cache hits"
    ))
    .unwrap();

    pub static ref USER_CACHE_MISSES: Counter = register_counter!(Opts::new(
        "user_presence_cache_misses_total",
        "Total number of user presence cache misses"
    ))
    .unwrap();

    pub static ref POST_CACHE_HITS: Counter = register_counter!(Opts::new(
        "post_presence_cache_hits_total",
        "Total number of post presence cache hits"
    ))
    .unwrap();

    pub static ref POST_CACHE_MISSES: Counter = register_counter!(Opts::new(
        "post_presence_cache_misses_total",
        "Total number of post presence cache misses"
    ))
    .unwrap();

    // Batch-specific metrics
    pub static ref BATCH_SIZE: Histogram = register_histogram!(
        HistogramOpts::new(
            "appview_batch_size",
            "Number of keys per batched appview request"
        )
        .buckets(vec![1.0, 2.0, 5.0, 10.0, 15.0, 20.0, 25.0])
    )
    .unwrap();
}
