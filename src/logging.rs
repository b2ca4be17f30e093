use std::env;
use tracing_subscriber::{fmt, EnvFilter};

pub fn setup_logging(verbose: bool) {
    // Check for a LOG_LEVEL environment variable, defaulting to INFO
    let log_level = env::var("LOG_LEVEL")
        .unwrap_or_else(|_| if verbose { "debug" } else { "info" }.to_string());

    // Create a custom filter that limits verbose components
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let filter = EnvFilter::new(format!("bluesky_graph_indexer={}", log_level))
            // Reduce noise from third-party libraries
            .add_directive("sqlx=warn".parse().unwrap())
            .add_directive("tungstenite=warn".parse().unwrap())
            .add_directive("reqwest=warn".parse().unwrap());
        if verbose {
            filter
        } else {
            // The per-message paths flood at INFO when the stream is hot
            filter.add_directive("bluesky_graph_indexer::firehose=warn".parse().unwrap())
        }
    });

    // Initialize the subscriber with the filter
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        // Disable unnecessary details to keep logs clean
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();

    tracing::info!("Logging initialized at custom levels");
}
