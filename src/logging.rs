use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "info,keypool=debug";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize tracing with a compact, human-readable stdout layer.
///
/// - Default level: INFO (DEBUG for this crate), override via RUST_LOG env
/// - Safe to call more than once; later calls are ignored
pub fn init() {
    let stdout_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .compact();

    if tracing_subscriber::registry()
        .with(env_filter())
        .with(stdout_layer)
        .try_init()
        .is_ok()
    {
        tracing::debug!("Tracing initialized");
    }
}

/// Same as [`init`] but emits one JSON object per event, for log shippers.
pub fn init_json() {
    let json_layer = fmt::layer()
        .json()
        .with_current_span(false)
        .with_target(true);

    if tracing_subscriber::registry()
        .with(env_filter())
        .with(json_layer)
        .try_init()
        .is_ok()
    {
        tracing::debug!("Tracing initialized (json)");
    }
}
