use tracing_subscriber::EnvFilter;

/// Filter used when neither `RUST_LOG` nor an explicit filter is given
pub const DEFAULT_FILTER: &str = "solbatch=info";

/// Resolve the filter: explicit value, then `RUST_LOG`, then [`DEFAULT_FILTER`]
pub fn env_filter(explicit: Option<&str>) -> EnvFilter {
    match explicit {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    }
}

/// Install the global fmt subscriber. Only the binary calls this.
pub fn init(explicit: Option<&str>) {
    // A second call (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(explicit))
        .with_target(false)
        .try_init();
}
