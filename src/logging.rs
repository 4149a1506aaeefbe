use tracing_subscriber::EnvFilter;

const LOG_FILTER_ENV: &str = "DVD_LOG";

fn resolve_filter(verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_env(LOG_FILTER_ENV) {
        return filter;
    }
    EnvFilter::new(if verbose { "debug" } else { "info" })
}

/// Install the stderr subscriber. Safe to call more than once.
pub fn init(verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(resolve_filter(verbose))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
