use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Diagnostics go to stderr so the pass
/// summaries on stdout stay machine-readable.
///
/// `RUST_LOG` takes precedence; otherwise `info`, or `debug` with
/// `--verbose`.
pub fn init(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // A second init (tests driving several commands) is a no-op.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
