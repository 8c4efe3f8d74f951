use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` overrides `level`; output goes
/// to stderr so command output on stdout stays machine-readable.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
