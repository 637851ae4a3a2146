use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber driven by `RUST_LOG`.
///
/// Falls back to `default_filter` when `RUST_LOG` is unset. Calling this more
/// than once (or after the host installed its own subscriber) is a no-op.
pub fn init_tracing(default_filter: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
