//! Telemetry logic.
//! Logging goes through `tracing`, metrics through the `metrics` facade.
use metrics::Unit;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

/// Install the global `tracing` subscriber.
///
/// The filter is read from `RUST_LOG`, `info` when unset or invalid.
/// Events go to stderr so stdout stays usable for command output.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
    if let Err(err) = result {
        eprintln!("tracing subscriber already installed: {err}");
    }

    describe_metrics();
}

/// Register descriptions for every metric the backend records. Recording
/// is a no-op until the embedding application installs a recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "ldap_authentications_total",
        Unit::Count,
        "Authentication attempts by outcome."
    );
    metrics::describe_counter!(
        "ldap_server_failures_total",
        Unit::Count,
        "Directory servers skipped because they were unreachable."
    );
    metrics::describe_histogram!(
        "ldap_authentication_duration_seconds",
        Unit::Seconds,
        "Time spent authenticating, directory and synchronization included."
    );
}
