use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

/// Install the stderr subscriber once per process.
///
/// `verbose` raises the default filter to `debug`; an explicit
/// `DRACTL_LOG`/`RUST_LOG` still wins.
pub fn init_tracing(verbose: bool) {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let directive = crate::clienv::log_filter();
        let directive = if verbose && directive == crate::clienv::DEFAULT_LOG_FILTER {
            "debug".to_string()
        } else {
            directive
        };
        let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .try_init()
            .ok();
    });
}
