//! Logging configuration
//!
//! Structured logging with tracing.

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// Initialize logging with environment-based filtering. The `verbose`
/// flag lowers this crate's default level to DEBUG; `RUST_LOG` wins
/// when set.
pub fn init(verbose: bool) {
    let default = if verbose {
        "onionup=debug"
    } else {
        "onionup=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
