//! `tracing` subscriber setup.
//!
//! Library code only emits events; installing a subscriber is the host's
//! call. Hosts without their own logging setup can use [`init_logging`].

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Install a global `fmt` subscriber configured from `config`.
///
/// `RUST_LOG` takes precedence over `config.level`. Returns `false` if a
/// global subscriber was already installed (by an earlier call or by the
/// host); that is not an error.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_ascii_lowercase()));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    let result = match config.format.as_str() {
        "json" => builder.json().try_init(),
        "compact" => builder.compact().try_init(),
        _ => builder.pretty().try_init(),
    };

    result.is_ok()
}
