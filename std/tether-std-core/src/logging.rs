//!
//! Logging Setup
//!
//! The runtime reports through `tracing`. Embedders that already install a
//! subscriber keep theirs; otherwise `init_logging` installs a plain fmt
//! subscriber on stderr so stdout stays free for program output.
//!

use std::str::FromStr;

use tracing_subscriber::filter::LevelFilter;

use crate::config::LoggingConfig;

/// Parse a level name ("off", "error", "warn", "info", "debug", "trace").
pub fn parse_level(level: &str) -> Option<LevelFilter> {
    LevelFilter::from_str(level.trim()).ok()
}

/// Install the global subscriber. Returns false when one was already set.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let parsed = parse_level(&config.level);
    let installed = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(config.ansi)
        .with_max_level(parsed.unwrap_or(LevelFilter::WARN))
        .with_thread_names(true)
        .try_init()
        .is_ok();
    if parsed.is_none() {
        tracing::warn!(level = %config.level, "unknown log level, using warn");
    }
    installed
}
