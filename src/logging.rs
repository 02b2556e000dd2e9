//! Process-wide logging.
//!
//! `env_logger` is installed once with a fully permissive filter; the
//! effective level is the `log` facade's max-level word, so the config's
//! `logLevel` can be re-applied on hot reload without touching the logger.

use log::LevelFilter;

/// Install the logger and apply the initial level.
pub fn init(level: &str) {
    env_logger::Builder::from_default_env()
        .filter_level(LevelFilter::Trace)
        .init();
    apply_level(level);
}

/// Apply a level string from the config. Unknown levels keep `info`.
pub fn apply_level(level: &str) {
    match parse_level(level) {
        Some(parsed) => log::set_max_level(parsed),
        None => {
            log::set_max_level(LevelFilter::Info);
            log::warn!("Unknown log level {level:?}, defaulting to info");
        }
    }
}

fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.trim().to_lowercase().as_str() {
        "" | "info" => Some(LevelFilter::Info),
        "trace" => Some(LevelFilter::Trace),
        "debug" => Some(LevelFilter::Debug),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "error" => Some(LevelFilter::Error),
        _ => None,
    }
}
