//! Log sink wiring.
//!
//! The configuration's `log_mode` maps onto a `tracing` subscriber: the
//! leveled modes filter to stderr, `screen` duplicates informational output
//! onto stdout, and `disabled` installs nothing. Integrity warnings from
//! the anti-tampering layer arrive here as `warn` events and are never
//! visible through operation return values.

use tracing_subscriber::filter::LevelFilter;

use crate::config::LogMode;

/// Installs the global subscriber for `mode`.
///
/// Safe to call more than once; only the first installation wins (relevant
/// for tests, which may race to initialize).
pub fn init(mode: LogMode) {
    let (level, to_stdout) = match mode {
        LogMode::Disabled => return,
        LogMode::Screen => (LevelFilter::INFO, true),
        LogMode::Error => (LevelFilter::ERROR, false),
        LogMode::Warn => (LevelFilter::WARN, false),
        LogMode::Info => (LevelFilter::INFO, false),
        LogMode::Debug => (LevelFilter::DEBUG, false),
    };

    let builder = tracing_subscriber::fmt().with_max_level(level).with_target(false);
    let result = if to_stdout {
        builder.with_writer(std::io::stdout).try_init()
    } else {
        builder.with_writer(std::io::stderr).try_init()
    };
    if result.is_err() {
        tracing::debug!("log subscriber already installed");
    }
}
