// ============================================================================
// File: src/logging.rs
// ----------------------------------------------------------------------------
// env_logger installation for embedding binaries and tests.
// ============================================================================

use log::LevelFilter;

/// Install the process logger at `level`
///
/// `RUST_LOG` still takes precedence when set. Repeated calls are harmless;
/// only the first installation wins.
pub fn init(level: LevelFilter) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).format_timestamp_millis();
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    if builder.try_init().is_err() {
        log::debug!("Logger already installed, keeping existing configuration");
    }
}

/// Logger for unit tests; captured by the test harness
#[cfg(test)]
pub(crate) fn init_test() {
    let _ = env_logger::builder().is_test(true).try_init();
}
