//! Shared helpers for the end-to-end tests.

use std::sync::Once;

use tracing_subscriber::filter::LevelFilter;

static INIT_LOGGING: Once = Once::new();

/// Initialize tracing output for tests; safe to call repeatedly.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(LevelFilter::DEBUG)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}
