//! Shared test setup.

use std::sync::Once;

static INIT: Once = Once::new();

/// Install a subscriber once, so `RUST_LOG=rebound=trace` surfaces runtime
/// events while debugging a failing test.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
