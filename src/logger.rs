//! Process-wide logging bootstrap. Initialization is idempotent: the first
//! caller installs the logger and every later call is a no-op, so each test
//! can call [`setup`] without coordination.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs an `env_logger` honoring `RUST_LOG`, quiet (errors only) when
/// the variable is unset. Timestamps carry milliseconds so traces from
/// several peers in one process can be interleaved meaningfully.
pub fn setup() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("error"))
            .format_timestamp_millis()
            .init();
    });
}
