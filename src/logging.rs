//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events. Binaries and tests that want to
//! see them call [`init_tracing`] once; further calls are ignored.

use tracing::Level;

/// Installs a formatting subscriber that prints events up to `level`.
///
/// Returns false if a global subscriber was already installed.
pub fn init_tracing(level: Level) -> bool {
  tracing_subscriber::fmt()
    .with_max_level(level)
    .with_target(true)
    .try_init()
    .is_ok()
}
