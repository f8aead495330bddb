//! Logging bootstrap for binaries and tests embedding the ledger.
//!
//! The library itself only emits through the `log` facade and `tracing`
//! spans; installing a subscriber is left to the application. [`init`] is a
//! convenience that installs a `tracing-subscriber` fmt subscriber which also
//! captures `log` records.

/// Install a global fmt subscriber at `level` (`error` .. `trace`)
///
/// Returns `false` when a subscriber was already installed, the level is not
/// recognized, or the `tracing` feature is disabled.
#[cfg(feature = "tracing")]
pub fn init(level: &str) -> bool {
    let Ok(level) = level.parse::<tracing::Level>() else {
        return false;
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(not(feature = "tracing"))]
pub fn init(_level: &str) -> bool {
    false
}
