//! Logging macros and subscriber bootstrap.
//!
//! The teacher ships `tracing`/`tracing-subscriber` as dependencies but
//! never wires them up — every call site is a raw `eprintln!` behind
//! `info!`/`warn!`/`error!` macros. We keep those macro names (the rest of
//! the crate is written against them) but route them through `tracing`'s
//! macros so a real subscriber, once installed by `init()`, actually
//! receives structured events instead of unconditional stderr writes.

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        tracing::info!($($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        tracing::warn!($($arg)*)
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        tracing::error!($($arg)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

/// Installs a global `fmt` subscriber honoring `RUST_LOG`/`KIRA_SC_LOG`,
/// defaulting to `info`. Idempotent: a second call is a harmless no-op
/// (the underlying `set_global_default` error is swallowed), which matters
/// because both the CLI and tests may want to call this.
pub fn init() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("KIRA_SC_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
