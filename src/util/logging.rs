use tracing_subscriber::{fmt, EnvFilter};

/// Default filter when `RUST_LOG` is unset: everything this crate logs at
/// info, dependencies (reqwest, hyper connection chatter) at warn.
const DEFAULT_DIRECTIVES: &str = "warn,shipquery=info";

/// Initializes tracing/logging based on environment variables.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(false)
        .init();
}
