//! Shared test support for the scenario tests.

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Installs the tracing subscriber once per test binary. `RUST_LOG` wins when
/// set; otherwise keep the crate's own pipeline/scheduler output at debug and
/// leave dependencies quiet.
#[ctor::ctor]
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mailroom=debug"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    // Another binary in the same process may have installed one already.
    let _ = tracing::subscriber::set_global_default(subscriber);
}
