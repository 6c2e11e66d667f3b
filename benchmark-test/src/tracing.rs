//! Log capture for tests.

use tracing_subscriber::EnvFilter;

/// Directives applied when `RUST_LOG` is unset: quiet dependencies, verbose harness.
const DEFAULT_DIRECTIVES: &str = "warn,benchmark=trace,benchmark_test=trace";

/// Routes logs into the output captured by the Rust test runner.
///
/// `RUST_LOG` replaces the default directives, e.g. `RUST_LOG=benchmark::http=debug` to follow
/// only the remote calls. Calling this more than once is harmless, later calls are ignored.
///
/// # Example
///
/// ```
/// benchmark_test::tracing::init();
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_test_writer()
        .without_time()
        .try_init()
        .ok();
}
