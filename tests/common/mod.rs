//! Helpers shared by the integration tests

use std::sync::Once;
use std::time::Duration;

use async_ops::SchedulerConfig;
use tracing_subscriber::EnvFilter;


/// Route `tracing` output to the test harness, once per test binary
///
/// The verbosity is controlled through `RUST_LOG`, and defaults to warnings.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}


/// Scheduler configuration with small thread counts and short timeouts
pub fn test_config(prefix: &str) -> SchedulerConfig {
    SchedulerConfig::default()
        .with_thread_name_prefix(prefix)
        .with_max_threads(4)
        .with_event_loop_threads(2)
        .with_grace_period(Duration::from_millis(200))
        .with_hard_timeout(Duration::from_secs(2))
}
