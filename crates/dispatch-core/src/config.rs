//! Dispatch-loop configuration: tick cadence, ingress backpressure,
//! autoretry policy and the transport worker pool width. Mirrors the
//! original's `settings.py` constants, grounded on the teacher's
//! [`crate::rn_lifecycle`]-adjacent `OrchestratorConfig` pattern (a plain
//! `Duration`-bearing config struct with a `Default` impl, not a
//! builder).

use std::time::Duration;

use crate::ingress::DEFAULT_INGRESS_CAPACITY;
use crate::transport::DEFAULT_CONCURRENCY;

/// Top-level knobs for [`crate::loop_driver::run_dispatch_loop`].
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Interval between scheduling ticks (original `MASTER_UPDATE_INTERVAL`).
    pub tick_interval: Duration,
    /// Bounded ingress queue capacity before producers block.
    pub ingress_capacity: usize,
    /// Concurrent in-flight assignment POSTs.
    pub transport_concurrency: usize,
    /// Retries a failed command gets before it is left FAILED
    /// (`MAX_RETRY_CMD_COUNT`, 0 disables autoretry).
    pub max_retry_cmd_count: u32,
    /// Delay before a timed-out/errored command is retried
    /// (`DELAY_BEFORE_AUTORETRY`).
    pub delay_before_autoretry: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            ingress_capacity: DEFAULT_INGRESS_CAPACITY,
            transport_concurrency: DEFAULT_CONCURRENCY,
            max_retry_cmd_count: 0,
            delay_before_autoretry: Duration::from_secs(20),
        }
    }
}
