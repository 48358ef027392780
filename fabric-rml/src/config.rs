//! Runtime-configurable parameters for the transport.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `RML_OFI_`) or by constructing a custom `RmlConfig`.

use crate::fabric::FabricVersion;
use std::time::Duration;

/// Tuning parameters for the fabric transport.
#[derive(Debug, Clone)]
pub struct RmlConfig {
    /// Local deadline for a send to complete.
    pub send_timeout: Duration,

    /// Local deadline for a one-shot receive. `None` disables receive timeouts.
    /// Persistent receives never time out.
    pub recv_timeout: Option<Duration>,

    /// How often `progress()` scans pending operations for expired deadlines.
    pub sweep_interval: Duration,

    /// Maximum completion entries drained per `progress()` call.
    pub cq_batch: usize,

    /// Completion queue depth requested from the provider.
    pub cq_size: usize,

    /// Size of each posted receive buffer (header included).
    pub max_recv_size: usize,

    /// Number of receive buffers kept in the pool.
    pub recv_pool_size: usize,

    /// Preferred providers, in rank order. Empty means "first acceptable".
    pub provider_include: Vec<String>,

    /// Providers never selected.
    pub provider_exclude: Vec<String>,

    /// Queue sends to peers without contact information instead of failing them.
    pub defer_unresolved: bool,

    /// Raise an `Unreachable` exception for a peer whose send timed out.
    pub escalate_timeouts: bool,

    /// Sleep between progress calls while `ping` waits for its probe.
    pub ping_poll_interval: Duration,

    /// Fabric interface version requested during discovery.
    pub fabric_version: FabricVersion,
}

impl Default for RmlConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(30),
            recv_timeout: None,
            sweep_interval: Duration::from_millis(100),
            cq_batch: 64,
            cq_size: 1024,
            max_recv_size: 64 * 1024, // 64 KiB
            recv_pool_size: 64,
            provider_include: Vec::new(),
            provider_exclude: Vec::new(),
            defer_unresolved: true,
            escalate_timeouts: true,
            ping_poll_interval: Duration::from_millis(1),
            fabric_version: FabricVersion::V1_0,
        }
    }
}

impl RmlConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `RML_OFI_SEND_TIMEOUT_MS`
    /// - `RML_OFI_RECV_TIMEOUT_MS`
    /// - `RML_OFI_SWEEP_INTERVAL_MS`
    /// - `RML_OFI_CQ_BATCH`
    /// - `RML_OFI_CQ_SIZE`
    /// - `RML_OFI_MAX_RECV_SIZE`
    /// - `RML_OFI_RECV_POOL_SIZE`
    /// - `RML_OFI_PROVIDER_INCLUDE` (comma separated)
    /// - `RML_OFI_PROVIDER_EXCLUDE` (comma separated)
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(ms) = env_parse::<u64>("RML_OFI_SEND_TIMEOUT_MS") {
            cfg.send_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("RML_OFI_RECV_TIMEOUT_MS") {
            cfg.recv_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = env_parse::<u64>("RML_OFI_SWEEP_INTERVAL_MS") {
            cfg.sweep_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<usize>("RML_OFI_CQ_BATCH") {
            cfg.cq_batch = n.max(1);
        }
        if let Some(n) = env_parse::<usize>("RML_OFI_CQ_SIZE") {
            cfg.cq_size = n.max(1);
        }
        if let Some(n) = env_parse::<usize>("RML_OFI_MAX_RECV_SIZE") {
            cfg.max_recv_size = n;
        }
        if let Some(n) = env_parse::<usize>("RML_OFI_RECV_POOL_SIZE") {
            cfg.recv_pool_size = n;
        }
        if let Ok(v) = std::env::var("RML_OFI_PROVIDER_INCLUDE") {
            cfg.provider_include = split_list(&v);
        }
        if let Ok(v) = std::env::var("RML_OFI_PROVIDER_EXCLUDE") {
            cfg.provider_exclude = split_list(&v);
        }

        cfg
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
