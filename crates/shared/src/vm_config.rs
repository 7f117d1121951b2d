//! Typed product of the guest's configuration sources: the kernel command
//! line and the two host-sent configuration messages
//! (`EarlyConfig`/`InitialConfig`). No on-disk config file is read here — an
//! external collaborator owns that; this module only defines the shape the
//! dispatcher consumes.

use std::fs;
use std::sync::OnceLock;

/// Scans `/proc/cmdline` once for the `WSL_SOCKET_LOG` token, mirroring
/// `SocketChannel::LoggingEnabled()`'s `std::call_once`-gated check.
pub fn socket_logging_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        fs::read_to_string("/proc/cmdline")
            .map(|content| content.contains("WSL_SOCKET_LOG"))
            .unwrap_or(false)
    })
}

/// Accumulated guest configuration, built up from the `EarlyConfig` message
/// (sent before any mounts happen) and the `InitialConfig` message (sent once
/// the guest is otherwise ready).
#[derive(Debug, Clone)]
pub struct GuestConfig {
    pub enable_kernel_perf_tuning: bool,
    pub enable_crash_dump_collection: bool,
    pub page_reporting_order: u8,
    pub memory_reclaim_gradual: bool,
    pub debug_log_payloads: bool,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            enable_kernel_perf_tuning: false,
            enable_crash_dump_collection: false,
            page_reporting_order: 0,
            memory_reclaim_gradual: false,
            debug_log_payloads: socket_logging_enabled(),
        }
    }
}

impl GuestConfig {
    pub fn apply_early_config(&mut self, enable_crash_dump_collection: bool) {
        self.enable_crash_dump_collection = enable_crash_dump_collection;
    }

    pub fn apply_initial_config(
        &mut self,
        enable_kernel_perf_tuning: bool,
        page_reporting_order: u8,
        memory_reclaim_gradual: bool,
    ) {
        self.enable_kernel_perf_tuning = enable_kernel_perf_tuning;
        // Page reporting order is clamped to [0, 9]; out-of-range values from
        // a misbehaving host are treated as "disabled" rather than panicking.
        self.page_reporting_order = page_reporting_order.min(9);
        self.memory_reclaim_gradual = memory_reclaim_gradual;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_reporting_order_clamps_out_of_range_values_to_nine() {
        let mut config = GuestConfig::default();
        config.apply_initial_config(true, 200, false);
        assert_eq!(config.page_reporting_order, 9);
    }

    #[test]
    fn page_reporting_order_keeps_in_range_values() {
        let mut config = GuestConfig::default();
        config.apply_initial_config(true, 3, false);
        assert_eq!(config.page_reporting_order, 3);
    }
}
