//! Memory-reclaim governor: a long-lived idle-aware worker that hints unused
//! guest pages back to the host. Ports `main.cpp`'s
//! `ConfigureMemoryReduction`.

use std::collections::VecDeque;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use tokio::time::Instant;

const PAGE_REPORTING_PARAM: &str = "/sys/module/page_reporting/parameters/page_reporting_order";
const DROP_CACHES_PATH: &str = "/proc/sys/vm/drop_caches";
const COMPACT_MEMORY_PATH: &str = "/proc/sys/vm/compact_memory";
const GRADUAL_RECLAIM_PATH: &str = "/sys/fs/cgroup/memory.reclaim";

const MEMORY_LOW_BYTES: f64 = 1024.0 * 1024.0 * 1024.0;
const MEMORY_HIGH_BYTES: f64 = 1.1 * 1024.0 * 1024.0 * 1024.0;
const SAMPLE_INTERVAL: Duration = Duration::from_secs(30);
const FULL_WINDOW_LEN: usize = 20;
const GRADUAL_WINDOW_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimMode {
    Disabled,
    DropCache,
    Gradual,
}

#[derive(Debug, Clone, Copy)]
pub struct ReclaimConfig {
    pub page_reporting_order: u8,
    pub mode: ReclaimMode,
}

impl ReclaimConfig {
    pub fn new(page_reporting_order: i32, mode: ReclaimMode) -> Self {
        let clamped = if !(0..=9).contains(&page_reporting_order) {
            tracing::warn!(page_reporting_order, "invalid page_reporting_order, disabling");
            0
        } else {
            page_reporting_order as u8
        };

        Self {
            page_reporting_order: clamped,
            mode,
        }
    }

    fn worker_needed(&self) -> bool {
        self.page_reporting_order != 0 || self.mode != ReclaimMode::Disabled
    }
}

/// Cumulative user-mode CPU ticks read from `/proc/stat`'s leading `cpu`
/// line (field 1, "user"). Parsed the same way the teacher's
/// `CpuStats::from_str` parses cgroup `cpu.stat` key/value pairs, adapted to
/// `/proc/stat`'s whitespace-separated row since the governor samples
/// system-wide usage, not one cgroup.
#[derive(Debug, Clone, Copy)]
pub struct CpuStats {
    pub user_ticks: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseCpuStatsError {
    #[error("missing \"cpu\" row in /proc/stat")]
    MissingCpuRow,
    #[error("malformed /proc/stat cpu row: \"{0}\"")]
    Malformed(String),
}

impl FromStr for CpuStats {
    type Err = ParseCpuStatsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s
            .lines()
            .find(|l| l.starts_with("cpu "))
            .ok_or(ParseCpuStatsError::MissingCpuRow)?;

        let user_ticks = line
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| ParseCpuStatsError::Malformed(line.to_string()))?
            .parse()
            .map_err(|_| ParseCpuStatsError::Malformed(line.to_string()))?;

        Ok(Self { user_ticks })
    }
}

fn read_user_cpu_ticks() -> io::Result<i64> {
    let content = std::fs::read_to_string("/proc/stat")?;
    CpuStats::from_str(&content)
        .map(|s| s.user_ticks)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Reads whole-VM memory-in-use via the root cgroup's memory accounting
/// (same controller the teacher's execution sandbox reads `memory_stat()`
/// from for OOM detection), falling back to `/proc/meminfo`'s
/// total-minus-available if the cgroup hierarchy is not mounted.
fn read_memory_in_use_bytes() -> io::Result<f64> {
    use cgroups_rs::fs::memory::MemController;
    use cgroups_rs::fs::{Cgroup, hierarchies};

    let cg = Cgroup::load(hierarchies::auto(), "/");
    if let Some(controller) = cg.controller_of::<MemController>() {
        let usage = controller.memory_stat().usage_in_bytes;
        if usage > 0 {
            return Ok(usage as f64);
        }
    }

    let content = std::fs::read_to_string("/proc/meminfo")?;
    let mut total_kib = None;
    let mut available_kib = None;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kib = rest.trim().trim_end_matches(" kB").trim().parse::<f64>().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kib = rest.trim().trim_end_matches(" kB").trim().parse::<f64>().ok();
        }
    }

    match (total_kib, available_kib) {
        (Some(total), Some(available)) => Ok((total - available) * 1024.0),
        _ => Err(io::Error::new(io::ErrorKind::InvalidData, "missing MemTotal/MemAvailable")),
    }
}

/// Writes the page-reporting order to its kernel parameter and, if either
/// knob is active, spawns the detached idle-sampling worker. Returns
/// immediately; the worker runs for the lifetime of the process.
pub fn configure(config: ReclaimConfig) {
    if config.page_reporting_order != 0 {
        if let Err(e) = std::fs::write(PAGE_REPORTING_PARAM, config.page_reporting_order.to_string()) {
            tracing::warn!(error = %e, "failed to write page_reporting_order");
        }
    }

    if !config.worker_needed() {
        return;
    }

    tokio::spawn(run_governor(config));
}

async fn run_governor(mut config: ReclaimConfig) {
    if config.mode == ReclaimMode::Gradual && tokio::fs::metadata(GRADUAL_RECLAIM_PATH).await.is_err() {
        tracing::warn!("memory.reclaim not writable, falling back to drop-cache mode");
        config.mode = ReclaimMode::DropCache;
    }

    let window_len = if config.mode == ReclaimMode::Gradual {
        GRADUAL_WINDOW_LEN
    } else {
        FULL_WINDOW_LEN
    };

    // One 0.5%-of-capacity sample per core, over the sampling window.
    let cores = num_cpus();
    let reclaim_threshold = (cores as i64 * 100 * SAMPLE_INTERVAL.as_secs() as i64) / 200;

    let mut window: VecDeque<i64> = VecDeque::with_capacity(window_len);
    let mut idling = false;
    let mut last_compaction_sample: Option<i64> = None;

    tokio::time::sleep(SAMPLE_INTERVAL).await;

    loop {
        let target = Instant::now() + SAMPLE_INTERVAL;
        let start = match read_user_cpu_ticks() {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read cpu stats, skipping cycle");
                tokio::time::sleep_until(target).await;
                continue;
            }
        };

        if config.mode != ReclaimMode::Disabled {
            let oldest = window.front().copied();
            let newest = window.back().copied();
            let below_threshold = oldest.is_some_and(|o| o > start - reclaim_threshold * (window_len as i64 + 1))
                && newest.is_some_and(|n| n > start - reclaim_threshold);

            if below_threshold {
                idling = reclaim_step(config.mode, idling).await;
            } else {
                idling = false;
            }

            if window.len() == window_len {
                window.pop_front();
            }
            window.push_back(start);
        }

        if config.page_reporting_order != 0 {
            let should_check = last_compaction_sample.is_none_or(|stop| start - stop > cores as i64);
            if should_check {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if let Ok(stop) = read_user_cpu_ticks() {
                    if (stop - start) < cores as i64 {
                        if let Err(e) = tokio::fs::write(COMPACT_MEMORY_PATH, b"1\n").await {
                            tracing::warn!(error = %e, "failed to write compact_memory");
                        }
                    }

                    last_compaction_sample = Some(stop);
                }
            }
        }

        tokio::time::sleep_until(target).await;
    }
}

/// Performs one idle-triggered reclaim action; returns the new `idling`
/// state.
async fn reclaim_step(mode: ReclaimMode, mut idling: bool) -> bool {
    match mode {
        ReclaimMode::Gradual => {
            let Ok(memory_in_use) = read_memory_in_use_bytes() else {
                return idling;
            };

            if memory_in_use > MEMORY_HIGH_BYTES {
                idling = false;
            }

            if !idling && memory_in_use > MEMORY_LOW_BYTES {
                let target_size = memory_in_use * 0.97;
                let bytes_to_free = (memory_in_use - target_size) as u64;
                match tokio::fs::write(GRADUAL_RECLAIM_PATH, bytes_to_free.to_string()).await {
                    Ok(()) => {}
                    Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => {
                        // Kernel could not free that much; not an error.
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to write memory.reclaim"),
                }

                if target_size < MEMORY_LOW_BYTES {
                    idling = true;
                }
            }

            idling
        }
        ReclaimMode::DropCache => {
            if !idling {
                idling = true;
                if let Err(e) = tokio::fs::write(DROP_CACHES_PATH, b"1\n").await {
                    tracing::warn!(error = %e, "failed to write drop_caches");
                }
            }

            idling
        }
        ReclaimMode::Disabled => idling,
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_reporting_order_out_of_range_clamps_to_zero() {
        let config = ReclaimConfig::new(-3, ReclaimMode::Disabled);
        assert_eq!(config.page_reporting_order, 0);

        let config = ReclaimConfig::new(12, ReclaimMode::Disabled);
        assert_eq!(config.page_reporting_order, 0);
    }

    #[test]
    fn page_reporting_order_in_range_is_kept() {
        let config = ReclaimConfig::new(5, ReclaimMode::Disabled);
        assert_eq!(config.page_reporting_order, 5);
    }

    #[test]
    fn worker_not_needed_when_everything_disabled() {
        let config = ReclaimConfig::new(0, ReclaimMode::Disabled);
        assert!(!config.worker_needed());
    }

    #[test]
    fn worker_needed_when_page_reporting_active() {
        let config = ReclaimConfig::new(3, ReclaimMode::Disabled);
        assert!(config.worker_needed());
    }

    #[test]
    fn cpu_stats_parse_reads_user_ticks_from_proc_stat_shape() {
        let sample = "cpu  1234 0 567 89000 12 0 3 0 0 0\ncpu0 600 0 300 44000 6 0 1 0 0 0\n";
        let stats = CpuStats::from_str(sample).unwrap();
        assert_eq!(stats.user_ticks, 1234);
    }

    #[test]
    fn cpu_stats_parse_fails_without_cpu_row() {
        assert!(CpuStats::from_str("not /proc/stat at all").is_err());
    }

    #[tokio::test]
    async fn gradual_reclaim_computes_three_percent_shrink_target() {
        // 1.5 GB in use -> target 0.97 * 1.5GB, so bytes_to_free = 0.03 * 1.5GB.
        let memory_in_use = 1.5 * 1024.0 * 1024.0 * 1024.0;
        let target_size = memory_in_use * 0.97;
        let bytes_to_free = (memory_in_use - target_size) as u64;
        assert_eq!(bytes_to_free, (memory_in_use * 0.03) as u64);
    }
}
