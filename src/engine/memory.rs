//! Memory estimation for the pre-flight check.
//!
//! Compares the timeline's peak VU count against available RAM before any
//! load is generated.

use sysinfo::System;

/// Per-VU memory overhead in bytes: task, request buffers, pooled connection
pub const PER_VU_BYTES: usize = 64 * 1024;

/// Base engine overhead in bytes (~30 MB)
pub const BASE_OVERHEAD_BYTES: usize = 30 * 1024 * 1024;

/// Information about system memory state
#[derive(Debug, Clone)]
pub struct MemoryInfo {
    /// Available memory in bytes
    pub available_bytes: u64,
    /// Total system memory in bytes
    pub total_bytes: u64,
}

impl MemoryInfo {
    /// Get current memory information from the system
    pub fn current() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();

        Self {
            available_bytes: sys.available_memory(),
            total_bytes: sys.total_memory(),
        }
    }

    /// Get memory usage as a fraction of total
    pub fn usage_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let used = self.total_bytes.saturating_sub(self.available_bytes);
        (used as f64) / (self.total_bytes as f64)
    }
}

/// Estimate the maximum number of VUs that can run given available memory.
///
/// Formula: (available_ram - base_overhead) / per_vu_overhead
pub fn estimate_max_vus(available_bytes: u64) -> usize {
    let available = available_bytes as usize;
    if available <= BASE_OVERHEAD_BYTES {
        return 0;
    }
    (available - BASE_OVERHEAD_BYTES) / PER_VU_BYTES
}

/// Estimate memory required for a given number of VUs.
pub fn estimate_memory_for_vus(vus: usize) -> u64 {
    (BASE_OVERHEAD_BYTES + vus * PER_VU_BYTES) as u64
}

/// Result of pre-flight memory check
#[derive(Debug)]
pub struct PreflightResult {
    /// Whether the peak VU count can likely fit in memory
    pub safe: bool,
    /// Estimated maximum VUs for available memory
    pub estimated_max: usize,
    /// Peak VU count of the timeline
    pub requested: usize,
    /// Available memory in bytes
    pub available_bytes: u64,
    /// Estimated memory needed in bytes
    pub estimated_needed: u64,
    /// Fraction of system memory already in use
    pub usage_percent: f64,
}

/// Perform a pre-flight memory check against live system memory.
pub fn preflight_check(peak_vus: usize) -> PreflightResult {
    preflight_with(&MemoryInfo::current(), peak_vus)
}

pub fn preflight_with(info: &MemoryInfo, peak_vus: usize) -> PreflightResult {
    let estimated_max = estimate_max_vus(info.available_bytes);
    PreflightResult {
        safe: peak_vus <= estimated_max,
        estimated_max,
        requested: peak_vus,
        available_bytes: info.available_bytes,
        estimated_needed: estimate_memory_for_vus(peak_vus),
        usage_percent: info.usage_percent(),
    }
}

/// Format bytes as human-readable string (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
