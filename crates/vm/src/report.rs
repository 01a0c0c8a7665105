//! At-exit Stats Report
//!
//! Dumps VM counters when the instance is deinitialized, controlled by
//! the `TERN_REPORT` env var (see `config`):
//! - Unset -> no report, zero cost
//! - `1` -> human-readable to stderr
//! - `json` -> JSON to stderr
//! - `json:/path` -> JSON to file

use std::io::Write;

use serde::Serialize;

use crate::config::{ReportConfig, ReportDestination, ReportFormat};

/// Snapshot of VM counters for the report and for host inspection
#[derive(Debug, Clone, Copy, Serialize)]
pub struct VmStats {
    pub pages_allocated: u64,
    pub objects_allocated: u64,
    pub objects_freed: u64,
    pub live_objects: u64,
    pub num_retains: u64,
    pub num_releases: u64,
    pub cycle_roots_freed: u64,
    pub peak_stack: u64,
}

fn render_human(stats: &VmStats) -> String {
    format!(
        "tern vm report\n\
         \x20 heap pages:        {}\n\
         \x20 objects allocated: {}\n\
         \x20 objects freed:     {}\n\
         \x20 live objects:      {}\n\
         \x20 retains:           {}\n\
         \x20 releases:          {}\n\
         \x20 cycle roots freed: {}\n\
         \x20 peak stack:        {}\n",
        stats.pages_allocated,
        stats.objects_allocated,
        stats.objects_freed,
        stats.live_objects,
        stats.num_retains,
        stats.num_releases,
        stats.cycle_roots_freed,
        stats.peak_stack,
    )
}

/// Emit the report in the configured format and destination
pub fn emit(stats: &VmStats, cfg: &ReportConfig) {
    let body = match cfg.format {
        ReportFormat::Human => render_human(stats),
        ReportFormat::Json => match serde_json::to_string_pretty(stats) {
            Ok(json) => json,
            Err(_) => return,
        },
    };
    match &cfg.destination {
        ReportDestination::Stderr => eprintln!("{body}"),
        ReportDestination::File(path) => {
            let written = std::fs::File::create(path).and_then(|mut f| f.write_all(body.as_bytes()));
            if written.is_err() {
                eprintln!("Warning: could not write report to {path}");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
