//! VM Configuration
//!
//! Env-driven, parsed once at init. No other module reads the
//! environment.
//!
//! - `TERN_REPORT`: unset or `0` -> no report; `1` -> human-readable VM
//!   stats to stderr at deinit; `json` -> JSON to stderr; `json:/path` ->
//!   JSON to a file. Unrecognized values warn and disable.
//! - `TERN_TRACE`: `1` enables retain/release accounting visibility from
//!   init (equivalent to calling `set_trace`).

use tracing::warn;

/// Report output format
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportFormat {
    Human,
    Json,
}

/// Report output destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportDestination {
    Stderr,
    File(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportConfig {
    pub format: ReportFormat,
    pub destination: ReportDestination,
}

/// Parsed VM configuration
#[derive(Debug, Clone, Default)]
pub struct VmConfig {
    pub report: Option<ReportConfig>,
    pub trace: bool,
}

impl VmConfig {
    /// Read `TERN_REPORT` / `TERN_TRACE` from the environment
    pub fn from_env() -> Self {
        VmConfig {
            report: parse_report(std::env::var("TERN_REPORT").ok().as_deref()),
            trace: matches!(std::env::var("TERN_TRACE").ok().as_deref(), Some("1")),
        }
    }
}

fn parse_report(val: Option<&str>) -> Option<ReportConfig> {
    let val = val?;
    match val {
        "" | "0" => None,
        "1" => Some(ReportConfig {
            format: ReportFormat::Human,
            destination: ReportDestination::Stderr,
        }),
        "json" => Some(ReportConfig {
            format: ReportFormat::Json,
            destination: ReportDestination::Stderr,
        }),
        s if s.starts_with("json:") => Some(ReportConfig {
            format: ReportFormat::Json,
            destination: ReportDestination::File(s[5..].to_string()),
        }),
        other => {
            warn!(value = other, "TERN_REPORT not recognized, ignoring");
            None
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
