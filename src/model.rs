use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ScanError;

/// Which address family a run draws candidates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    #[value(name = "ipv4", alias = "v4")]
    V4,
    #[value(name = "ipv6", alias = "v6")]
    V6,
}

impl IpFamily {
    /// Name of the static subnet list for this family.
    pub fn subnet_file(&self) -> &'static str {
        match self {
            IpFamily::V4 => "ips-v4.txt",
            IpFamily::V6 => "ips-v6.txt",
        }
    }
}

impl std::fmt::Display for IpFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "ipv4"),
            IpFamily::V6 => write!(f, "ipv6"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Directory holding ips-v4.txt / ips-v6.txt / colo.txt / url.txt.
    pub data_dir: PathBuf,
    pub ip_family: IpFamily,
    /// Stop once this many servers meet the bandwidth floor.
    pub expected_servers: usize,
    /// Minimum sustained Mbps for a server to qualify.
    pub bandwidth_floor: f64,
    pub use_tls: bool,
    /// Per-request timeout (connect and colo probe alike).
    pub timeout: Duration,
    /// Upper bound on each download measurement.
    pub download_duration: Duration,
    /// Concurrent workers for the colo-detection phase.
    pub workers: usize,
    /// Candidates drawn per batch.
    pub batch_size: usize,
    /// Cadence of throughput samples during a download.
    pub sample_rate: Duration,
    /// Samples retained by the per-test window.
    pub window_size: usize,
    /// Bound on the in-memory result ring.
    pub max_results: usize,
    /// Base retry budget per subnet before adaptive scaling.
    pub base_retries: u32,
    /// Miss ratio beyond which a subnet is marked exhausted.
    pub exhaustion_threshold: f64,
    pub user_agent: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            ip_family: IpFamily::V4,
            expected_servers: 3,
            bandwidth_floor: 100.0,
            use_tls: false,
            timeout: Duration::from_secs(5),
            download_duration: Duration::from_secs(10),
            workers: 10,
            batch_size: 100,
            sample_rate: Duration::from_millis(500),
            window_size: 10,
            max_results: 1000,
            base_retries: 200,
            exhaustion_threshold: 0.85,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".into(),
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ScanError> {
        if self.expected_servers > 100 {
            return Err(ScanError::Config(
                "expected_servers must be between 0 and 100".into(),
            ));
        }
        if !(0.1..=10_000.0).contains(&self.bandwidth_floor) {
            return Err(ScanError::Config(
                "bandwidth_floor must be between 0.1 and 10000 Mbps".into(),
            ));
        }
        if !(1..=300).contains(&self.timeout.as_secs()) {
            return Err(ScanError::Config(
                "timeout must be between 1 and 300 seconds".into(),
            ));
        }
        if !(1..=300).contains(&self.download_duration.as_secs()) {
            return Err(ScanError::Config(
                "download_duration must be between 1 and 300 seconds".into(),
            ));
        }
        if !(1..=100).contains(&self.workers) {
            return Err(ScanError::Config(
                "workers must be between 1 and 100".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ScanError::Config("batch_size must be positive".into()));
        }
        if self.max_results == 0 {
            return Err(ScanError::Config("max_results must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.exhaustion_threshold) {
            return Err(ScanError::Config(
                "exhaustion_threshold must be between 0 and 1".into(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle of a single result row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultStatus {
    Pending,
    Probing,
    Measuring,
    Complete,
    Invalid,
    Skipped,
    BelowFloor,
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResultStatus::Pending => "pending",
            ResultStatus::Probing => "probing",
            ResultStatus::Measuring => "measuring",
            ResultStatus::Complete => "complete",
            ResultStatus::Invalid => "invalid",
            ResultStatus::Skipped => "skipped",
            ResultStatus::BelowFloor => "below-floor",
        };
        write!(f, "{s}")
    }
}

/// One row of the result store. Latency and speed are kept in display form
/// ("30.21" / "-" and "200.00" / "timeout") so exports show them verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub ip: String,
    pub status: ResultStatus,
    pub latency: String,
    pub speed: String,
    pub peak_speed: f64,
    pub colo: String,
}

impl ResultRecord {
    pub fn speed_mbps(&self) -> Option<f64> {
        self.speed.parse::<f64>().ok()
    }

    pub fn latency_ms(&self) -> Option<f64> {
        self.latency.parse::<f64>().ok()
    }
}

/// Live counters for one run. Monotonic within the run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub total: usize,
    pub completed: usize,
    pub qualified: usize,
    pub current_ip: String,
    pub current_speed: String,
}

/// Outcome of one colo probe: the colo code plus the round trip in ms,
/// measured from request start to a fully drained body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub colo: String,
    pub latency_ms: f64,
}

/// Outcome of one download measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedOutcome {
    pub mbps: f64,
    pub peak_mbps: f64,
    pub bytes: u64,
    pub elapsed_s: f64,
    pub complete: bool,
}

/// Sort keys accepted by the result store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    Speed,
    Latency,
    Colo,
    Ip,
}

impl std::fmt::Display for SortKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SortKey::Speed => "speed",
            SortKey::Latency => "latency",
            SortKey::Colo => "colo",
            SortKey::Ip => "ip",
        };
        write!(f, "{s}")
    }
}

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    EnoughQualified,
    IpsExhausted,
    Stopped,
    LoadFailed(String),
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::EnoughQualified => write!(f, "enough qualified servers"),
            RunOutcome::IpsExhausted => write!(f, "no more IPs"),
            RunOutcome::Stopped => write!(f, "stopped"),
            RunOutcome::LoadFailed(reason) => write!(f, "load failed: {reason}"),
        }
    }
}

/// Progress events published by the engine while a run executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TestEvent {
    RunStarted {
        subnets: usize,
    },
    BatchStarted {
        number: usize,
        size: usize,
    },
    PhaseOneCompleted {
        number: usize,
        valid: usize,
        filtered: usize,
    },
    Measuring {
        ip: String,
    },
    ResultRecorded {
        record: ResultRecord,
    },
    Info {
        message: String,
    },
    RunFinished {
        outcome: RunOutcome,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(RunConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_workers() {
        let cfg = RunConfig {
            workers: 0,
            ..RunConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = RunConfig {
            workers: 101,
            ..RunConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_expected_servers_is_allowed() {
        let cfg = RunConfig {
            expected_servers: 0,
            ..RunConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn status_serializes_kebab_case() {
        let s = serde_json::to_string(&ResultStatus::BelowFloor).unwrap();
        assert_eq!(s, "\"below-floor\"");
    }

    #[test]
    fn record_speed_parses_numeric_only() {
        let r = ResultRecord {
            ip: "1.1.1.1".into(),
            status: ResultStatus::Invalid,
            latency: "-".into(),
            speed: "timeout".into(),
            peak_speed: 0.0,
            colo: "LAX".into(),
        };
        assert!(r.speed_mbps().is_none());
        assert!(r.latency_ms().is_none());
    }
}
