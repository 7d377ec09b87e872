use rand::Rng;
use serde::Serialize;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Everything that can go wrong during a run, classified so the retry
/// policies and the pipeline's failure handling can dispatch on kind.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("validation error: {0}")]
    Validation(String),

    /// The trace endpoint answered but yielded no usable colo. The latency is
    /// still carried because the response did arrive.
    #[error("datacenter probe failed: {reason}")]
    Datacenter { reason: String, latency_ms: f64 },

    /// A download broke mid-stream; `bytes` records how far it got.
    #[error("speed test failed after {bytes} bytes: {reason}")]
    Speedtest { reason: String, bytes: u64 },

    #[error("file error: {0}")]
    FileIo(#[from] std::io::Error),

    #[error("system error: {0}")]
    System(String),

    #[error("config error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Network,
    Timeout,
    Validation,
    Datacenter,
    Speedtest,
    FileIo,
    System,
    Config,
}

impl ScanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScanError::Network(_) => ErrorKind::Network,
            ScanError::Timeout(_) => ErrorKind::Timeout,
            ScanError::Validation(_) => ErrorKind::Validation,
            ScanError::Datacenter { .. } => ErrorKind::Datacenter,
            ScanError::Speedtest { .. } => ErrorKind::Speedtest,
            ScanError::FileIo(_) => ErrorKind::FileIo,
            ScanError::System(_) => ErrorKind::System,
            ScanError::Config(_) => ErrorKind::Config,
        }
    }

    /// Classify a reqwest failure as timeout or plain transport error.
    pub fn from_http(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ScanError::Timeout(err.to_string())
        } else {
            ScanError::Network(err.to_string())
        }
    }
}

/// Backoff parameters for one error kind.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl RetryPolicy {
    /// Default policy table: transport and timeout failures back off
    /// exponentially, datacenter probes retry once quickly, speed tests get
    /// two attempts, validation and config never retry.
    pub fn for_kind(kind: ErrorKind) -> RetryPolicy {
        match kind {
            ErrorKind::Network => RetryPolicy {
                max_retries: 3,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(10),
                backoff_factor: 2.0,
                jitter: true,
            },
            ErrorKind::Timeout => RetryPolicy {
                max_retries: 2,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(10),
                backoff_factor: 2.0,
                jitter: true,
            },
            ErrorKind::Datacenter => RetryPolicy {
                max_retries: 1,
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(2),
                backoff_factor: 1.5,
                jitter: false,
            },
            ErrorKind::Speedtest => RetryPolicy {
                max_retries: 2,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(5),
                backoff_factor: 1.5,
                jitter: true,
            },
            ErrorKind::FileIo => RetryPolicy {
                max_retries: 2,
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(2),
                backoff_factor: 2.0,
                jitter: true,
            },
            ErrorKind::System => RetryPolicy {
                max_retries: 1,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(3),
                backoff_factor: 2.0,
                jitter: false,
            },
            ErrorKind::Validation | ErrorKind::Config => RetryPolicy {
                max_retries: 0,
                initial_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                backoff_factor: 1.0,
                jitter: false,
            },
        }
    }

    /// Delay before retry number `attempt` (0-based): exponential growth
    /// capped at `max_delay`, with optional ±10% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 0..attempt {
            delay = delay.mul_f64(self.backoff_factor);
        }
        if delay > self.max_delay {
            delay = self.max_delay;
        }
        if self.jitter && !delay.is_zero() {
            let factor = rand::thread_rng().gen_range(0.9..=1.1);
            delay = delay.mul_f64(factor);
        }
        delay
    }
}

struct Degraded {
    until: Option<Instant>,
}

/// Process-wide error plane. The only flag it carries is degraded mode,
/// which the pipeline consults to relax colo filtering for a bounded time.
pub struct ErrorPlane {
    state: RwLock<Degraded>,
}

impl Default for ErrorPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorPlane {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Degraded { until: None }),
        }
    }

    pub fn enable_degraded(&self, duration: Duration) {
        let mut s = self.state.write().expect("error plane lock");
        s.until = Some(Instant::now() + duration);
        tracing::warn!(duration_s = duration.as_secs_f64(), "degraded mode enabled");
    }

    pub fn disable_degraded(&self) {
        let mut s = self.state.write().expect("error plane lock");
        s.until = None;
    }

    /// True while the bounded degraded window is open; expires on its own.
    pub fn is_degraded(&self) -> bool {
        {
            let s = self.state.read().expect("error plane lock");
            match s.until {
                None => return false,
                Some(until) if Instant::now() < until => return true,
                Some(_) => {}
            }
        }
        let mut s = self.state.write().expect("error plane lock");
        if matches!(s.until, Some(until) if Instant::now() >= until) {
            s.until = None;
        }
        s.until.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_and_config_never_retry() {
        assert_eq!(RetryPolicy::for_kind(ErrorKind::Validation).max_retries, 0);
        assert_eq!(RetryPolicy::for_kind(ErrorKind::Config).max_retries, 0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter: false,
        };
        assert_eq!(p.delay(0), Duration::from_secs(1));
        assert_eq!(p.delay(1), Duration::from_secs(2));
        assert_eq!(p.delay(2), Duration::from_secs(4));
        assert_eq!(p.delay(3), Duration::from_secs(8));
        assert_eq!(p.delay(4), Duration::from_secs(10));
        assert_eq!(p.delay(10), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let p = RetryPolicy {
            max_retries: 1,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter: true,
        };
        for _ in 0..50 {
            let d = p.delay(0).as_secs_f64();
            assert!((0.9..=1.1).contains(&d), "delay {d} outside jitter band");
        }
    }

    #[test]
    fn degraded_mode_expires() {
        let plane = ErrorPlane::new();
        assert!(!plane.is_degraded());
        plane.enable_degraded(Duration::from_millis(20));
        assert!(plane.is_degraded());
        std::thread::sleep(Duration::from_millis(40));
        assert!(!plane.is_degraded());
    }

    #[test]
    fn kinds_match_variants() {
        assert_eq!(
            ScanError::Datacenter {
                reason: "no colo".into(),
                latency_ms: 12.0
            }
            .kind(),
            ErrorKind::Datacenter
        );
        assert_eq!(
            ScanError::Speedtest {
                reason: "reset".into(),
                bytes: 4096
            }
            .kind(),
            ErrorKind::Speedtest
        );
    }
}
