//! Download measurement: stream a large object from a candidate IP and turn
//! the byte stream into final and peak Mbps via the sliding window.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::time::Instant;

use crate::engine::window::{window_speed, SpeedSample};
use crate::error::ScanError;
use crate::model::{RunConfig, SpeedOutcome};

/// Seam between the pipeline and the network so tests can substitute stubs.
#[async_trait]
pub trait SpeedProber: Send + Sync {
    async fn measure(&self, ip: &str) -> Result<SpeedOutcome, ScanError>;
}

pub struct HttpSpeedProber {
    domain: String,
    file_path: String,
    use_tls: bool,
    timeout: Duration,
    duration: Duration,
    sample_rate: Duration,
    window_size: usize,
    user_agent: String,
}

impl HttpSpeedProber {
    pub fn new(domain: &str, file_path: &str, cfg: &RunConfig) -> Self {
        Self {
            domain: domain.to_owned(),
            file_path: file_path.trim_start_matches('/').to_owned(),
            use_tls: cfg.use_tls,
            timeout: cfg.timeout,
            duration: cfg.download_duration,
            sample_rate: cfg.sample_rate,
            window_size: cfg.window_size,
            user_agent: cfg.user_agent.clone(),
        }
    }

    fn scheme(&self) -> &'static str {
        if self.use_tls {
            "https"
        } else {
            "http"
        }
    }

    fn port(&self) -> u16 {
        if self.use_tls {
            443
        } else {
            80
        }
    }

    /// Connect timeout only: the download has its own duration bound, so a
    /// whole-request timeout must not cut the stream short.
    fn client_for(&self, ip: IpAddr) -> Result<reqwest::Client, ScanError> {
        let addr = SocketAddr::new(ip, self.port());
        let mut builder = reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .connect_timeout(self.timeout)
            .resolve(&self.domain, addr);
        if self.use_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        builder.build().map_err(ScanError::from_http)
    }
}

#[async_trait]
impl SpeedProber for HttpSpeedProber {
    async fn measure(&self, ip: &str) -> Result<SpeedOutcome, ScanError> {
        let addr: IpAddr = ip
            .parse()
            .map_err(|_| ScanError::Validation(format!("invalid IP address: {ip}")))?;
        let client = self.client_for(addr)?;
        let url = format!("{}://{}/{}", self.scheme(), self.domain, self.file_path);

        let resp = client.get(&url).send().await.map_err(ScanError::from_http)?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(ScanError::Speedtest {
                reason: format!("unexpected status {}", resp.status()),
                bytes: 0,
            });
        }

        let start = Instant::now();
        let deadline = start + self.duration;
        let mut stream = resp.bytes_stream();

        let mut total_bytes = 0u64;
        let mut window: VecDeque<SpeedSample> = VecDeque::with_capacity(self.window_size);
        let mut peak_mbps: f64 = 0.0;
        let mut last_sample = start;

        loop {
            let chunk = match tokio::time::timeout_at(deadline, stream.next()).await {
                // Duration elapsed: the test ends with what was measured.
                Err(_) => break,
                // EOF before the duration is not an error.
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    return Err(ScanError::Speedtest {
                        reason: e.to_string(),
                        bytes: total_bytes,
                    });
                }
                Ok(Some(Ok(chunk))) => chunk,
            };
            total_bytes += chunk.len() as u64;

            let now = Instant::now();
            if now.duration_since(last_sample) >= self.sample_rate {
                let elapsed = now.duration_since(start).as_secs_f64();
                if elapsed > 0.0 {
                    let instant_mbps = (total_bytes as f64 * 8.0) / (elapsed * 1_000_000.0);
                    window.push_back(SpeedSample {
                        taken_at: now.into_std(),
                        mbps: instant_mbps,
                        bytes: total_bytes,
                        elapsed_s: elapsed,
                    });
                    if window.len() > self.window_size {
                        window.pop_front();
                    }
                    peak_mbps = peak_mbps.max(window_speed(&window));
                    last_sample = now;
                }
            }
        }

        let elapsed_s = start.elapsed().as_secs_f64();
        let mbps = if elapsed_s > 0.0 && total_bytes > 0 {
            (total_bytes as f64 * 8.0) / (elapsed_s * 1_000_000.0)
        } else {
            // Zero bytes is still a completed test; the caller classifies it.
            0.0
        };

        Ok(SpeedOutcome {
            mbps,
            peak_mbps,
            bytes: total_bytes,
            elapsed_s,
            complete: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_leading_slash_from_file_path() {
        let prober = HttpSpeedProber::new("cf.example.com", "/files/big.bin", &RunConfig::default());
        assert_eq!(prober.file_path, "files/big.bin");
    }

    #[tokio::test]
    async fn invalid_ip_is_a_validation_error() {
        let prober = HttpSpeedProber::new("cf.example.com", "big.bin", &RunConfig::default());
        let err = prober.measure("::junk::").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }
}
