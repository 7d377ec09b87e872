//! Colo detection: one `GET /cdn-cgi/trace` against a candidate IP, with the
//! configured domain carried as Host/SNI, parsing `colo=` out of the body.

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::error::ScanError;
use crate::model::{ProbeOutcome, RunConfig};

/// Seam between the pipeline and the network so tests can substitute stubs.
#[async_trait]
pub trait ColoProber: Send + Sync {
    async fn probe(&self, ip: &str) -> Result<ProbeOutcome, ScanError>;
}

pub struct HttpColoProber {
    domain: String,
    use_tls: bool,
    timeout: Duration,
    user_agent: String,
}

impl HttpColoProber {
    pub fn new(domain: &str, cfg: &RunConfig) -> Self {
        Self {
            domain: domain.to_owned(),
            use_tls: cfg.use_tls,
            timeout: cfg.timeout,
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

    /// A client pinned to the candidate: the domain resolves to the raw IP,
    /// so Host and SNI carry the domain while the socket dials the IP.
    /// The probe is a reachability check, not an origin client, hence the
    /// disabled certificate verification under TLS.
    fn client_for(&self, ip: IpAddr) -> Result<reqwest::Client, ScanError> {
        let addr = SocketAddr::new(ip, self.port());
        let mut builder = reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .timeout(self.timeout)
            .connect_timeout(self.timeout)
            .resolve(&self.domain, addr);
        if self.use_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        builder.build().map_err(ScanError::from_http)
    }
}

#[async_trait]
impl ColoProber for HttpColoProber {
    async fn probe(&self, ip: &str) -> Result<ProbeOutcome, ScanError> {
        let addr: IpAddr = ip
            .parse()
            .map_err(|_| ScanError::Validation(format!("invalid IP address: {ip}")))?;
        let client = self.client_for(addr)?;
        let url = format!("{}://{}/cdn-cgi/trace", self.scheme(), self.domain);

        let start = Instant::now();
        let resp = client
            .get(&url)
            .header("Accept", "*/*")
            .header("Cache-Control", "no-cache")
            .send()
            .await
            .map_err(ScanError::from_http)?;

        let status = resp.status();
        let body = resp.text().await.map_err(ScanError::from_http)?;
        // RTT spans request start through a fully drained body.
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        if status != reqwest::StatusCode::OK {
            return Err(ScanError::Datacenter {
                reason: format!("unexpected status {status}"),
                latency_ms,
            });
        }

        match parse_trace_colo(&body) {
            Some(colo) => Ok(ProbeOutcome { colo, latency_ms }),
            None => Err(ScanError::Datacenter {
                reason: "no colo in trace response".into(),
                latency_ms,
            }),
        }
    }
}

/// Find the `colo=<CODE>` line in a trace body.
pub fn parse_trace_colo(body: &str) -> Option<String> {
    for line in body.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("colo=") {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_owned());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_colo_from_trace_body() {
        let body = "fl=123\nh=cf.example.com\nip=1.2.3.4\ncolo=LAX\nhttp=http/2\n";
        assert_eq!(parse_trace_colo(body), Some("LAX".to_string()));
    }

    #[test]
    fn missing_or_empty_colo_yields_none() {
        assert_eq!(parse_trace_colo("fl=1\nip=1.2.3.4\n"), None);
        assert_eq!(parse_trace_colo("colo=\nip=1.2.3.4\n"), None);
        assert_eq!(parse_trace_colo(""), None);
    }

    #[test]
    fn colo_value_is_trimmed() {
        assert_eq!(parse_trace_colo("colo= FRA \n"), Some("FRA".to_string()));
    }

    #[tokio::test]
    async fn invalid_ip_is_a_validation_error() {
        let prober = HttpColoProber::new("cf.example.com", &RunConfig::default());
        let err = prober.probe("not-an-ip").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }
}
