//! IP pool: per-subnet metrics, adaptive retry budgets, and run-scoped
//! dedup so no candidate address is handed out twice.

pub mod cidr;

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::model::IpFamily;

/// Per-subnet accounting. Mutated only under the pool lock.
#[derive(Debug, Clone, Serialize)]
pub struct SubnetMetrics {
    pub subnet: String,
    pub total_attempts: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
    pub avg_attempts: f64,
    #[serde(skip)]
    pub last_used: Option<OffsetDateTime>,
    pub capacity: u64,
    pub exhausted: bool,
    pub priority: i32,
}

impl SubnetMetrics {
    fn new(subnet: &str, capacity: u64) -> Self {
        Self {
            subnet: subnet.to_owned(),
            total_attempts: 0,
            success_count: 0,
            failure_count: 0,
            success_rate: 0.0,
            avg_attempts: 0.0,
            last_used: None,
            capacity,
            exhausted: false,
            priority: 100,
        }
    }
}

/// A candidate address plus the subnet it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub ip: String,
    pub subnet: String,
}

/// Snapshot for health queries.
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub total_subnets: usize,
    pub exhausted_subnets: usize,
    pub total_attempts: u64,
    pub total_success: u64,
    pub overall_success_rate: f64,
    pub generated_ips: usize,
}

struct PoolState {
    metrics: HashMap<String, SubnetMetrics>,
    drawn: HashSet<String>,
}

pub struct IpPool {
    family: IpFamily,
    base_retries: u32,
    exhaustion_threshold: f64,
    state: RwLock<PoolState>,
}

impl IpPool {
    pub fn new(family: IpFamily, base_retries: u32, exhaustion_threshold: f64) -> Self {
        Self {
            family,
            base_retries,
            exhaustion_threshold,
            state: RwLock::new(PoolState {
                metrics: HashMap::new(),
                drawn: HashSet::new(),
            }),
        }
    }

    /// Register subnets, initialising metrics for ones not seen before.
    /// Calling twice with the same set has the same effect as calling once.
    pub async fn register(&self, subnets: &[String]) {
        let mut state = self.state.write().await;
        for subnet in subnets {
            if state.metrics.contains_key(subnet) {
                continue;
            }
            let capacity = cidr::parse(subnet, self.family)
                .map(|net| cidr::capacity(&net))
                .unwrap_or(0);
            state
                .metrics
                .insert(subnet.clone(), SubnetMetrics::new(subnet, capacity));
        }
    }

    /// Draw one unique candidate from the allowed subnets, or `None` when
    /// every subnet is exhausted or skipped. The metrics update and the
    /// dedup check happen atomically relative to concurrent draws.
    pub async fn draw(&self, allowed: &[String]) -> Option<Candidate> {
        let mut state = self.state.write().await;

        let ordered = Self::order_by_priority(&state.metrics, allowed);
        for subnet in ordered {
            let (capacity, exhausted) = match state.metrics.get(&subnet) {
                Some(m) => (m.capacity, m.exhausted),
                None => {
                    let capacity = cidr::parse(&subnet, self.family)
                        .map(|net| cidr::capacity(&net))
                        .unwrap_or(0);
                    state
                        .metrics
                        .insert(subnet.clone(), SubnetMetrics::new(&subnet, capacity));
                    (capacity, false)
                }
            };
            if exhausted {
                continue;
            }

            let net = match cidr::parse(&subnet, self.family) {
                Ok(net) => net,
                Err(e) => {
                    tracing::warn!(subnet = %subnet, error = %e, "dropping malformed subnet");
                    if let Some(m) = state.metrics.get_mut(&subnet) {
                        m.exhausted = true;
                    }
                    continue;
                }
            };

            let budget = {
                let m = state.metrics.get(&subnet).expect("registered above");
                self.adaptive_retries(m)
            };

            for attempt in 1..=budget {
                let ip = match cidr::draw(&net) {
                    Ok(ip) => ip.to_string(),
                    Err(e) => {
                        tracing::error!(subnet = %subnet, error = %e, "address draw failed");
                        let m = state.metrics.get_mut(&subnet).expect("registered above");
                        m.failure_count += 1;
                        m.total_attempts += 1;
                        continue;
                    }
                };

                if state.drawn.contains(&ip) {
                    let m = state.metrics.get_mut(&subnet).expect("registered above");
                    m.failure_count += 1;
                    m.total_attempts += 1;
                    continue;
                }

                state.drawn.insert(ip.clone());
                let m = state.metrics.get_mut(&subnet).expect("registered above");
                m.success_count += 1;
                m.total_attempts += 1;
                m.success_rate = m.success_count as f64 / m.total_attempts as f64;
                m.avg_attempts = if m.success_count == 1 {
                    attempt as f64
                } else {
                    (m.avg_attempts + attempt as f64) / 2.0
                };
                m.last_used = Some(OffsetDateTime::now_utc());
                if capacity > 0 && m.success_count >= capacity {
                    m.exhausted = true;
                }
                return Some(Candidate { ip, subnet });
            }

            // Budget spent without a unique hit: exhausted once the observed
            // miss ratio crosses the threshold.
            let m = state.metrics.get_mut(&subnet).expect("registered above");
            if m.total_attempts > 0 && m.success_rate < 1.0 - self.exhaustion_threshold {
                m.exhausted = true;
                tracing::debug!(subnet = %subnet, "subnet marked exhausted");
            }
        }

        None
    }

    /// Draw up to `n` unique candidates.
    pub async fn draw_batch(&self, allowed: &[String], n: usize) -> Vec<Candidate> {
        let mut batch = Vec::with_capacity(n);
        for _ in 0..n {
            match self.draw(allowed).await {
                Some(c) => batch.push(c),
                None => break,
            }
        }
        batch
    }

    /// Budget scaled to subnet size, then to the observed success rate.
    fn adaptive_retries(&self, m: &SubnetMetrics) -> u32 {
        let mut budget = if m.capacity < 100 {
            self.base_retries * 2
        } else if m.capacity < 500 {
            self.base_retries
        } else {
            self.base_retries / 2
        };
        if m.success_rate > 0.8 {
            budget /= 2;
        } else if m.success_rate < 0.3 && m.total_attempts >= 10 {
            budget *= 2;
        }
        budget.max(1)
    }

    /// Priority desc, then success rate desc, then capacity desc.
    fn order_by_priority(metrics: &HashMap<String, SubnetMetrics>, allowed: &[String]) -> Vec<String> {
        let mut ordered: Vec<String> = allowed.to_vec();
        ordered.sort_by(|a, b| {
            let (pa, ra, ca) = metrics
                .get(a)
                .map(|m| (m.priority, m.success_rate, m.capacity))
                .unwrap_or((100, 0.0, 0));
            let (pb, rb, cb) = metrics
                .get(b)
                .map(|m| (m.priority, m.success_rate, m.capacity))
                .unwrap_or((100, 0.0, 0));
            pb.cmp(&pa)
                .then(rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal))
                .then(cb.cmp(&ca))
        });
        ordered
    }

    /// Clear the dedup set and all metrics. Called at run start.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        for m in state.metrics.values_mut() {
            m.exhausted = false;
            m.total_attempts = 0;
            m.success_count = 0;
            m.failure_count = 0;
            m.success_rate = 0.0;
            m.avg_attempts = 0.0;
        }
        state.drawn.clear();
    }

    /// Clear one subnet's exhaustion flag and counters.
    pub async fn reset_subnet(&self, subnet: &str) {
        let mut state = self.state.write().await;
        if let Some(m) = state.metrics.get_mut(subnet) {
            m.exhausted = false;
            m.total_attempts = 0;
            m.success_count = 0;
            m.failure_count = 0;
            m.success_rate = 0.0;
        }
    }

    pub async fn metrics(&self) -> Vec<SubnetMetrics> {
        self.state.read().await.metrics.values().cloned().collect()
    }

    pub async fn health(&self) -> PoolHealth {
        let state = self.state.read().await;
        let mut exhausted = 0;
        let mut attempts = 0u64;
        let mut success = 0u64;
        for m in state.metrics.values() {
            if m.exhausted {
                exhausted += 1;
            }
            attempts += m.total_attempts;
            success += m.success_count;
        }
        PoolHealth {
            total_subnets: state.metrics.len(),
            exhausted_subnets: exhausted,
            total_attempts: attempts,
            total_success: success,
            overall_success_rate: if attempts > 0 {
                success as f64 / attempts as f64
            } else {
                0.0
            },
            generated_ips: state.drawn.len(),
        }
    }
}
