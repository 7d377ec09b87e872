//! In-memory result store: a bounded ring of records deduplicated by IP,
//! plus the live statistics the dashboard polls. Records and stats sit
//! behind separate locks so frequent stats reads don't contend with row
//! updates.

use std::collections::{HashSet, VecDeque};
use tokio::sync::RwLock;

use crate::error::ScanError;
use crate::model::{ResultRecord, ResultStatus, RunStats, SortKey};

struct Records {
    list: VecDeque<ResultRecord>,
    ips: HashSet<String>,
}

pub struct ResultStore {
    max_results: usize,
    records: RwLock<Records>,
    stats: RwLock<RunStats>,
}

impl ResultStore {
    pub fn new(max_results: usize) -> Self {
        Self {
            max_results,
            records: RwLock::new(Records {
                list: VecDeque::new(),
                ips: HashSet::new(),
            }),
            stats: RwLock::new(RunStats::default()),
        }
    }

    /// Insert a record, rejecting an IP already present.
    pub async fn add(&self, record: ResultRecord) -> Result<(), ScanError> {
        let mut records = self.records.write().await;
        if records.ips.contains(&record.ip) {
            return Err(ScanError::Validation(format!(
                "duplicate IP: {}",
                record.ip
            )));
        }
        records.ips.insert(record.ip.clone());
        records.list.push_back(record);
        self.evict_overflow(&mut records);
        self.refresh_counts(&records).await;
        Ok(())
    }

    /// Insert or refresh: an existing row for the same IP is replaced in
    /// place so live updates don't grow the ring.
    pub async fn add_or_update(&self, record: ResultRecord) {
        let mut records = self.records.write().await;
        if let Some(existing) = records.list.iter_mut().find(|r| r.ip == record.ip) {
            *existing = record;
        } else {
            records.ips.insert(record.ip.clone());
            records.list.push_back(record);
            self.evict_overflow(&mut records);
        }
        self.refresh_counts(&records).await;
    }

    fn evict_overflow(&self, records: &mut Records) {
        while records.list.len() > self.max_results {
            if let Some(oldest) = records.list.pop_front() {
                records.ips.remove(&oldest.ip);
            }
        }
    }

    /// Completed and qualified counters derived from the rows themselves,
    /// so they can never drift from what `list()` returns.
    async fn refresh_counts(&self, records: &Records) {
        let mut completed = 0;
        let mut qualified = 0;
        for r in &records.list {
            match r.status {
                ResultStatus::Complete => {
                    completed += 1;
                    qualified += 1;
                }
                ResultStatus::Invalid | ResultStatus::Skipped | ResultStatus::BelowFloor => {
                    completed += 1;
                }
                ResultStatus::Pending | ResultStatus::Probing | ResultStatus::Measuring => {}
            }
        }
        let mut stats = self.stats.write().await;
        stats.completed = completed;
        stats.qualified = qualified;
    }

    pub async fn list(&self) -> Vec<ResultRecord> {
        self.records.read().await.list.iter().cloned().collect()
    }

    pub async fn sorted(&self, key: SortKey, ascending: bool) -> Vec<ResultRecord> {
        let mut records = self.list().await;
        records.sort_by(|a, b| {
            let ord = match key {
                SortKey::Speed => a
                    .speed_mbps()
                    .unwrap_or(-1.0)
                    .partial_cmp(&b.speed_mbps().unwrap_or(-1.0))
                    .unwrap_or(std::cmp::Ordering::Equal),
                SortKey::Latency => a
                    .latency_ms()
                    .unwrap_or(f64::MAX)
                    .partial_cmp(&b.latency_ms().unwrap_or(f64::MAX))
                    .unwrap_or(std::cmp::Ordering::Equal),
                SortKey::Colo => a.colo.cmp(&b.colo),
                SortKey::Ip => a.ip.cmp(&b.ip),
            };
            if ascending {
                ord
            } else {
                ord.reverse()
            }
        });
        records
    }

    /// Only fully completed rows.
    pub async fn qualified(&self) -> Vec<ResultRecord> {
        self.records
            .read()
            .await
            .list
            .iter()
            .filter(|r| r.status == ResultStatus::Complete)
            .cloned()
            .collect()
    }

    /// Completed rows whose measured speed meets the floor.
    pub async fn qualified_count(&self, bandwidth_floor: f64) -> usize {
        self.records
            .read()
            .await
            .list
            .iter()
            .filter(|r| {
                r.status == ResultStatus::Complete
                    && r.speed_mbps().map(|s| s >= bandwidth_floor).unwrap_or(false)
            })
            .count()
    }

    pub async fn stats(&self) -> RunStats {
        self.stats.read().await.clone()
    }

    pub async fn set_total(&self, total: usize) {
        self.stats.write().await.total = total;
    }

    pub async fn set_current(&self, ip: &str, speed: &str) {
        let mut stats = self.stats.write().await;
        stats.current_ip = ip.to_owned();
        stats.current_speed = speed.to_owned();
    }

    pub async fn has_ip(&self, ip: &str) -> bool {
        self.records.read().await.ips.contains(ip)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.list.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn clear(&self) {
        let mut records = self.records.write().await;
        records.list.clear();
        records.ips.clear();
        *self.stats.write().await = RunStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ip: &str, status: ResultStatus, speed: &str) -> ResultRecord {
        ResultRecord {
            ip: ip.into(),
            status,
            latency: "25.00".into(),
            speed: speed.into(),
            peak_speed: 0.0,
            colo: "Los Angeles (LAX)".into(),
        }
    }

    #[tokio::test]
    async fn add_rejects_duplicate_ip() {
        let store = ResultStore::new(10);
        store
            .add(record("1.1.1.1", ResultStatus::Complete, "150.00"))
            .await
            .unwrap();
        let err = store
            .add(record("1.1.1.1", ResultStatus::Complete, "150.00"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("duplicate IP"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn add_or_update_replaces_in_place() {
        let store = ResultStore::new(10);
        store
            .add_or_update(record("1.1.1.1", ResultStatus::Measuring, ""))
            .await;
        store
            .add_or_update(record("1.1.1.1", ResultStatus::Complete, "200.00"))
            .await;
        assert_eq!(store.len().await, 1);
        let rows = store.list().await;
        assert_eq!(rows[0].status, ResultStatus::Complete);
        assert_eq!(store.stats().await.completed, 1);
        assert_eq!(store.stats().await.qualified, 1);
    }

    #[tokio::test]
    async fn overflow_evicts_oldest_and_frees_its_ip() {
        let store = ResultStore::new(2);
        for i in 0..3 {
            store
                .add(record(
                    &format!("1.1.1.{i}"),
                    ResultStatus::Complete,
                    "100.00",
                ))
                .await
                .unwrap();
        }
        assert_eq!(store.len().await, 2);
        assert!(!store.has_ip("1.1.1.0").await);
        // The evicted IP can be inserted again.
        store
            .add(record("1.1.1.0", ResultStatus::Complete, "100.00"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sorted_by_speed_descending() {
        let store = ResultStore::new(10);
        store
            .add(record("1.1.1.1", ResultStatus::Complete, "50.00"))
            .await
            .unwrap();
        store
            .add(record("1.1.1.2", ResultStatus::Invalid, "timeout"))
            .await
            .unwrap();
        store
            .add(record("1.1.1.3", ResultStatus::Complete, "300.00"))
            .await
            .unwrap();
        let rows = store.sorted(SortKey::Speed, false).await;
        assert_eq!(rows[0].ip, "1.1.1.3");
        assert_eq!(rows[1].ip, "1.1.1.1");
        // Unparseable speed sorts last.
        assert_eq!(rows[2].ip, "1.1.1.2");
    }

    #[tokio::test]
    async fn qualified_filters_by_status_and_floor() {
        let store = ResultStore::new(10);
        store
            .add(record("1.1.1.1", ResultStatus::Complete, "250.00"))
            .await
            .unwrap();
        store
            .add(record("1.1.1.2", ResultStatus::BelowFloor, "20.00"))
            .await
            .unwrap();
        store
            .add(record("1.1.1.3", ResultStatus::Complete, "120.00"))
            .await
            .unwrap();
        assert_eq!(store.qualified().await.len(), 2);
        assert_eq!(store.qualified_count(200.0).await, 1);
        assert_eq!(store.qualified_count(100.0).await, 2);
    }

    #[tokio::test]
    async fn counts_stay_monotone_through_a_run() {
        let store = ResultStore::new(10);
        store.set_total(5).await;
        for i in 0..3 {
            store
                .add(record(
                    &format!("2.2.2.{i}"),
                    ResultStatus::Complete,
                    "150.00",
                ))
                .await
                .unwrap();
            let stats = store.stats().await;
            assert!(stats.qualified <= stats.completed);
            assert!(stats.completed <= stats.total);
        }
    }

    #[tokio::test]
    async fn clear_resets_everything() {
        let store = ResultStore::new(10);
        store
            .add(record("1.1.1.1", ResultStatus::Complete, "100.00"))
            .await
            .unwrap();
        store.set_current("1.1.1.1", "100.00").await;
        store.clear().await;
        assert!(store.is_empty().await);
        let stats = store.stats().await;
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.current_ip, "");
    }
}
