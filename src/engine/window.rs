//! Throughput windows: the per-test sliding window that turns byte samples
//! into a stable Mbps figure, and a reusable time-bounded estimator that
//! dashboards can poll for a smoothed reading.

use std::collections::VecDeque;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// One throughput sample: cumulative bytes at a point in time.
#[derive(Debug, Clone)]
pub struct SpeedSample {
    pub taken_at: Instant,
    pub mbps: f64,
    pub bytes: u64,
    pub elapsed_s: f64,
}

/// Window speed between the first and last sample: `Δbytes·8 / (Δs·1e6)`.
/// Falls back to the arithmetic mean of the instantaneous readings when the
/// deltas aren't both positive (e.g. a stalled stream).
pub fn window_speed(samples: &VecDeque<SpeedSample>) -> f64 {
    let (first, last) = match (samples.front(), samples.back()) {
        (Some(f), Some(l)) => (f, l),
        _ => return 0.0,
    };
    if samples.len() == 1 {
        return first.mbps;
    }
    let byte_delta = last.bytes.saturating_sub(first.bytes);
    let time_delta = last.elapsed_s - first.elapsed_s;
    if byte_delta > 0 && time_delta > 0.0 {
        (byte_delta as f64 * 8.0) / (time_delta * 1_000_000.0)
    } else {
        samples.iter().map(|s| s.mbps).sum::<f64>() / samples.len() as f64
    }
}

/// Summary of the estimator's current contents.
#[derive(Debug, Clone)]
pub struct WindowStats {
    pub count: usize,
    pub min_mbps: f64,
    pub max_mbps: f64,
    pub avg_mbps: f64,
    pub smoothed_mbps: f64,
    pub oldest_age_s: f64,
    pub newest_age_s: f64,
}

/// Sliding-window estimator bounded both by sample count and by wall-clock
/// age. Readers and the sampling writer share it through the inner lock.
pub struct SlidingWindow {
    max_size: usize,
    max_age: Duration,
    samples: RwLock<VecDeque<SpeedSample>>,
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new(100, Duration::from_secs(30))
    }
}

impl SlidingWindow {
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        Self {
            max_size,
            max_age,
            samples: RwLock::new(VecDeque::with_capacity(max_size)),
        }
    }

    /// Append a sample, evicting aged-out entries from the head and then
    /// truncating to the size bound.
    pub fn add(&self, sample: SpeedSample) {
        let mut samples = self.samples.write().expect("window lock");
        samples.push_back(sample);
        if let Some(cutoff) = Instant::now().checked_sub(self.max_age) {
            while matches!(samples.front(), Some(s) if s.taken_at < cutoff) {
                samples.pop_front();
            }
        }
        while samples.len() > self.max_size {
            samples.pop_front();
        }
    }

    /// Weighted average where each sample's weight is recency × position:
    /// `recency = 1/(1 + age_s/10)`, `position = index/count` (1-based from
    /// the oldest). Recent samples dominate; an empty window reads 0.
    pub fn smoothed(&self) -> f64 {
        let samples = self.samples.read().expect("window lock");
        if samples.is_empty() {
            return 0.0;
        }
        if samples.len() == 1 {
            return samples[0].mbps;
        }
        let now = Instant::now();
        let count = samples.len() as f64;
        let mut weighted_sum = 0.0;
        let mut total_weight = 0.0;
        for (i, sample) in samples.iter().enumerate() {
            let age = now.duration_since(sample.taken_at).as_secs_f64();
            let recency = 1.0 / (1.0 + age / 10.0);
            let position = (i + 1) as f64 / count;
            let weight = recency * position;
            weighted_sum += sample.mbps * weight;
            total_weight += weight;
        }
        if total_weight > 0.0 {
            weighted_sum / total_weight
        } else {
            0.0
        }
    }

    /// Up to `k` newest samples, oldest first.
    pub fn recent(&self, k: usize) -> Vec<SpeedSample> {
        let samples = self.samples.read().expect("window lock");
        if k == 0 || samples.is_empty() {
            return Vec::new();
        }
        let start = samples.len().saturating_sub(k);
        samples.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.read().expect("window lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> WindowStats {
        let smoothed = self.smoothed();
        let samples = self.samples.read().expect("window lock");
        if samples.is_empty() {
            return WindowStats {
                count: 0,
                min_mbps: 0.0,
                max_mbps: 0.0,
                avg_mbps: 0.0,
                smoothed_mbps: 0.0,
                oldest_age_s: 0.0,
                newest_age_s: 0.0,
            };
        }
        let now = Instant::now();
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        let mut sum = 0.0;
        for s in samples.iter() {
            min = min.min(s.mbps);
            max = max.max(s.mbps);
            sum += s.mbps;
        }
        WindowStats {
            count: samples.len(),
            min_mbps: min,
            max_mbps: max,
            avg_mbps: sum / samples.len() as f64,
            smoothed_mbps: smoothed,
            oldest_age_s: now
                .duration_since(samples.front().expect("non-empty").taken_at)
                .as_secs_f64(),
            newest_age_s: now
                .duration_since(samples.back().expect("non-empty").taken_at)
                .as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(mbps: f64, bytes: u64, elapsed_s: f64) -> SpeedSample {
        SpeedSample {
            taken_at: Instant::now(),
            mbps,
            bytes,
            elapsed_s,
        }
    }

    #[test]
    fn window_speed_uses_deltas() {
        let mut w = VecDeque::new();
        w.push_back(sample(10.0, 1_000_000, 1.0));
        w.push_back(sample(50.0, 11_000_000, 2.0));
        // (10e6 bytes * 8) / (1 s * 1e6) = 80 Mbps
        assert!((window_speed(&w) - 80.0).abs() < 1e-9);
    }

    #[test]
    fn window_speed_falls_back_to_mean_on_stall() {
        let mut w = VecDeque::new();
        w.push_back(sample(10.0, 5_000_000, 1.0));
        w.push_back(sample(30.0, 5_000_000, 2.0));
        assert!((window_speed(&w) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn window_speed_edge_cases() {
        let mut w = VecDeque::new();
        assert_eq!(window_speed(&w), 0.0);
        w.push_back(sample(42.0, 1, 0.5));
        assert_eq!(window_speed(&w), 42.0);
    }

    #[test]
    fn peak_exceeds_late_samples() {
        // Samples at 10, 100, 300, 200 Mbps over 2 s: the peak window speed
        // must capture the 300 burst even though the test ends lower.
        let mut win: VecDeque<SpeedSample> = VecDeque::new();
        let mut peak: f64 = 0.0;
        let mut bytes = 0u64;
        for (i, mbps) in [10.0, 100.0, 300.0, 200.0].iter().enumerate() {
            let elapsed = 0.5 * (i + 1) as f64;
            bytes += (mbps * 0.5 * 1_000_000.0 / 8.0) as u64;
            win.push_back(sample(*mbps, bytes, elapsed));
            if win.len() > 10 {
                win.pop_front();
            }
            peak = peak.max(window_speed(&win));
        }
        assert!(peak >= 200.0, "peak was {peak}");
    }

    #[test]
    fn smoothed_is_zero_when_empty() {
        let w = SlidingWindow::default();
        assert_eq!(w.smoothed(), 0.0);
    }

    #[test]
    fn smoothed_weights_recent_samples_higher() {
        let w = SlidingWindow::default();
        for _ in 0..5 {
            w.add(sample(10.0, 0, 0.0));
        }
        for _ in 0..5 {
            w.add(sample(100.0, 0, 0.0));
        }
        let s = w.smoothed();
        // Position weighting pulls the average well above the midpoint.
        assert!(s > 55.0, "smoothed {s}");
        assert!(s < 100.0);
    }

    #[test]
    fn smoothed_of_constant_stream_is_that_value() {
        let w = SlidingWindow::default();
        for _ in 0..10 {
            w.add(sample(75.0, 0, 0.0));
        }
        assert!((w.smoothed() - 75.0).abs() < 1e-6);
    }

    #[test]
    fn size_bound_evicts_oldest() {
        let w = SlidingWindow::new(3, Duration::from_secs(30));
        for i in 0..5 {
            w.add(sample(i as f64, 0, 0.0));
        }
        let recent = w.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].mbps, 2.0);
        assert_eq!(recent[2].mbps, 4.0);
    }

    #[test]
    fn recent_returns_newest_k() {
        let w = SlidingWindow::default();
        for i in 0..6 {
            w.add(sample(i as f64, 0, 0.0));
        }
        let r = w.recent(2);
        assert_eq!(r.len(), 2);
        assert_eq!(r[0].mbps, 4.0);
        assert_eq!(r[1].mbps, 5.0);
        assert!(w.recent(0).is_empty());
    }

    #[test]
    fn stats_reports_min_max_avg() {
        let w = SlidingWindow::default();
        w.add(sample(10.0, 0, 0.0));
        w.add(sample(30.0, 0, 0.0));
        let stats = w.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.min_mbps, 10.0);
        assert_eq!(stats.max_mbps, 30.0);
        assert!((stats.avg_mbps - 20.0).abs() < 1e-9);
        assert!(stats.oldest_age_s >= stats.newest_age_s);
    }
}
