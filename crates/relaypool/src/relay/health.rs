use std::collections::VecDeque;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::RelayUrl;

/// One query or connection outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSample {
    pub endpoint: RelayUrl,
    pub latency: Duration,
    pub success: bool,
    pub timestamp: SystemTime,
}

impl HealthSample {
    pub fn success(endpoint: RelayUrl, latency: Duration) -> Self {
        Self {
            endpoint,
            latency,
            success: true,
            timestamp: SystemTime::now(),
        }
    }

    pub fn failure(endpoint: RelayUrl, latency: Duration) -> Self {
        Self {
            endpoint,
            latency,
            success: false,
            timestamp: SystemTime::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub const HEALTHY_THRESHOLD: f64 = 0.7;
    pub const DEGRADED_THRESHOLD: f64 = 0.4;

    pub fn from_score(score: f64) -> Self {
        if score >= Self::HEALTHY_THRESHOLD {
            HealthStatus::Healthy
        } else if score >= Self::DEGRADED_THRESHOLD {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// Read-only view of an endpoint's rolling metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metrics {
    pub health_score: f64,
    /// 0 until the first successful sample
    pub latency_ms: f64,
    pub success_rate: f64,
    pub total_requests: u64,
    pub is_healthy: bool,
    pub uptime: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Weight of the newest sample in the moving averages.
    pub alpha: f64,
    /// How many liveness checks make up the uptime window.
    pub uptime_window: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            uptime_window: 20,
        }
    }
}

#[derive(Debug, Default)]
struct EndpointHealth {
    success: Option<f64>,
    latency_ms: Option<f64>,
    score: Option<f64>,
    total_requests: u64,
    checks: VecDeque<bool>,
}

fn ewma(prev: Option<f64>, sample: f64, alpha: f64) -> f64 {
    match prev {
        Some(prev) => alpha * sample + (1.0 - alpha) * prev,
        None => sample,
    }
}

impl EndpointHealth {
    fn record(&mut self, sample: &HealthSample, alpha: f64) {
        self.total_requests += 1;
        let outcome = if sample.success { 1.0 } else { 0.0 };
        self.success = Some(ewma(self.success, outcome, alpha));

        // a failed query's latency says nothing about how fast the relay is
        if sample.success {
            let ms = sample.latency.as_secs_f64() * 1000.0;
            self.latency_ms = Some(ewma(self.latency_ms, ms, alpha));
        }

        // a success never lowers the score and a failure never raises it,
        // even when a slow success drags the latency average up
        let next = self.target_score();
        self.score = Some(match self.score {
            None => next,
            Some(prev) if sample.success => prev.max(next),
            Some(prev) => prev.min(next),
        });
    }

    fn record_check(&mut self, reachable: bool, window: usize) {
        self.checks.push_back(reachable);
        while self.checks.len() > window.max(1) {
            self.checks.pop_front();
        }
    }

    /// success * (0.6 + 0.4 * latency_factor), where latency_factor goes
    /// from 1 at 0ms towards 0, hitting 0.5 at one second.
    fn target_score(&self) -> f64 {
        let success = self.success.unwrap_or(0.0);
        let latency = match self.latency_ms {
            Some(ms) => 1.0 / (1.0 + ms.max(0.0) / 1000.0),
            None => 1.0,
        };
        (success * (0.6 + 0.4 * latency)).clamp(0.0, 1.0)
    }

    fn uptime(&self) -> f64 {
        if self.checks.is_empty() {
            return 0.0;
        }
        let up = self.checks.iter().filter(|c| **c).count();
        up as f64 / self.checks.len() as f64
    }

    fn metrics(&self) -> Option<Metrics> {
        // liveness checks alone don't make a score
        let health_score = self.score?;
        Some(Metrics {
            health_score,
            latency_ms: self.latency_ms.unwrap_or(0.0),
            success_rate: self.success.unwrap_or(0.0),
            total_requests: self.total_requests,
            is_healthy: HealthStatus::from_score(health_score) == HealthStatus::Healthy,
            uptime: self.uptime(),
        })
    }
}

/// Rolling per-endpoint health. The monitor is the only writer of these
/// metrics; everyone else reads snapshots.
#[derive(Debug, Default)]
pub struct HealthMonitor {
    config: HealthConfig,
    endpoints: RwLock<HashMap<RelayUrl, EndpointHealth>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<RelayUrl, EndpointHealth>> {
        self.endpoints
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<RelayUrl, EndpointHealth>> {
        self.endpoints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_outcome(&self, sample: HealthSample) {
        trace!(
            "health sample for {}: success={} latency={:?}",
            sample.endpoint,
            sample.success,
            sample.latency
        );
        let alpha = self.config.alpha.clamp(f64::EPSILON, 1.0);
        let mut endpoints = self.write();
        endpoints
            .entry(sample.endpoint.clone())
            .or_default()
            .record(&sample, alpha);
    }

    /// Feed one connection-check window into the uptime ratio.
    pub fn record_liveness(&self, endpoint: &RelayUrl, reachable: bool) {
        let window = self.config.uptime_window;
        let mut endpoints = self.write();
        endpoints
            .entry(endpoint.clone())
            .or_default()
            .record_check(reachable, window);
    }

    pub fn metrics(&self, endpoint: &RelayUrl) -> Option<Metrics> {
        self.read().get(endpoint).and_then(EndpointHealth::metrics)
    }

    /// Endpoints we know nothing about yet are treated as degraded: not
    /// trusted, but not written off either.
    pub fn health_status(&self, endpoint: &RelayUrl) -> HealthStatus {
        match self.metrics(endpoint) {
            Some(m) => HealthStatus::from_score(m.health_score),
            None => HealthStatus::Degraded,
        }
    }

    /// Score used when ranking endpoints. Unknown endpoints get the
    /// degraded floor so they can still be tried.
    pub fn score(&self, endpoint: &RelayUrl) -> f64 {
        self.metrics(endpoint)
            .map(|m| m.health_score)
            .unwrap_or(HealthStatus::DEGRADED_THRESHOLD)
    }

    pub fn reset(&self) {
        self.write().clear();
    }

    pub fn forget(&self, endpoint: &RelayUrl) {
        self.write().remove(endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> RelayUrl {
        RelayUrl::new("wss://relay.example.com").unwrap()
    }

    fn score(monitor: &HealthMonitor) -> f64 {
        monitor.metrics(&url()).unwrap().health_score
    }

    #[test]
    fn unknown_endpoint_has_no_metrics() {
        let monitor = HealthMonitor::default();
        assert!(monitor.metrics(&url()).is_none());
        assert_eq!(monitor.health_status(&url()), HealthStatus::Degraded);
    }

    #[test]
    fn failures_never_raise_the_score() {
        let monitor = HealthMonitor::default();
        for _ in 0..5 {
            monitor.record_outcome(HealthSample::success(url(), Duration::from_millis(120)));
        }

        let mut prev = score(&monitor);
        for _ in 0..30 {
            monitor.record_outcome(HealthSample::failure(url(), Duration::from_secs(8)));
            let next = score(&monitor);
            assert!(next <= prev, "{next} > {prev}");
            assert!((0.0..=1.0).contains(&next));
            prev = next;
        }
        assert_eq!(monitor.health_status(&url()), HealthStatus::Unhealthy);
    }

    #[test]
    fn successes_never_lower_the_score() {
        let monitor = HealthMonitor::default();
        for _ in 0..4 {
            monitor.record_outcome(HealthSample::failure(url(), Duration::ZERO));
        }

        let mut prev = score(&monitor);
        for _ in 0..30 {
            monitor.record_outcome(HealthSample::success(url(), Duration::from_millis(80)));
            let next = score(&monitor);
            assert!(next >= prev, "{next} < {prev}");
            assert!((0.0..=1.0).contains(&next));
            prev = next;
        }
        assert_eq!(monitor.health_status(&url()), HealthStatus::Healthy);
        assert!(monitor.metrics(&url()).unwrap().is_healthy);
    }

    #[test]
    fn slow_successes_never_lower_the_score() {
        let monitor = HealthMonitor::default();
        let mut prev = 0.0;
        for ms in [50, 50, 50, 2000, 8000, 120, 5000] {
            monitor.record_outcome(HealthSample::success(url(), Duration::from_millis(ms)));
            let next = score(&monitor);
            assert!(next >= prev, "score dropped from {prev} to {next} after {ms}ms");
            assert!((0.0..=1.0).contains(&next));
            prev = next;
        }
    }

    #[test]
    fn fast_failures_never_raise_the_score() {
        let monitor = HealthMonitor::default();
        monitor.record_outcome(HealthSample::success(url(), Duration::from_secs(6)));
        let mut prev = score(&monitor);
        for ms in [10, 5000, 1, 300] {
            monitor.record_outcome(HealthSample::failure(url(), Duration::from_millis(ms)));
            let next = score(&monitor);
            assert!(next <= prev, "score rose from {prev} to {next} on a failure");
            prev = next;
        }
    }

    #[test]
    fn slow_relays_score_lower() {
        let monitor = HealthMonitor::default();
        let fast = RelayUrl::new("wss://fast.example.com").unwrap();
        let slow = RelayUrl::new("wss://slow.example.com").unwrap();
        for _ in 0..3 {
            monitor.record_outcome(HealthSample::success(fast.clone(), Duration::from_millis(50)));
            monitor.record_outcome(HealthSample::success(slow.clone(), Duration::from_secs(4)));
        }
        assert!(monitor.score(&fast) > monitor.score(&slow));
        assert_eq!(monitor.health_status(&slow), HealthStatus::Degraded);
    }

    #[test]
    fn uptime_is_windowed() {
        let monitor = HealthMonitor::new(HealthConfig {
            uptime_window: 4,
            ..Default::default()
        });
        monitor.record_outcome(HealthSample::success(url(), Duration::from_millis(10)));
        for reachable in [false, false, true, true, true, true] {
            monitor.record_liveness(&url(), reachable);
        }
        assert_eq!(monitor.metrics(&url()).unwrap().uptime, 1.0);

        monitor.record_liveness(&url(), false);
        assert_eq!(monitor.metrics(&url()).unwrap().uptime, 0.75);
    }

    #[test]
    fn reset_forgets_everything() {
        let monitor = HealthMonitor::default();
        monitor.record_outcome(HealthSample::success(url(), Duration::from_millis(10)));
        assert_eq!(monitor.metrics(&url()).unwrap().total_requests, 1);
        monitor.reset();
        assert!(monitor.metrics(&url()).is_none());
    }
}
