//! Per-attempt call duration metrics
//!
//! Every attempt against a plugin, including a probe that is thrown away
//! because the plugin answered `Unimplemented`, produces exactly one
//! observation labeled by plugin, full method path and status code.

use crate::transport::{Code, Status};
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub const OPERATIONS_DURATION_METRIC: &str = "dra_grpc_operations_duration_seconds";

/// Prometheus client default buckets, in seconds
pub const DEFAULT_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

const MAX_RECENT_OBSERVATIONS: usize = 10_000;

/// Backend seam for call metrics.
pub trait OperationObserver: Send + Sync {
    fn observe(&self, plugin: &str, method: &str, code: Code, elapsed: Duration);
}

/// Discards every observation
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl OperationObserver for NoopObserver {
    fn observe(&self, _plugin: &str, _method: &str, _code: Code, _elapsed: Duration) {}
}

/// Wraps each outbound attempt with duration/outcome recording.
#[derive(Clone)]
pub struct MetricsInterceptor {
    plugin: String,
    observer: Arc<dyn OperationObserver>,
}

impl MetricsInterceptor {
    pub fn new(plugin: impl Into<String>, observer: Arc<dyn OperationObserver>) -> Self {
        Self {
            plugin: plugin.into(),
            observer,
        }
    }

    pub async fn intercept<T, F>(&self, method: &str, call: F) -> Result<T, Status>
    where
        F: Future<Output = Result<T, Status>>,
    {
        let start = Instant::now();
        let result = call.await;
        let code = match &result {
            Ok(_) => Code::Ok,
            Err(status) => status.code,
        };
        self.observer.observe(&self.plugin, method, code, start.elapsed());
        result
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub plugin: String,
    pub method: String,
    pub code: Code,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SeriesKey {
    plugin: String,
    method: String,
    code: &'static str,
}

#[derive(Debug, Clone)]
struct Histogram {
    /// Cumulative counts per upper bound
    buckets: Vec<u64>,
    count: u64,
    sum: f64,
}

#[derive(Default)]
struct Inner {
    series: BTreeMap<SeriesKey, Histogram>,
    recent: VecDeque<Observation>,
}

/// In-memory duration histogram, one series per (plugin, method, code).
pub struct OperationsDuration {
    bounds: Vec<f64>,
    inner: Mutex<Inner>,
}

impl OperationsDuration {
    pub fn new() -> Self {
        Self::with_buckets(DEFAULT_BUCKETS.to_vec())
    }

    pub fn with_buckets(bounds: Vec<f64>) -> Self {
        Self {
            bounds,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Most recent raw observations, oldest first
    pub fn observations(&self) -> Vec<Observation> {
        self.lock().recent.iter().cloned().collect()
    }

    /// Number of observations in one series
    pub fn count(&self, plugin: &str, method: &str, code: Code) -> u64 {
        let key = SeriesKey {
            plugin: plugin.to_string(),
            method: method.to_string(),
            code: code.as_str(),
        };
        self.lock().series.get(&key).map_or(0, |h| h.count)
    }

    pub fn total(&self) -> u64 {
        self.lock().series.values().map(|h| h.count).sum()
    }

    /// Prometheus text exposition of the histogram
    pub fn render(&self) -> String {
        let inner = self.lock();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "# HELP {} Duration in seconds of the plugin calls made by the node agent",
            OPERATIONS_DURATION_METRIC
        );
        let _ = writeln!(out, "# TYPE {} histogram", OPERATIONS_DURATION_METRIC);

        for (key, histogram) in &inner.series {
            let labels = format!(
                "driver_name=\"{}\",method_name=\"{}\",grpc_status_code=\"{}\"",
                key.plugin, key.method, key.code
            );
            for (bound, count) in self.bounds.iter().zip(&histogram.buckets) {
                let _ = writeln!(
                    out,
                    "{}_bucket{{{},le=\"{}\"}} {}",
                    OPERATIONS_DURATION_METRIC, labels, bound, count
                );
            }
            let _ = writeln!(
                out,
                "{}_bucket{{{},le=\"+Inf\"}} {}",
                OPERATIONS_DURATION_METRIC, labels, histogram.count
            );
            let _ = writeln!(
                out,
                "{}_sum{{{}}} {}",
                OPERATIONS_DURATION_METRIC, labels, histogram.sum
            );
            let _ = writeln!(
                out,
                "{}_count{{{}}} {}",
                OPERATIONS_DURATION_METRIC, labels, histogram.count
            );
        }

        out
    }
}

impl Default for OperationsDuration {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationObserver for OperationsDuration {
    fn observe(&self, plugin: &str, method: &str, code: Code, elapsed: Duration) {
        let seconds = elapsed.as_secs_f64();
        let key = SeriesKey {
            plugin: plugin.to_string(),
            method: method.to_string(),
            code: code.as_str(),
        };

        let mut inner = self.lock();
        let histogram = inner.series.entry(key).or_insert_with(|| Histogram {
            buckets: vec![0; self.bounds.len()],
            count: 0,
            sum: 0.0,
        });
        for (bound, bucket) in self.bounds.iter().zip(histogram.buckets.iter_mut()) {
            if seconds <= *bound {
                *bucket += 1;
            }
        }
        histogram.count += 1;
        histogram.sum += seconds;

        inner.recent.push_back(Observation {
            plugin: plugin.to_string(),
            method: method.to_string(),
            code,
            elapsed,
        });
        if inner.recent.len() > MAX_RECENT_OBSERVATIONS {
            inner.recent.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_interceptor_records_success_and_failure() {
        let recorder = Arc::new(OperationsDuration::new());
        let interceptor = MetricsInterceptor::new("driver-A", recorder.clone());

        let ok: Result<u32, Status> = interceptor
            .intercept("/v1beta1.Node/NodePrepareResources", async { Ok(1) })
            .await;
        assert_eq!(ok.unwrap(), 1);

        let err: Result<u32, Status> = interceptor
            .intercept("/v1beta1.Node/NodePrepareResources", async {
                Err(Status::unimplemented("unknown service v1beta1.Node"))
            })
            .await;
        assert!(err.is_err());

        let observations = recorder.observations();
        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].code, Code::Ok);
        assert_eq!(observations[1].code, Code::Unimplemented);
        assert_eq!(
            recorder.count("driver-A", "/v1beta1.Node/NodePrepareResources", Code::Ok),
            1
        );
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let recorder = OperationsDuration::with_buckets(vec![0.1, 1.0]);
        recorder.observe("p", "m", Code::Ok, Duration::from_millis(50));
        recorder.observe("p", "m", Code::Ok, Duration::from_millis(500));
        recorder.observe("p", "m", Code::Ok, Duration::from_secs(3));

        let text = recorder.render();
        assert!(text.contains("le=\"0.1\"} 1"));
        assert!(text.contains("le=\"1\"} 2"));
        assert!(text.contains("le=\"+Inf\"} 3"));
        assert!(text.contains("grpc_status_code=\"OK\""));
        assert_eq!(recorder.total(), 3);
    }

    #[test]
    fn test_recent_observations_are_bounded() {
        let recorder = OperationsDuration::new();
        for _ in 0..(MAX_RECENT_OBSERVATIONS + 5) {
            recorder.observe("p", "m", Code::Ok, Duration::ZERO);
        }
        assert_eq!(recorder.observations().len(), MAX_RECENT_OBSERVATIONS);
        assert_eq!(recorder.total(), (MAX_RECENT_OBSERVATIONS + 5) as u64);
    }
}
