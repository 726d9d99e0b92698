use prometheus::core::Metric;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ingest_fetch=info,runner_container=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Upper bounds, in seconds, of the duration histogram buckets.
const DURATION_BUCKETS: [f64; 10] = [0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0, 10.0];

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum_seconds: f64,
    /// `(upper bound in seconds, cumulative count)` pairs.
    pub buckets: Vec<(f64, u64)>,
}

impl HistogramSnapshot {
    fn of(histogram: &Histogram) -> Self {
        let metric = histogram.metric();
        let buckets = metric
            .get_histogram()
            .get_bucket()
            .iter()
            .map(|b| (b.get_upper_bound(), b.get_cumulative_count()))
            .collect();
        Self {
            count: histogram.get_sample_count(),
            sum_seconds: histogram.get_sample_sum(),
            buckets,
        }
    }
}

/// Metrics of one partition fetcher. Shared between the fetch workers,
/// the ordering loop and the consumer. Every metric is registered in the
/// fetcher's own [`Registry`], which an exporter can gather from.
#[derive(Debug)]
pub struct FetcherMetrics {
    registry: Registry,
    /// How long the consumer waited for the next ordered fetch.
    pub fetch_wait_duration: Histogram,
    /// How long an ordered fetch waited for the consumer to pick it up.
    pub consumption_wait_duration: Histogram,
    /// Bytes of records fetched more than once and dropped before delivery.
    pub fetched_discarded_record_bytes: IntCounter,
    pub fetch_requests: IntCounter,
    pub fetch_errors: IntCounter,
    pub fetched_records: IntCounter,
    pub fetched_bytes: IntCounter,
    /// Records fetched but not yet returned to the consumer.
    pub buffered_records: IntGauge,
}

impl FetcherMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let histogram = |name: &str, help: &str| -> prometheus::Result<Histogram> {
            let histogram =
                Histogram::with_opts(HistogramOpts::new(name, help).buckets(DURATION_BUCKETS.to_vec()))?;
            registry.register(Box::new(histogram.clone()))?;
            Ok(histogram)
        };
        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let fetch_wait_duration = histogram(
            "ingest_fetch_wait_duration_seconds",
            "How long the consumer waited for the next ordered fetch.",
        )?;
        let consumption_wait_duration = histogram(
            "ingest_fetch_consumption_wait_duration_seconds",
            "How long a fetched result waited to be consumed.",
        )?;
        let fetched_discarded_record_bytes = counter(
            "ingest_fetch_discarded_record_bytes_total",
            "Bytes of records fetched more than once and dropped.",
        )?;
        let fetch_requests = counter("ingest_fetch_requests_total", "Fetch requests sent.")?;
        let fetch_errors = counter("ingest_fetch_errors_total", "Fetch requests that failed.")?;
        let fetched_records = counter("ingest_fetch_records_total", "Records fetched.")?;
        let fetched_bytes = counter("ingest_fetch_bytes_total", "Bytes fetched.")?;
        let buffered_records = IntGauge::new(
            "ingest_fetch_buffered_records",
            "Records fetched but not yet returned to the consumer.",
        )?;
        registry.register(Box::new(buffered_records.clone()))?;

        Ok(Self {
            registry,
            fetch_wait_duration,
            consumption_wait_duration,
            fetched_discarded_record_bytes,
            fetch_requests,
            fetch_errors,
            fetched_records,
            fetched_bytes,
            buffered_records,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn snapshot(&self) -> FetcherMetricsSnapshot {
        FetcherMetricsSnapshot {
            fetch_wait_duration: HistogramSnapshot::of(&self.fetch_wait_duration),
            consumption_wait_duration: HistogramSnapshot::of(&self.consumption_wait_duration),
            fetched_discarded_record_bytes: self.fetched_discarded_record_bytes.get(),
            fetch_requests: self.fetch_requests.get(),
            fetch_errors: self.fetch_errors.get(),
            fetched_records: self.fetched_records.get(),
            fetched_bytes: self.fetched_bytes.get(),
            buffered_records: self.buffered_records.get(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FetcherMetricsSnapshot {
    pub fetch_wait_duration: HistogramSnapshot,
    pub consumption_wait_duration: HistogramSnapshot,
    pub fetched_discarded_record_bytes: u64,
    pub fetch_requests: u64,
    pub fetch_errors: u64,
    pub fetched_records: u64,
    pub fetched_bytes: u64,
    pub buffered_records: i64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct IngestMetrics {
    pub batches_processed: usize,
    pub records_processed: usize,
    pub bytes_processed: u64,
    pub empty_polls: usize,
    pub last_consumed_offset: Option<i64>,
    pub fetcher: Option<FetcherMetricsSnapshot>,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let metrics = FetcherMetrics::new().unwrap();
        for duration in [Duration::from_millis(3), Duration::from_millis(200), Duration::from_secs(60)] {
            metrics.fetch_wait_duration.observe(duration.as_secs_f64());
        }

        let snapshot = metrics.snapshot().fetch_wait_duration;
        assert_eq!(snapshot.count, 3);
        assert!((snapshot.sum_seconds - 60.203).abs() < 1e-9);
        assert_eq!(snapshot.buckets[0], (0.001, 0));
        assert_eq!(snapshot.buckets[1], (0.005, 1));
        assert_eq!(snapshot.buckets[5], (0.25, 2));
        // Observations above the last bound are only part of count and sum.
        assert_eq!(snapshot.buckets.last(), Some(&(10.0, 2)));
    }

    #[test]
    fn test_metrics_snapshot_serializes() {
        let metrics = FetcherMetrics::new().unwrap();
        metrics.fetch_requests.inc_by(2);
        metrics.fetched_discarded_record_bytes.inc_by(128);
        metrics.buffered_records.set(7);

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["fetch_requests"], 2);
        assert_eq!(json["fetched_discarded_record_bytes"], 128);
        assert_eq!(json["buffered_records"], 7);
        assert_eq!(json["fetch_wait_duration"]["count"], 0);
    }

    #[test]
    fn test_metrics_are_registered() {
        let metrics = FetcherMetrics::new().unwrap();
        metrics.fetch_errors.inc();

        let families = metrics.registry().gather();
        let errors = families
            .iter()
            .find(|f| f.get_name() == "ingest_fetch_errors_total")
            .unwrap();
        assert_eq!(errors.get_metric()[0].get_counter().get_value(), 1.0);
        assert_eq!(families.len(), 8);
    }
}
