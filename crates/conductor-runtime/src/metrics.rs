//! [`MetricsCollector`] – passive, never-blocking metrics sink.
//!
//! Producers call [`MetricsCollector::record`] (or the `incr` / `observe`
//! helpers) from any thread.  Samples land in a bounded queue; when the queue
//! is full the **oldest** sample is dropped and `dropped_samples` is
//! incremented, so robot control paths are never slowed down by metrics.
//!
//! A periodic [`MetricsCollector::aggregate`] moves queued samples into
//! per-series rolling windows (series = metric name + tag set) and evicts
//! anything older than the window.  [`MetricsCollector::snapshot`] computes
//! count, sum, min, max and p95 for every live series;
//! [`to_prometheus`] renders a snapshot in the Prometheus text format.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use conductor_types::{MetricSample, MonoTime, Timestamp};
use serde::{Deserialize, Serialize};

pub const DROPPED_SAMPLES_METRIC: &str = "conductor_metrics_dropped_samples_total";

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub window_ms: u64,
    pub queue_capacity: usize,
    pub aggregate_interval_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            queue_capacity: 4_096,
            aggregate_interval_ms: 1_000,
        }
    }
}

impl MetricsConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn aggregate_interval(&self) -> Duration {
        Duration::from_millis(self.aggregate_interval_ms.max(1))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Snapshot types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SeriesKey {
    name: String,
    tags: BTreeMap<String, String>,
}

/// Rolling-window statistics for one series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesSummary {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub series: Vec<SeriesSummary>,
    pub dropped_samples: u64,
    pub taken_at: Timestamp,
}

impl MetricsSnapshot {
    pub fn find(&self, name: &str, tags: &[(&str, &str)]) -> Option<&SeriesSummary> {
        self.series.iter().find(|s| {
            s.name == name
                && s.tags.len() == tags.len()
                && tags
                    .iter()
                    .all(|(k, v)| s.tags.get(*k).map(String::as_str) == Some(*v))
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MetricsCollector
// ────────────────────────────────────────────────────────────────────────────

pub struct MetricsCollector {
    config: MetricsConfig,
    queue: Mutex<VecDeque<MetricSample>>,
    dropped: AtomicU64,
    windows: Mutex<BTreeMap<SeriesKey, VecDeque<(MonoTime, f64)>>>,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        Self {
            config: MetricsConfig {
                queue_capacity: capacity,
                ..config
            },
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            dropped: AtomicU64::new(0),
            windows: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Enqueue a sample.  Never waits on aggregation.
    pub fn record(&self, sample: MetricSample) {
        let mut queue = lock(&self.queue);
        if queue.len() >= self.config.queue_capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(sample);
    }

    /// Record a counter increment of `1`.
    pub fn incr(&self, name: &str, tags: &[(&str, &str)]) {
        self.observe(name, 1.0, tags);
    }

    pub fn observe(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        let sample = tags
            .iter()
            .fold(MetricSample::new(name, value), |s, (k, v)| s.with_tag(*k, *v));
        self.record(sample);
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Move queued samples into their rolling windows and evict samples
    /// older than `now - window`.
    pub fn aggregate(&self, now: MonoTime) {
        let drained: Vec<MetricSample> = lock(&self.queue).drain(..).collect();
        let cutoff = now.saturating_sub(self.config.window());

        let mut windows = lock(&self.windows);
        for sample in drained {
            if sample.timestamp.mono < cutoff {
                continue;
            }
            let key = SeriesKey {
                name: sample.name,
                tags: sample.tags,
            };
            windows
                .entry(key)
                .or_default()
                .push_back((sample.timestamp.mono, sample.value));
        }
        windows.retain(|_, points| {
            points.retain(|(at, _)| *at >= cutoff);
            !points.is_empty()
        });
    }

    /// Aggregate, then summarise every live series.
    pub fn snapshot(&self, now: MonoTime) -> MetricsSnapshot {
        self.aggregate(now);
        let windows = lock(&self.windows);
        let series = windows
            .iter()
            .map(|(key, points)| summarise(key, points))
            .collect();
        MetricsSnapshot {
            series,
            dropped_samples: self.dropped_samples(),
            taken_at: Timestamp::at(now),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn summarise(key: &SeriesKey, points: &VecDeque<(MonoTime, f64)>) -> SeriesSummary {
    let mut values: Vec<f64> = points.iter().map(|(_, v)| *v).collect();
    values.sort_by(f64::total_cmp);
    SeriesSummary {
        name: key.name.clone(),
        tags: key.tags.clone(),
        count: values.len() as u64,
        sum: values.iter().sum(),
        min: values.first().copied().unwrap_or(0.0),
        max: values.last().copied().unwrap_or(0.0),
        p95: nearest_rank(&values, 0.95),
    }
}

/// Nearest-rank percentile over sorted `values`.
fn nearest_rank(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let rank = (p * values.len() as f64).ceil() as usize;
    values[rank.clamp(1, values.len()) - 1]
}

// ────────────────────────────────────────────────────────────────────────────
// Prometheus text format
// ────────────────────────────────────────────────────────────────────────────

/// Render `snapshot` in the Prometheus text exposition format.
///
/// Each series name becomes a summary family (`_count`, `_sum` and the
/// `0.95` quantile) over the rolling window, followed by `<name>_min` and
/// `<name>_max` gauge families.  The dropped-sample counter is exported as a
/// plain counter.
pub fn to_prometheus(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();
    for family in snapshot.series.chunk_by(|a, b| a.name == b.name) {
        let name = sanitize(&family[0].name);

        let _ = writeln!(out, "# TYPE {name} summary");
        for s in family {
            let labels = render_labels(&s.tags, None);
            let quantile = render_labels(&s.tags, Some(("quantile", "0.95")));
            let _ = writeln!(out, "{name}{quantile} {}", s.p95);
            let _ = writeln!(out, "{name}_sum{labels} {}", s.sum);
            let _ = writeln!(out, "{name}_count{labels} {}", s.count);
        }

        let gauges: [(&str, fn(&SeriesSummary) -> f64); 2] =
            [("min", |s| s.min), ("max", |s| s.max)];
        for (suffix, pick) in gauges {
            let _ = writeln!(out, "# TYPE {name}_{suffix} gauge");
            for s in family {
                let labels = render_labels(&s.tags, None);
                let _ = writeln!(out, "{name}_{suffix}{labels} {}", pick(s));
            }
        }
    }
    let _ = writeln!(out, "# TYPE {DROPPED_SAMPLES_METRIC} counter");
    let _ = writeln!(out, "{DROPPED_SAMPLES_METRIC} {}", snapshot.dropped_samples);
    out
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == ':' { c } else { '_' })
        .collect()
}

fn render_labels(tags: &BTreeMap<String, String>, extra: Option<(&str, &str)>) -> String {
    let mut pairs: Vec<String> = tags
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", sanitize(k), escape(v)))
        .collect();
    if let Some((k, v)) = extra {
        pairs.push(format!("{k}=\"{v}\""));
    }
    if pairs.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", pairs.join(","))
    }
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
