//! Sensor Fusion Engine.
//!
//! Collects [`SensorSample`]s from every module and closes one [`FusedFrame`]
//! per fixed window.  Windows are half-open (`[start, end)`), contiguous and
//! never overlap: each frame starts exactly where the previous one ended.
//!
//! Within a window, samples are grouped by `sensor_type` and the **most recent
//! non-Invalid** sample of each type wins.  Sensor types are heterogeneous, so
//! values are never averaged.
//!
//! ```text
//! completeness = expected types present / expected types   (1.0 if none expected)
//! confidence   = completeness × (1 − degraded_ratio)
//! ```
//!
//! where `degraded_ratio` is the fraction of included samples whose quality is
//! `Degraded`.  When confidence stays below `confidence_threshold` for
//! `degraded_after_frames` consecutive frames the engine reports the
//! worst-contributing module once via [`FusionOutput::Degraded`], and
//! [`FusionOutput::Recovered`] when a frame clears the threshold again.
//!
//! Only the latest frame and the last frame that met the threshold are kept.
//!
//! # Example
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use conductor_perception::fusion::{FusionConfig, FusionEngine, FusionOutput};
//! use conductor_types::{MonoTime, SensorSample, SensorValue};
//!
//! let mut expected = BTreeMap::new();
//! expected.insert("imu".to_string(), "body".to_string());
//! let config = FusionConfig { expected, ..FusionConfig::default() };
//!
//! let mut engine = FusionEngine::new(config, MonoTime::ZERO);
//! engine.ingest(
//!     SensorSample::new("body", "imu0", "imu", SensorValue::Vector(vec![0.0, 0.0, 9.8]))
//!         .at(MonoTime::from_millis(40)),
//! );
//!
//! let out = engine.tick(MonoTime::from_millis(100));
//! match &out[0] {
//!     FusionOutput::Frame(frame) => assert_eq!(frame.completeness, 1.0),
//!     other => panic!("unexpected {other:?}"),
//! }
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use conductor_types::{FusedFrame, MonoTime, SampleQuality, SensorSample};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Upper bound on buffered samples awaiting their window.
const MAX_PENDING: usize = 8192;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub window_ms: u64,
    /// Expected sensor types, each mapped to the module that produces it.
    pub expected: BTreeMap<String, String>,
    pub confidence_threshold: f64,
    pub degraded_after_frames: u32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            window_ms: 100,
            expected: BTreeMap::new(),
            confidence_threshold: 0.5,
            degraded_after_frames: 3,
        }
    }
}

impl FusionConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms.max(1))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Output types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum FusionOutput {
    Frame(FusedFrame),
    /// Confidence stayed below threshold for the configured number of frames.
    Degraded {
        module_id: String,
        confidence: f64,
        frames: u32,
    },
    /// First frame back above threshold after a `Degraded` report.
    Recovered { confidence: f64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusionStats {
    pub frames_produced: u64,
    pub samples_accepted: u64,
    /// Samples older than the open window.
    pub late_samples: u64,
    pub invalid_samples: u64,
    /// Samples shed because the pending buffer was full.
    pub overflow_samples: u64,
}

// ────────────────────────────────────────────────────────────────────────────
// FusionEngine
// ────────────────────────────────────────────────────────────────────────────

pub struct FusionEngine {
    config: FusionConfig,
    window: Duration,
    window_start: MonoTime,
    sequence: u64,
    pending: VecDeque<SensorSample>,
    latest: Option<FusedFrame>,
    last_known_good: Option<FusedFrame>,
    low_streak: u32,
    /// Per-module fault count accumulated over the current low streak.
    blame: HashMap<String, u32>,
    degraded_reported: bool,
    module_order: Vec<String>,
    stats: FusionStats,
}

impl FusionEngine {
    /// An engine whose first window opens at `start`.
    pub fn new(config: FusionConfig, start: MonoTime) -> Self {
        let window = config.window();
        let module_order = config.expected.values().cloned().collect();
        Self {
            config,
            window,
            window_start: start,
            sequence: 0,
            pending: VecDeque::new(),
            latest: None,
            last_known_good: None,
            low_streak: 0,
            blame: HashMap::new(),
            degraded_reported: false,
            module_order,
            stats: FusionStats::default(),
        }
    }

    /// Module registration order, used to break ties when picking the
    /// worst-contributing module.
    pub fn set_module_order(&mut self, order: Vec<String>) {
        self.module_order = order;
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Start of the currently open window.
    pub fn window_start(&self) -> MonoTime {
        self.window_start
    }

    pub fn latest(&self) -> Option<&FusedFrame> {
        self.latest.as_ref()
    }

    pub fn last_known_good(&self) -> Option<&FusedFrame> {
        self.last_known_good.as_ref()
    }

    pub fn stats(&self) -> FusionStats {
        self.stats
    }

    /// Buffer a sample for its window.  Returns `false` when it arrived too
    /// late to be included.
    pub fn ingest(&mut self, sample: SensorSample) -> bool {
        if sample.timestamp.mono < self.window_start {
            self.stats.late_samples += 1;
            debug!(
                sensor = %sample.sensor_id,
                module = %sample.module_id,
                "late sample discarded"
            );
            return false;
        }
        if self.pending.len() >= MAX_PENDING {
            self.pending.pop_front();
            self.stats.overflow_samples += 1;
        }
        if sample.quality == SampleQuality::Invalid {
            self.stats.invalid_samples += 1;
        } else {
            self.stats.samples_accepted += 1;
        }
        self.pending.push_back(sample);
        true
    }

    /// Close every window that ended at or before `now`.
    pub fn tick(&mut self, now: MonoTime) -> Vec<FusionOutput> {
        let mut outputs = Vec::new();
        loop {
            let window_end = self.window_start.saturating_add(self.window);
            if window_end > now {
                break;
            }
            self.close_window(window_end, &mut outputs);
            self.window_start = window_end;
        }
        outputs
    }

    fn close_window(&mut self, window_end: MonoTime, outputs: &mut Vec<FusionOutput>) {
        let window_start = self.window_start;
        let (in_window, later): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|s| s.timestamp.mono < window_end);
        self.pending = later;

        let mut faults: HashMap<String, u32> = HashMap::new();
        let mut best: BTreeMap<String, SensorSample> = BTreeMap::new();
        for sample in in_window {
            if sample.quality == SampleQuality::Invalid {
                *faults.entry(sample.module_id.clone()).or_default() += 1;
                continue;
            }
            let newer = best
                .get(&sample.sensor_type)
                .is_none_or(|b| sample.timestamp.mono >= b.timestamp.mono);
            if newer {
                best.insert(sample.sensor_type.clone(), sample);
            }
        }

        let mut samples_by_type: BTreeMap<String, Option<SensorSample>> = BTreeMap::new();
        let mut present = 0usize;
        for (sensor_type, module_id) in &self.config.expected {
            match best.remove(sensor_type) {
                Some(sample) => {
                    present += 1;
                    samples_by_type.insert(sensor_type.clone(), Some(sample));
                }
                None => {
                    *faults.entry(module_id.clone()).or_default() += 1;
                    samples_by_type.insert(sensor_type.clone(), None);
                }
            }
        }
        // Unexpected types are still reported, they just don't count towards
        // completeness.
        for (sensor_type, sample) in best {
            samples_by_type.insert(sensor_type, Some(sample));
        }

        let expected = self.config.expected.len();
        let completeness = if expected == 0 {
            1.0
        } else {
            present as f64 / expected as f64
        };

        let included: Vec<&SensorSample> = samples_by_type.values().flatten().collect();
        let degraded = included
            .iter()
            .filter(|s| s.quality == SampleQuality::Degraded)
            .inspect(|s| *faults.entry(s.module_id.clone()).or_default() += 1)
            .count();
        let degraded_ratio = if included.is_empty() {
            0.0
        } else {
            degraded as f64 / included.len() as f64
        };
        let confidence = score(completeness, degraded_ratio);

        self.sequence += 1;
        self.stats.frames_produced += 1;
        let frame = FusedFrame {
            sequence: self.sequence,
            window_start,
            window_end,
            samples_by_type,
            completeness,
            confidence,
        };

        if confidence < self.config.confidence_threshold {
            self.low_streak += 1;
            for (module_id, n) in faults {
                *self.blame.entry(module_id).or_default() += n;
            }
            if self.low_streak >= self.config.degraded_after_frames && !self.degraded_reported {
                if let Some(module_id) = self.worst_module() {
                    warn!(
                        module = %module_id,
                        confidence,
                        frames = self.low_streak,
                        "fusion confidence below threshold"
                    );
                    outputs.push(FusionOutput::Frame(frame.clone()));
                    outputs.push(FusionOutput::Degraded {
                        module_id,
                        confidence,
                        frames: self.low_streak,
                    });
                    self.degraded_reported = true;
                    self.latest = Some(frame);
                    return;
                }
            }
        } else {
            if self.degraded_reported {
                outputs.push(FusionOutput::Frame(frame.clone()));
                outputs.push(FusionOutput::Recovered { confidence });
                self.reset_streak();
                self.last_known_good = Some(frame.clone());
                self.latest = Some(frame);
                return;
            }
            self.reset_streak();
            self.last_known_good = Some(frame.clone());
        }
        outputs.push(FusionOutput::Frame(frame.clone()));
        self.latest = Some(frame);
    }

    fn reset_streak(&mut self) {
        self.low_streak = 0;
        self.blame.clear();
        self.degraded_reported = false;
    }

    /// Highest fault count; ties go to the earliest-registered module.
    fn worst_module(&self) -> Option<String> {
        let rank = |id: &str| {
            self.module_order
                .iter()
                .position(|m| m == id)
                .unwrap_or(usize::MAX)
        };
        self.blame
            .iter()
            .max_by(|(a_id, a_n), (b_id, b_n)| {
                a_n.cmp(b_n)
                    .then_with(|| rank(b_id).cmp(&rank(a_id)))
                    .then_with(|| b_id.cmp(a_id))
            })
            .map(|(id, _)| id.clone())
    }
}

/// `completeness × (1 − degraded_ratio)`, clamped to `[0, 1]`.
pub fn score(completeness: f64, degraded_ratio: f64) -> f64 {
    (completeness * (1.0 - degraded_ratio)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::SensorValue;

    fn ms(v: u64) -> MonoTime {
        MonoTime::from_millis(v)
    }

    fn sample(module: &str, sensor_type: &str, at: u64, value: f64) -> SensorSample {
        SensorSample::new(module, sensor_type, sensor_type, SensorValue::Vector(vec![value]))
            .at(ms(at))
    }

    fn config(expected: &[(&str, &str)]) -> FusionConfig {
        FusionConfig {
            expected: expected
                .iter()
                .map(|(t, m)| (t.to_string(), m.to_string()))
                .collect(),
            ..FusionConfig::default()
        }
    }

    fn frames(outputs: &[FusionOutput]) -> Vec<&FusedFrame> {
        outputs
            .iter()
            .filter_map(|o| match o {
                FusionOutput::Frame(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    // ------------------------------------------------------------------ windowing

    #[test]
    fn partial_window_yields_two_thirds_completeness() {
        let mut engine = FusionEngine::new(
            config(&[("imu", "body"), ("battery", "power"), ("temperature", "power")]),
            ms(0),
        );
        engine.ingest(sample("body", "imu", 10, 9.8));
        engine.ingest(sample("power", "battery", 50, 87.0));

        let out = engine.tick(ms(100));
        let f = frames(&out)[0];
        assert!((f.completeness - 2.0 / 3.0).abs() < 1e-9);
        assert!(f.sample("imu").is_some());
        assert!(f.sample("battery").is_some());
        assert_eq!(f.samples_by_type.get("temperature"), Some(&None));
    }

    #[test]
    fn frames_are_contiguous_and_fixed_width() {
        let mut engine = FusionEngine::new(config(&[]), ms(5));
        let mut all = Vec::new();
        for t in [30, 250, 260, 999, 1_000, 1_234] {
            all.extend(engine.tick(ms(t)));
        }
        let fs = frames(&all);
        assert!(fs.len() >= 10);
        for pair in fs.windows(2) {
            assert_eq!(pair[1].window_start, pair[0].window_end);
            assert_eq!(pair[1].sequence, pair[0].sequence + 1);
        }
        for f in &fs {
            assert_eq!(f.window_end.duration_since(f.window_start), Duration::from_millis(100));
        }
        assert_eq!(engine.window_start(), ms(1_205));
    }

    #[test]
    fn no_frame_before_window_closes() {
        let mut engine = FusionEngine::new(config(&[]), ms(0));
        assert!(engine.tick(ms(99)).is_empty());
        assert_eq!(engine.tick(ms(100)).len(), 1);
    }

    #[test]
    fn most_recent_valid_sample_wins() {
        let mut engine = FusionEngine::new(config(&[("imu", "body")]), ms(0));
        engine.ingest(sample("body", "imu", 10, 1.0));
        engine.ingest(sample("body", "imu", 80, 3.0));
        engine.ingest(sample("body", "imu", 40, 2.0));
        engine.ingest(sample("body", "imu", 90, 4.0).with_quality(SampleQuality::Invalid));

        let out = engine.tick(ms(100));
        let imu = frames(&out)[0].sample("imu").unwrap();
        assert_eq!(imu.value, SensorValue::Vector(vec![3.0]));
        assert_eq!(engine.stats().invalid_samples, 1);
    }

    #[test]
    fn samples_are_assigned_to_their_own_window() {
        let mut engine = FusionEngine::new(config(&[("imu", "body")]), ms(0));
        engine.ingest(sample("body", "imu", 150, 2.0));
        engine.ingest(sample("body", "imu", 100, 1.0));

        let out = engine.tick(ms(200));
        let fs = frames(&out);
        assert_eq!(fs.len(), 2);
        assert!(fs[0].sample("imu").is_none());
        assert_eq!(
            fs[1].sample("imu").map(|s| s.value.clone()),
            Some(SensorValue::Vector(vec![2.0]))
        );
    }

    #[test]
    fn late_samples_are_discarded() {
        let mut engine = FusionEngine::new(config(&[("imu", "body")]), ms(0));
        engine.tick(ms(100));
        assert!(!engine.ingest(sample("body", "imu", 50, 1.0)));
        assert_eq!(engine.stats().late_samples, 1);
        let out = engine.tick(ms(200));
        assert!(frames(&out)[0].sample("imu").is_none());
    }

    #[test]
    fn unexpected_types_do_not_affect_completeness() {
        let mut engine = FusionEngine::new(config(&[]), ms(0));
        engine.ingest(sample("arm", "force_torque", 5, 1.0));
        let out = engine.tick(ms(100));
        let f = frames(&out)[0];
        assert_eq!(f.completeness, 1.0);
        assert!(f.sample("force_torque").is_some());
    }

    // ------------------------------------------------------------------ scoring

    #[test]
    fn confidence_counts_degraded_samples() {
        let mut engine = FusionEngine::new(config(&[("imu", "body"), ("lidar", "head")]), ms(0));
        engine.ingest(sample("body", "imu", 10, 1.0));
        engine.ingest(sample("head", "lidar", 10, 1.0).with_quality(SampleQuality::Degraded));
        let out = engine.tick(ms(100));
        let f = frames(&out)[0];
        assert_eq!(f.completeness, 1.0);
        assert!((f.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn confidence_non_increasing_as_completeness_drops() {
        for ratio in [0.0, 0.25, 0.5, 1.0] {
            let mut previous = f64::INFINITY;
            for step in (0..=10).rev() {
                let completeness = step as f64 / 10.0;
                let c = score(completeness, ratio);
                assert!(c <= previous);
                assert!((0.0..=1.0).contains(&c));
                previous = c;
            }
        }
    }

    // ------------------------------------------------------------------ degradation

    #[test]
    fn sustained_low_confidence_reports_worst_module_once() {
        let mut engine = FusionEngine::new(
            config(&[("imu", "body"), ("lidar", "head"), ("camera", "head")]),
            ms(0),
        );
        engine.set_module_order(vec!["body".into(), "head".into()]);

        let mut degraded = Vec::new();
        for w in 0..6u64 {
            // Only the IMU reports: completeness 1/3.
            engine.ingest(sample("body", "imu", w * 100 + 10, 1.0));
            for o in engine.tick(ms((w + 1) * 100)) {
                if let FusionOutput::Degraded { module_id, frames, .. } = o {
                    degraded.push((module_id, frames));
                }
            }
        }
        assert_eq!(degraded, vec![("head".to_string(), 3)]);
        assert!(engine.last_known_good().is_none());
        assert_eq!(engine.latest().map(|f| f.sequence), Some(6));
    }

    #[test]
    fn ties_go_to_earliest_registered_module() {
        let mut engine =
            FusionEngine::new(config(&[("imu", "body"), ("lidar", "head")]), ms(0));
        engine.set_module_order(vec!["head".into(), "body".into()]);
        let mut reported = None;
        for w in 1..=3u64 {
            for o in engine.tick(ms(w * 100)) {
                if let FusionOutput::Degraded { module_id, .. } = o {
                    reported = Some(module_id);
                }
            }
        }
        assert_eq!(reported.as_deref(), Some("head"));
    }

    #[test]
    fn recovery_is_reported_after_degradation() {
        let mut engine = FusionEngine::new(config(&[("imu", "body")]), ms(0));
        let mut saw_degraded = false;
        for w in 1..=3u64 {
            saw_degraded |= engine
                .tick(ms(w * 100))
                .iter()
                .any(|o| matches!(o, FusionOutput::Degraded { .. }));
        }
        assert!(saw_degraded);

        engine.ingest(sample("body", "imu", 310, 1.0));
        let out = engine.tick(ms(400));
        assert!(out.iter().any(|o| matches!(o, FusionOutput::Recovered { .. })));
        assert_eq!(engine.last_known_good().map(|f| f.sequence), Some(4));
    }

    #[test]
    fn full_buffer_sheds_oldest_sample() {
        let mut engine = FusionEngine::new(config(&[("imu", "body")]), ms(0));
        for i in 0..MAX_PENDING + 3 {
            assert!(engine.ingest(sample("body", "imu", 10, i as f64)));
        }
        assert_eq!(engine.stats().overflow_samples, 3);
        assert_eq!(engine.pending.len(), MAX_PENDING);
        assert_eq!(
            engine.pending.front().map(|s| &s.value),
            Some(&SensorValue::Vector(vec![3.0]))
        );

        let out = engine.tick(ms(100));
        assert_eq!(frames(&out).len(), 1);
        assert!(engine.pending.is_empty());
    }

    #[test]
    fn short_dip_does_not_report() {
        let mut engine = FusionEngine::new(config(&[("imu", "body")]), ms(0));
        let mut outputs = engine.tick(ms(200));
        engine.ingest(sample("body", "imu", 210, 1.0));
        outputs.extend(engine.tick(ms(300)));
        outputs.extend(engine.tick(ms(500)));
        assert!(!outputs
            .iter()
            .any(|o| matches!(o, FusionOutput::Degraded { .. } | FusionOutput::Recovered { .. })));
    }
}
