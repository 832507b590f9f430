//! Acquisition manager: lighting-regime detection, automatic gain/
//! integration-time adjustment, LED brightness optimization, and
//! multi-sample statistically characterized "quality reads".
//!
//! Mirrors the capture pipeline's iterate-then-adjust shape (see the
//! teacher's frame loop) but drives sensor registers instead of a video
//! device, and returns aggregate statistics rather than pixels.

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::driver::{AGain, LightingRegime, RawSample, SensorConfig, SensorDriver};

/// Target channel range the brightness optimizer aims to keep V = max(X,Y,Z) within.
pub const RGB_TARGET_MIN: u16 = 5_000;
pub const RGB_TARGET_MAX: u16 = 55_000;

/// Starvation floor: below this on all of X,Y,Z the sensor is under-driven.
const STARVATION_FLOOR: u16 = 1_000;

const BRIGHTNESS_MAX_ITERATIONS: u32 = 6;
const BRIGHTNESS_STABILIZATION: Duration = Duration::from_millis(400);
const BRIGHTNESS_STEP: u8 = 8;
const BRIGHTNESS_RAPID_MULTIPLIER: u8 = 4;

/// Minimum interval between re-optimizations to prevent oscillation (§4.2).
pub const MIN_REOPTIMIZE_INTERVAL: Duration = Duration::from_millis(800);

const FINE_ATIME_STEP: u8 = 20;
const COARSE_ATIME_STEP: u8 = 50;

/// Per-channel descriptive statistics from a multi-sample quality read.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelStats {
    pub mean: f64,
    pub std_dev: f64,
    pub min: u16,
    pub max: u16,
    pub coefficient_of_variation: f64,
    pub outlier_count: u32,
}

impl ChannelStats {
    fn from_samples(values: &[u16]) -> Self {
        if values.is_empty() {
            return ChannelStats::default();
        }
        let n = values.len() as f64;
        let sum: f64 = values.iter().map(|&v| v as f64).sum();
        let mean = sum / n;
        let variance: f64 = values
            .iter()
            .map(|&v| {
                let d = v as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        let std_dev = variance.sqrt();
        let min = *values.iter().min().unwrap();
        let max = *values.iter().max().unwrap();
        let cv = if mean > 0.0 { std_dev / mean } else { 0.0 };
        let outlier_count = values
            .iter()
            .filter(|&&v| (v as f64 - mean).abs() > 2.0 * std_dev)
            .count() as u32;

        ChannelStats {
            mean,
            std_dev,
            min,
            max,
            coefficient_of_variation: cv,
            outlier_count,
        }
    }
}

/// Aggregate quality metrics and a 0..100 health score for a batch of
/// samples (§4.2).
#[derive(Debug, Clone)]
pub struct ReadingQuality {
    pub x: ChannelStats,
    pub y: ChannelStats,
    pub z: ChannelStats,
    pub ir: ChannelStats,
    pub sample_count: usize,
    pub score: u8,
    pub any_saturated: bool,
}

impl ReadingQuality {
    fn compute(samples: &[RawSample]) -> Self {
        let xs: Vec<u16> = samples.iter().map(|s| s.x).collect();
        let ys: Vec<u16> = samples.iter().map(|s| s.y).collect();
        let zs: Vec<u16> = samples.iter().map(|s| s.z).collect();
        let irs: Vec<u16> = samples.iter().map(|s| s.ir).collect();

        let x = ChannelStats::from_samples(&xs);
        let y = ChannelStats::from_samples(&ys);
        let z = ChannelStats::from_samples(&zs);
        let ir = ChannelStats::from_samples(&irs);

        let any_saturated = samples.iter().any(|s| s.saturated);
        let n = samples.len().max(1) as f64;
        let total_outliers = (x.outlier_count + y.outlier_count + z.outlier_count) as f64;
        let outlier_ratio = total_outliers / (3.0 * n);

        let max_cv = x
            .coefficient_of_variation
            .max(y.coefficient_of_variation)
            .max(z.coefficient_of_variation);
        let max_channel = x.max.max(y.max).max(z.max);
        let min_channel = x.min.min(y.min).min(z.min);

        let mut score: i32 = 100;
        if max_cv > 0.10 {
            score -= 30;
        } else if max_cv > 0.05 {
            score -= 15;
        }
        if max_channel as f64 >= crate::driver::SATURATION_THRESHOLD as f64 {
            score -= 25;
        } else if max_channel > RGB_TARGET_MAX {
            score -= 10;
        }
        if min_channel < STARVATION_FLOOR {
            score -= 25;
        } else if min_channel < RGB_TARGET_MIN {
            score -= 10;
        }
        if outlier_ratio > 0.25 {
            score -= 20;
        } else if outlier_ratio > 0.0 {
            score -= 5;
        }
        let score = score.clamp(0, 100) as u8;

        ReadingQuality {
            x,
            y,
            z,
            ir,
            sample_count: samples.len(),
            score,
            any_saturated,
        }
    }
}

/// A completed quality read: raw per-sample data plus the aggregate
/// `ReadingQuality`, and the representative averaged channel values
/// used downstream by the colorimetric engine.
#[derive(Debug, Clone)]
pub struct QualityReading {
    pub quality: ReadingQuality,
    pub mean_sample: RawSample,
}

/// Coordinates sensor register adjustment and multi-sample reads.
///
/// Tracks the last re-optimization time to enforce the 800ms minimum
/// interval between adjustments (§4.2), and exposes a cooperative
/// cancellation flag consulted between samples, matching §5's
/// cancellation model.
pub struct AcquisitionManager<'a, D: SensorDriver> {
    driver: &'a mut D,
    last_reoptimize: Option<Instant>,
}

impl<'a, D: SensorDriver> AcquisitionManager<'a, D> {
    pub fn new(driver: &'a mut D) -> Self {
        Self {
            driver,
            last_reoptimize: None,
        }
    }

    /// Probe the Y channel and apply the matching preset `SensorConfig`.
    pub fn detect_and_apply_regime(&mut self) -> LightingRegime {
        let probe = self.driver.read_channels();
        let regime = LightingRegime::from_y_channel(probe.y);
        let preset = regime.preset();
        if let Err(e) = self.driver.configure(preset) {
            warn!("failed to apply regime preset: {}", e);
        }
        info!("detected lighting regime {:?}, applied preset {:?}", regime, preset);
        regime
    }

    fn can_reoptimize(&self) -> bool {
        match self.last_reoptimize {
            None => true,
            Some(t) => t.elapsed() >= MIN_REOPTIMIZE_INTERVAL,
        }
    }

    /// Adjust AGAIN/ATIME to avoid saturation or starvation, re-reading
    /// after each step, giving up after one full traversal of the
    /// adjustment space (§4.2).
    pub fn optimize(&mut self) -> RawSample {
        if !self.can_reoptimize() {
            return self.driver.read_channels();
        }
        self.last_reoptimize = Some(Instant::now());

        let mut sample = self.driver.read_channels();
        let mut cfg = self.driver.current_config();

        // Saturation-avoidance: one full traversal of the space.
        while sample.saturated || Self::hw_saturated(self.driver.read_status()) {
            if !cfg.again.is_min() {
                cfg.again = cfg.again.halved();
            } else if cfg.atime > SensorConfig::ATIME_MIN {
                let step = if cfg.atime <= FINE_ATIME_STEP {
                    FINE_ATIME_STEP
                } else {
                    COARSE_ATIME_STEP
                };
                cfg.atime = cfg.atime.saturating_sub(step).max(SensorConfig::ATIME_MIN);
            } else {
                warn!("saturation persists at minimum gain/atime, continuing with flagged data");
                break;
            }
            if let Err(e) = self.driver.configure(cfg) {
                warn!("failed to apply saturation-avoidance config: {}", e);
                break;
            }
            sample = self.driver.read_channels();
            if cfg.again.is_min() && cfg.atime == SensorConfig::ATIME_MIN {
                break;
            }
        }

        // Starvation-avoidance: symmetric traversal.
        while sample.max_channel() < STARVATION_FLOOR {
            if !cfg.again.is_max() {
                cfg.again = cfg.again.doubled();
            } else if cfg.atime < SensorConfig::ATIME_MAX {
                cfg.atime = (cfg.atime + COARSE_ATIME_STEP).min(SensorConfig::ATIME_MAX);
            } else {
                debug!("starvation persists at maximum gain/atime, accepting low signal");
                break;
            }
            if let Err(e) = self.driver.configure(cfg) {
                warn!("failed to apply starvation-avoidance config: {}", e);
                break;
            }
            sample = self.driver.read_channels();
            if cfg.again.is_max() && cfg.atime == SensorConfig::ATIME_MAX {
                break;
            }
        }

        sample
    }

    fn hw_saturated(status: u8) -> bool {
        status & 0x01 != 0
    }

    /// Optimize LED brightness toward `[RGB_TARGET_MIN, RGB_TARGET_MAX]`,
    /// up to six iterations with 400ms stabilization each (§4.2).
    ///
    /// `read_v` samples the control variable (max channel) at the
    /// current brightness; `set_brightness`/`get_brightness` mutate and
    /// query an external LED driver, which is out of scope for this
    /// core (§1) and supplied by the caller.
    pub fn optimize_brightness<R, S, G>(
        &self,
        mut read_v: R,
        mut set_brightness: S,
        get_brightness: G,
    ) -> u8
    where
        R: FnMut() -> u16,
        S: FnMut(u8),
        G: Fn() -> u8,
    {
        let mut brightness = get_brightness();
        for _ in 0..BRIGHTNESS_MAX_ITERATIONS {
            let v = read_v();
            if v > RGB_TARGET_MAX {
                let step = if v >= crate::driver::SATURATION_THRESHOLD {
                    BRIGHTNESS_STEP.saturating_mul(BRIGHTNESS_RAPID_MULTIPLIER)
                } else {
                    BRIGHTNESS_STEP
                };
                brightness = brightness.saturating_sub(step);
                set_brightness(brightness);
            } else if v < RGB_TARGET_MIN {
                brightness = brightness.saturating_add(BRIGHTNESS_STEP);
                set_brightness(brightness);
            } else {
                break;
            }
            std::thread::sleep(BRIGHTNESS_STABILIZATION);
        }
        brightness
    }

    /// Take `n` samples at `interval` and report aggregate
    /// `ReadingQuality`. Checks `cancelled` between samples (§5
    /// cooperative cancellation).
    pub fn quality_read(
        &mut self,
        n: usize,
        interval: Duration,
        mut cancelled: impl FnMut() -> bool,
    ) -> Option<QualityReading> {
        let mut samples = Vec::with_capacity(n);
        for i in 0..n {
            if cancelled() {
                debug!("quality read cancelled after {} samples", i);
                return None;
            }
            samples.push(self.driver.read_channels());
            if i + 1 < n {
                std::thread::sleep(interval);
            }
        }

        let quality = ReadingQuality::compute(&samples);
        let mean_sample = RawSample {
            x: quality.x.mean.round() as u16,
            y: quality.y.mean.round() as u16,
            z: quality.z.mean.round() as u16,
            ir: quality.ir.mean.round() as u16,
            timestamp_ms: samples.last().map(|s| s.timestamp_ms).unwrap_or(0),
            saturated: quality.any_saturated,
            valid: samples.iter().all(|s| s.valid),
        };

        Some(QualityReading {
            quality,
            mean_sample,
        })
    }
}
