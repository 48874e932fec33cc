//! Adaptive bitrate control.
//!
//! Network conditions map to one of five quality levels, each a target
//! samples-per-packet value. Downgrades apply on the first bad sample;
//! upgrades need a full window of consecutive good samples and move one
//! level at a time.

use std::collections::VecDeque;

use serde::Serialize;

/// Discrete quality levels, worst first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum QualityLevel {
    Minimal,
    Low,
    Medium,
    High,
    Maximum,
}

impl QualityLevel {
    pub const ALL: [QualityLevel; 5] = [
        Self::Minimal,
        Self::Low,
        Self::Medium,
        Self::High,
        Self::Maximum,
    ];

    /// PCM samples (at 16 kHz) carried per packet.
    pub const fn samples_per_packet(self) -> usize {
        match self {
            Self::Minimal => 960,
            Self::Low => 800,
            Self::Medium => 640,
            Self::High => 480,
            Self::Maximum => 320,
        }
    }

    pub fn higher(self) -> Self {
        match self {
            Self::Minimal => Self::Low,
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Maximum => Self::Maximum,
        }
    }
}

/// One network observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualitySample {
    /// Fraction of recent send attempts that failed, 0.0..=1.0.
    pub loss_ratio: f32,
    pub rtt_ms: u32,
}

#[derive(Debug, Clone)]
pub struct BitrateConfig {
    /// Samples in an observation window.
    pub window: usize,
    /// Loss ratio at or above which the target drops to Minimal, Low, Medium, High.
    pub loss_thresholds: [f32; 4],
    /// RTT at or above which the target drops to Minimal, Low, Medium, High.
    pub latency_thresholds_ms: [u32; 4],
    pub initial_level: QualityLevel,
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self {
            window: 50,
            loss_thresholds: [0.20, 0.10, 0.05, 0.02],
            latency_thresholds_ms: [800, 500, 300, 150],
            initial_level: QualityLevel::Maximum,
        }
    }
}

impl BitrateConfig {
    /// Level a single sample calls for.
    pub fn target_for(&self, sample: &QualitySample) -> QualityLevel {
        for (i, level) in QualityLevel::ALL[..4].iter().enumerate() {
            if sample.loss_ratio >= self.loss_thresholds[i]
                || sample.rtt_ms >= self.latency_thresholds_ms[i]
            {
                return *level;
            }
        }
        QualityLevel::Maximum
    }
}

#[derive(Debug, Clone)]
pub struct BitrateController {
    config: BitrateConfig,
    level: QualityLevel,
    worst_since_evaluation: Option<QualityLevel>,
    consecutive_good: usize,
}

impl BitrateController {
    pub fn new(config: BitrateConfig) -> Self {
        Self {
            level: config.initial_level,
            worst_since_evaluation: None,
            consecutive_good: 0,
            config,
        }
    }

    pub fn observe(&mut self, sample: QualitySample) {
        let target = self.config.target_for(&sample);
        self.worst_since_evaluation = Some(match self.worst_since_evaluation {
            Some(worst) => worst.min(target),
            None => target,
        });
        if target > self.level {
            self.consecutive_good += 1;
        } else {
            self.consecutive_good = 0;
        }
    }

    /// Apply hysteresis. Returns the new level when it changed.
    pub fn evaluate(&mut self) -> Option<QualityLevel> {
        let worst = self.worst_since_evaluation.take()?;
        if worst < self.level {
            self.level = worst;
            self.consecutive_good = 0;
            return Some(self.level);
        }
        if self.consecutive_good >= self.config.window && self.level < QualityLevel::Maximum {
            self.level = self.level.higher();
            self.consecutive_good = 0;
            return Some(self.level);
        }
        None
    }

    pub fn level(&self) -> QualityLevel {
        self.level
    }

    pub fn samples_per_packet(&self) -> usize {
        self.level.samples_per_packet()
    }

    pub fn reset(&mut self) {
        self.level = self.config.initial_level;
        self.worst_since_evaluation = None;
        self.consecutive_good = 0;
    }
}

/// Rolling record of send attempt outcomes.
#[derive(Debug, Clone)]
pub struct SendLossTracker {
    window: usize,
    outcomes: VecDeque<bool>,
}

impl SendLossTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            outcomes: VecDeque::with_capacity(window),
        }
    }

    pub fn record(&mut self, delivered: bool) {
        if self.outcomes.len() == self.window {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(delivered);
    }

    pub fn loss_ratio(&self) -> f32 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let lost = self.outcomes.iter().filter(|ok| !**ok).count();
        lost as f32 / self.outcomes.len() as f32
    }
}

/// Rolling RTT measurements from keepalive round trips.
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    window: usize,
    rtts: VecDeque<u32>,
}

impl LatencyTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            rtts: VecDeque::with_capacity(window),
        }
    }

    pub fn record(&mut self, rtt_ms: u32) {
        if self.rtts.len() == self.window {
            self.rtts.pop_front();
        }
        self.rtts.push_back(rtt_ms);
    }

    /// Mean RTT, zero before the first measurement.
    pub fn average_ms(&self) -> u32 {
        if self.rtts.is_empty() {
            return 0;
        }
        let total: u64 = self.rtts.iter().map(|&r| u64::from(r)).sum();
        (total / self.rtts.len() as u64) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: QualitySample = QualitySample {
        loss_ratio: 0.0,
        rtt_ms: 40,
    };

    #[test]
    fn test_level_targets() {
        let config = BitrateConfig::default();
        let at = |loss, rtt| config.target_for(&QualitySample { loss_ratio: loss, rtt_ms: rtt });
        assert_eq!(at(0.0, 40), QualityLevel::Maximum);
        assert_eq!(at(0.02, 40), QualityLevel::High);
        assert_eq!(at(0.06, 40), QualityLevel::Medium);
        assert_eq!(at(0.0, 520), QualityLevel::Low);
        assert_eq!(at(0.25, 40), QualityLevel::Minimal);
    }

    #[test]
    fn test_single_bad_sample_downgrades_immediately() {
        let mut abr = BitrateController::new(BitrateConfig::default());
        abr.observe(QualitySample {
            loss_ratio: 0.20,
            rtt_ms: 40,
        });
        assert_eq!(abr.evaluate(), Some(QualityLevel::Minimal));
        assert_eq!(abr.samples_per_packet(), 960);
    }

    /// Good samples after a downgrade only upgrade once a full window elapses.
    #[test]
    fn test_upgrade_needs_full_window() {
        let mut abr = BitrateController::new(BitrateConfig::default());
        abr.observe(QualitySample {
            loss_ratio: 0.20,
            rtt_ms: 40,
        });
        abr.evaluate();

        for _ in 0..49 {
            abr.observe(GOOD);
            assert_eq!(abr.evaluate(), None);
        }
        assert_eq!(abr.level(), QualityLevel::Minimal);

        abr.observe(GOOD);
        assert_eq!(abr.evaluate(), Some(QualityLevel::Low));
    }

    #[test]
    fn test_bad_sample_resets_good_run() {
        let mut abr = BitrateController::new(BitrateConfig {
            initial_level: QualityLevel::Medium,
            ..Default::default()
        });
        for _ in 0..40 {
            abr.observe(GOOD);
        }
        abr.observe(QualitySample {
            loss_ratio: 0.06,
            rtt_ms: 40,
        });
        for _ in 0..40 {
            abr.observe(GOOD);
        }
        assert_eq!(abr.evaluate(), None);
        assert_eq!(abr.level(), QualityLevel::Medium);
    }

    #[test]
    fn test_no_samples_no_change() {
        let mut abr = BitrateController::new(BitrateConfig::default());
        assert_eq!(abr.evaluate(), None);
        assert_eq!(LatencyTracker::new(50).average_ms(), 0);
    }

    #[test]
    fn test_latency_tracker_window() {
        let mut rtt = LatencyTracker::new(3);
        for ms in [900, 100, 200, 300] {
            rtt.record(ms);
        }
        assert_eq!(rtt.average_ms(), 200);
    }

    #[test]
    fn test_send_loss_tracker_window() {
        let mut tracker = SendLossTracker::new(50);
        for _ in 0..10 {
            tracker.record(false);
        }
        for _ in 0..50 {
            tracker.record(true);
        }
        assert_eq!(tracker.loss_ratio(), 0.0);
        tracker.record(false);
        assert!((tracker.loss_ratio() - 0.02).abs() < 1e-6);
    }

    #[test]
    fn test_latency_tracker_average() {
        let mut rtt = LatencyTracker::new(3);
        assert_eq!(rtt.average_ms(), 0);
        for v in [100, 200, 300, 400] {
            rtt.record(v);
        }
        assert_eq!(rtt.average_ms(), 300);
    }
}
