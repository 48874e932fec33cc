//! Packet loss concealment.
//!
//! A gap replays the last good frame with a progressive fade and a small
//! random gain wobble; past the cap the output becomes comfort noise.

use rand::Rng;

use super::codec::comfort_noise;

#[derive(Debug, Clone)]
pub struct PlcConfig {
    /// Gain applied per consecutive concealed frame.
    pub fade_factor: f32,
    /// Concealed frames replayed before switching to comfort noise.
    pub max_concealed: u32,
    /// Random multiplicative jitter (±) applied to each replayed sample.
    pub gain_jitter: f32,
    /// Peak amplitude of the comfort noise.
    pub comfort_noise_amplitude: i16,
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self {
            fade_factor: 0.7,
            max_concealed: 3,
            gain_jitter: 0.02,
            comfort_noise_amplitude: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PacketLossConcealer {
    config: PlcConfig,
    last_good: Vec<i16>,
    consecutive_losses: u32,
    frames_concealed: u64,
}

impl PacketLossConcealer {
    pub fn new(config: PlcConfig) -> Self {
        Self {
            config,
            last_good: Vec::new(),
            consecutive_losses: 0,
            frames_concealed: 0,
        }
    }

    /// Cache a real decoded frame and end any loss run.
    pub fn on_packet(&mut self, samples: &[i16]) {
        self.last_good.clear();
        self.last_good.extend_from_slice(samples);
        self.consecutive_losses = 0;
    }

    /// Synthesize `frame_len` samples for a missing frame.
    pub fn conceal(&mut self, frame_len: usize) -> Vec<i16> {
        self.consecutive_losses = self.consecutive_losses.saturating_add(1);
        self.frames_concealed += 1;

        if self.consecutive_losses > self.config.max_concealed || self.last_good.is_empty() {
            return comfort_noise(frame_len, self.config.comfort_noise_amplitude);
        }

        let fade = self.config.fade_factor.powi(self.consecutive_losses as i32);
        let jitter = self.config.gain_jitter.abs();
        let mut rng = rand::rng();
        self.last_good
            .iter()
            .cycle()
            .take(frame_len)
            .map(|&s| {
                let wobble = 1.0 + rng.random_range(-jitter..=jitter);
                (f32::from(s) * fade * wobble)
                    .round()
                    .clamp(i16::MIN as f32, i16::MAX as f32) as i16
            })
            .collect()
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses
    }

    pub fn frames_concealed(&self) -> u64 {
        self.frames_concealed
    }

    pub fn reset(&mut self) {
        self.last_good.clear();
        self.consecutive_losses = 0;
        self.frames_concealed = 0;
    }
}
