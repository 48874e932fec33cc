//! Low-bitrate speech codec.
//!
//! Encode: pre-emphasis → 3-tap FIR + 2:1 decimation → DTX → 4-bit ADPCM.
//! Decode: ADPCM → de-emphasis → Catmull-Rom 2:1 upsampling → +3 dB gain.
//!
//! Frame layouts:
//! - audio: `[0x01][predictor i16 BE][step index u8][count u16 BE][nibbles]`
//! - silence marker: `[0x00]`
//!
//! Every audio frame carries the ADPCM state it was encoded from, so a lost
//! frame never desynchronises the decoder. Trailing bytes past the packed
//! nibbles are ignored (FEC recovery may zero-pad).

pub mod adpcm;
pub mod filters;

use adpcm::AdpcmState;
use filters::{DeEmphasis, Decimator, PreEmphasis, saturate, upsample_catmull_rom};
use rand::Rng;

/// Leading byte of an encoded audio frame.
pub const FRAME_AUDIO: u8 = 0x01;
/// Leading (and only) byte of a DTX silence marker.
pub const FRAME_SILENCE: u8 = 0x00;

const AUDIO_HEADER_LEN: usize = 6;

#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Capture/playout sample rate; the coder runs at half of it.
    pub sample_rate: u32,
    /// Nominal frame size in samples (20 ms at 16 kHz).
    pub frame_samples: usize,
    /// Pre/de-emphasis coefficient.
    pub emphasis: f32,
    /// Peak amplitude below which a frame counts as quiet.
    pub dtx_threshold: i16,
    /// Quiet frames tolerated before silence markers start.
    pub dtx_hangover_frames: u32,
    /// Linear output gain (≈ +3 dB).
    pub output_gain: f32,
    /// Peak amplitude of synthetic comfort noise.
    pub comfort_noise_amplitude: i16,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_samples: 320,
            emphasis: 0.97,
            dtx_threshold: 300,
            dtx_hangover_frames: 5,
            output_gain: 1.413,
            comfort_noise_amplitude: 30,
        }
    }
}

/// Low-amplitude uniform noise used in place of digital silence.
pub fn comfort_noise(len: usize, amplitude: i16) -> Vec<i16> {
    let amplitude = amplitude.max(0);
    let mut rng = rand::rng();
    (0..len)
        .map(|_| rng.random_range(-amplitude..=amplitude))
        .collect()
}

pub fn is_silence_frame(frame: &[u8]) -> bool {
    frame.first() == Some(&FRAME_SILENCE)
}

/// Send-direction codec state.
#[derive(Debug, Clone)]
pub struct AudioEncoder {
    config: CodecConfig,
    pre_emphasis: PreEmphasis,
    decimator: Decimator,
    adpcm: AdpcmState,
    quiet_frames: u32,
    shaped: Vec<f32>,
    narrow: Vec<i16>,
}

impl AudioEncoder {
    pub fn new(config: CodecConfig) -> Self {
        Self {
            pre_emphasis: PreEmphasis::new(config.emphasis),
            decimator: Decimator::default(),
            adpcm: AdpcmState::default(),
            quiet_frames: 0,
            shaped: Vec::new(),
            narrow: Vec::new(),
            config,
        }
    }

    /// Encode one frame of PCM at the capture rate.
    pub fn encode(&mut self, pcm: &[i16]) -> Vec<u8> {
        self.pre_emphasis.process(pcm, &mut self.shaped);
        self.decimator.process(&self.shaped, &mut self.narrow);

        let peak = pcm.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
        if peak < self.config.dtx_threshold.unsigned_abs() {
            self.quiet_frames = self.quiet_frames.saturating_add(1);
        } else {
            self.quiet_frames = 0;
        }
        if self.quiet_frames > self.config.dtx_hangover_frames {
            return vec![FRAME_SILENCE];
        }

        let count = self.narrow.len().min(u16::MAX as usize);
        let mut out = Vec::with_capacity(AUDIO_HEADER_LEN + count.div_ceil(2));
        out.push(FRAME_AUDIO);
        out.extend_from_slice(&self.adpcm.predictor.to_be_bytes());
        out.push(self.adpcm.step_index);
        out.extend_from_slice(&(count as u16).to_be_bytes());
        adpcm::encode_block(&mut self.adpcm, &self.narrow[..count], &mut out);
        out
    }

    pub fn reset(&mut self) {
        self.pre_emphasis.reset();
        self.decimator.reset();
        self.adpcm = AdpcmState::default();
        self.quiet_frames = 0;
    }
}

/// Receive-direction codec state.
#[derive(Debug, Clone)]
pub struct AudioDecoder {
    config: CodecConfig,
    de_emphasis: DeEmphasis,
    last_frame_len: usize,
    narrow: Vec<i16>,
    wide: Vec<f32>,
    upsampled: Vec<f32>,
}

impl AudioDecoder {
    pub fn new(config: CodecConfig) -> Self {
        Self {
            de_emphasis: DeEmphasis::new(config.emphasis),
            last_frame_len: config.frame_samples,
            narrow: Vec::new(),
            wide: Vec::new(),
            upsampled: Vec::new(),
            config,
        }
    }

    /// Decode one frame to PCM at the playout rate. Malformed input is `None`.
    pub fn decode(&mut self, frame: &[u8]) -> Option<Vec<i16>> {
        match *frame.first()? {
            FRAME_SILENCE => Some(comfort_noise(
                self.last_frame_len,
                self.config.comfort_noise_amplitude,
            )),
            FRAME_AUDIO => {
                if frame.len() < AUDIO_HEADER_LEN {
                    return None;
                }
                let predictor = i16::from_be_bytes([frame[1], frame[2]]);
                let mut state = AdpcmState::new(predictor, frame[3]);
                let count = u16::from_be_bytes([frame[4], frame[5]]) as usize;
                adpcm::decode_block(
                    &mut state,
                    &frame[AUDIO_HEADER_LEN..],
                    count,
                    &mut self.narrow,
                )?;

                self.wide.clear();
                self.wide.extend(self.narrow.iter().copied().map(f32::from));
                self.de_emphasis.process(&mut self.wide);
                upsample_catmull_rom(&self.wide, &mut self.upsampled);
                let gain = self.config.output_gain;
                let pcm: Vec<i16> = self
                    .upsampled
                    .iter()
                    .map(|&s| saturate(s * gain))
                    .collect();
                if !pcm.is_empty() {
                    self.last_frame_len = pcm.len();
                }
                Some(pcm)
            }
            _ => None,
        }
    }

    /// Samples produced by the most recent audio frame.
    pub fn last_frame_len(&self) -> usize {
        self.last_frame_len
    }

    pub fn reset(&mut self) {
        self.de_emphasis.reset();
        self.last_frame_len = self.config.frame_samples;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f32, amplitude: f32, start: usize, len: usize) -> Vec<i16> {
        (start..start + len)
            .map(|n| {
                let t = n as f32 / 16_000.0;
                (amplitude * (2.0 * std::f32::consts::PI * freq * t).sin()) as i16
            })
            .collect()
    }

    /// Goertzel magnitude of `freq` in `samples` at 16 kHz.
    fn goertzel(samples: &[i16], freq: f32) -> f32 {
        let w = 2.0 * std::f32::consts::PI * freq / 16_000.0;
        let coeff = 2.0 * w.cos();
        let (mut s1, mut s2) = (0.0f32, 0.0f32);
        for &x in samples {
            let s0 = f32::from(x) + coeff * s1 - s2;
            s2 = s1;
            s1 = s0;
        }
        (s1 * s1 + s2 * s2 - coeff * s1 * s2).max(0.0).sqrt()
    }

    #[test]
    fn test_silent_frame_decodes_near_silence() {
        let mut enc = AudioEncoder::new(CodecConfig::default());
        let mut dec = AudioDecoder::new(CodecConfig::default());
        let frame = enc.encode(&[0i16; 320]);
        assert_eq!(frame[0], FRAME_AUDIO);
        let pcm = dec.decode(&frame).unwrap();
        assert_eq!(pcm.len(), 320);
        assert!(pcm.iter().all(|s| s.unsigned_abs() <= 1));
    }

    #[test]
    fn test_dtx_after_hangover() {
        let mut enc = AudioEncoder::new(CodecConfig::default());
        let mut dec = AudioDecoder::new(CodecConfig::default());
        for _ in 0..5 {
            assert_eq!(enc.encode(&[10i16; 320])[0], FRAME_AUDIO);
        }
        let marker = enc.encode(&[10i16; 320]);
        assert_eq!(marker, vec![FRAME_SILENCE]);

        let noise = dec.decode(&marker).unwrap();
        assert_eq!(noise.len(), 320);
        assert!(noise.iter().all(|s| s.unsigned_abs() <= 30));

        // Speech ends the silence run immediately.
        assert_eq!(enc.encode(&tone(440.0, 8000.0, 0, 320))[0], FRAME_AUDIO);
    }

    #[test]
    fn test_frame_is_compressed() {
        let mut enc = AudioEncoder::new(CodecConfig::default());
        let frame = enc.encode(&tone(440.0, 8000.0, 0, 320));
        // 160 narrowband samples at 4 bits plus header.
        assert_eq!(frame.len(), 6 + 80);
        // Half rate at a quarter of the bits: just under 8:1 with the header.
        assert_eq!(320 * 2 / frame.len(), 7);
    }

    #[test]
    fn test_steady_frames_reuse_scratch_buffers() {
        let mut enc = AudioEncoder::new(CodecConfig::default());
        let mut dec = AudioDecoder::new(CodecConfig::default());
        let frame = enc.encode(&tone(440.0, 8000.0, 0, 320));
        dec.decode(&frame).unwrap();
        let enc_ptrs = (enc.shaped.as_ptr(), enc.narrow.as_ptr());
        let dec_ptrs = (
            dec.narrow.as_ptr(),
            dec.wide.as_ptr(),
            dec.upsampled.as_ptr(),
        );

        for i in 1..20 {
            let frame = enc.encode(&tone(440.0, 8000.0, i * 320, 320));
            assert_eq!(dec.decode(&frame).unwrap().len(), 320);
        }
        assert_eq!((enc.shaped.as_ptr(), enc.narrow.as_ptr()), enc_ptrs);
        assert_eq!(
            (
                dec.narrow.as_ptr(),
                dec.wide.as_ptr(),
                dec.upsampled.as_ptr()
            ),
            dec_ptrs
        );
    }

    #[test]
    fn test_tone_keeps_fundamental() {
        let mut enc = AudioEncoder::new(CodecConfig::default());
        let mut dec = AudioDecoder::new(CodecConfig::default());
        let mut decoded = Vec::new();
        for i in 0..10 {
            let frame = enc.encode(&tone(440.0, 8000.0, i * 320, 320));
            decoded.extend(dec.decode(&frame).unwrap());
        }
        // Skip adaptation warm-up.
        let tail = &decoded[1600..];
        let fundamental = goertzel(tail, 440.0);
        assert!(fundamental > 4.0 * goertzel(tail, 1000.0));
        assert!(fundamental > 4.0 * goertzel(tail, 2000.0));
    }

    #[test]
    fn test_malformed_frames_are_none() {
        let mut dec = AudioDecoder::new(CodecConfig::default());
        assert!(dec.decode(&[]).is_none());
        assert!(dec.decode(&[0x7F, 1, 2]).is_none());
        assert!(dec.decode(&[FRAME_AUDIO, 0, 0]).is_none());
        // Declares 10 samples but carries only 2 bytes of nibbles.
        assert!(dec.decode(&[FRAME_AUDIO, 0, 0, 0, 0, 10, 0xFF, 0xFF]).is_none());
    }

    #[test]
    fn test_zero_padded_frame_still_decodes() {
        let mut enc = AudioEncoder::new(CodecConfig::default());
        let mut dec = AudioDecoder::new(CodecConfig::default());
        let mut frame = enc.encode(&tone(440.0, 8000.0, 0, 320));
        frame.extend_from_slice(&[0u8; 12]);
        assert_eq!(dec.decode(&frame).unwrap().len(), 320);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut enc = AudioEncoder::new(CodecConfig::default());
        let first = enc.encode(&tone(440.0, 8000.0, 0, 320));
        enc.encode(&tone(440.0, 8000.0, 320, 320));
        enc.reset();
        assert_eq!(enc.encode(&tone(440.0, 8000.0, 0, 320)), first);
    }
}
