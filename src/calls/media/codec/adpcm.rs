//! IMA-style 4-bit ADPCM.

/// Quantizer step sizes indexed by adaptation state.
const STEP_TABLE: [i32; 89] = [
    7, 8, 9, 10, 11, 12, 13, 14, 16, 17, 19, 21, 23, 25, 28, 31, 34, 37, 41, 45, 50, 55, 60, 66,
    73, 80, 88, 97, 107, 118, 130, 143, 157, 173, 190, 209, 230, 253, 279, 307, 337, 371, 408,
    449, 494, 544, 598, 658, 724, 796, 876, 963, 1060, 1166, 1282, 1411, 1552, 1707, 1878, 2066,
    2272, 2499, 2749, 3024, 3327, 3660, 4026, 4428, 4871, 5358, 5894, 6484, 7132, 7845, 8630,
    9493, 10442, 11487, 12635, 13899, 15289, 16818, 18500, 20350, 22385, 24623, 27086, 29794,
    32767,
];

/// Step index adjustment per 4-bit code (sign bit ignored).
const INDEX_TABLE: [i8; 16] = [-1, -1, -1, -1, 2, 4, 6, 8, -1, -1, -1, -1, 2, 4, 6, 8];

const MAX_STEP_INDEX: u8 = 88;

/// Predictor state shared by encoder and decoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdpcmState {
    pub predictor: i16,
    pub step_index: u8,
}

impl AdpcmState {
    pub fn new(predictor: i16, step_index: u8) -> Self {
        Self {
            predictor,
            step_index: step_index.min(MAX_STEP_INDEX),
        }
    }

    /// Quantize one sample to a 4-bit code and advance the state.
    pub fn encode(&mut self, sample: i16) -> u8 {
        let step = STEP_TABLE[self.step_index as usize];
        let mut diff = i32::from(sample) - i32::from(self.predictor);
        let mut code = 0u8;
        if diff < 0 {
            code = 8;
            diff = -diff;
        }
        if diff >= step {
            code |= 4;
            diff -= step;
        }
        if diff >= step >> 1 {
            code |= 2;
            diff -= step >> 1;
        }
        if diff >= step >> 2 {
            code |= 1;
        }
        self.apply(code);
        code
    }

    /// Reconstruct one sample from a 4-bit code and advance the state.
    pub fn decode(&mut self, code: u8) -> i16 {
        self.apply(code & 0x0F);
        self.predictor
    }

    fn apply(&mut self, code: u8) {
        let step = STEP_TABLE[self.step_index as usize];
        let mut delta = step >> 3;
        if code & 4 != 0 {
            delta += step;
        }
        if code & 2 != 0 {
            delta += step >> 1;
        }
        if code & 1 != 0 {
            delta += step >> 2;
        }
        let predicted = if code & 8 != 0 {
            i32::from(self.predictor) - delta
        } else {
            i32::from(self.predictor) + delta
        };
        self.predictor = predicted.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
        let index = i16::from(self.step_index) + i16::from(INDEX_TABLE[code as usize]);
        self.step_index = index.clamp(0, i16::from(MAX_STEP_INDEX)) as u8;
    }
}

/// Encode samples, packing two codes per byte (low nibble first).
pub fn encode_block(state: &mut AdpcmState, samples: &[i16], out: &mut Vec<u8>) {
    for pair in samples.chunks(2) {
        let low = state.encode(pair[0]);
        let high = pair.get(1).map(|&s| state.encode(s)).unwrap_or(0);
        out.push(low | (high << 4));
    }
}

/// Decode `count` samples from packed nibbles. Returns `None` if `data` is short.
pub fn decode_block(
    state: &mut AdpcmState,
    data: &[u8],
    count: usize,
    out: &mut Vec<i16>,
) -> Option<()> {
    out.clear();
    if data.len() < count.div_ceil(2) {
        return None;
    }
    out.reserve(count);
    for i in 0..count {
        let byte = data[i / 2];
        let code = if i % 2 == 0 { byte & 0x0F } else { byte >> 4 };
        out.push(state.decode(code));
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_tracks_encoder() {
        let samples: Vec<i16> = (0..200)
            .map(|i| ((i as f32 * 0.2).sin() * 6000.0) as i16)
            .collect();
        let mut enc = AdpcmState::default();
        let mut packed = Vec::new();
        encode_block(&mut enc, &samples, &mut packed);
        assert_eq!(packed.len(), 100);

        let mut dec = AdpcmState::default();
        let mut decoded = Vec::new();
        decode_block(&mut dec, &packed, samples.len(), &mut decoded).unwrap();
        assert_eq!(dec, enc);
        // Once the step size has adapted the error stays bounded.
        for (a, b) in samples.iter().zip(&decoded).skip(40) {
            assert!((i32::from(*a) - i32::from(*b)).abs() < 1200);
        }
    }

    #[test]
    fn test_odd_count_and_short_input() {
        let mut enc = AdpcmState::default();
        let mut packed = Vec::new();
        encode_block(&mut enc, &[100, 200, 300], &mut packed);
        assert_eq!(packed.len(), 2);
        let mut dec = AdpcmState::default();
        let mut out = Vec::new();
        assert!(decode_block(&mut dec, &packed, 5, &mut out).is_none());
        decode_block(&mut dec, &packed, 3, &mut out).unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_step_index_clamped() {
        let state = AdpcmState::new(0, 200);
        assert_eq!(state.step_index, 88);
    }
}
