//! Speech-shaping filters and 2:1 rate conversion.

/// First-order pre-emphasis high-pass: `y[n] = x[n] - a * x[n-1]`.
#[derive(Debug, Clone)]
pub struct PreEmphasis {
    coefficient: f32,
    previous: f32,
}

impl PreEmphasis {
    pub fn new(coefficient: f32) -> Self {
        Self {
            coefficient,
            previous: 0.0,
        }
    }

    pub fn process(&mut self, input: &[i16], output: &mut Vec<f32>) {
        output.clear();
        output.reserve(input.len());
        for &sample in input {
            let x = f32::from(sample);
            output.push(x - self.coefficient * self.previous);
            self.previous = x;
        }
    }

    pub fn reset(&mut self) {
        self.previous = 0.0;
    }
}

/// Matching de-emphasis low-pass: `y[n] = x[n] + a * y[n-1]`.
#[derive(Debug, Clone)]
pub struct DeEmphasis {
    coefficient: f32,
    previous: f32,
}

impl DeEmphasis {
    pub fn new(coefficient: f32) -> Self {
        Self {
            coefficient,
            previous: 0.0,
        }
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        for sample in samples {
            let y = *sample + self.coefficient * self.previous;
            self.previous = y;
            *sample = y;
        }
    }

    pub fn reset(&mut self) {
        self.previous = 0.0;
    }
}

/// 3-tap `[0.25, 0.5, 0.25]` anti-aliasing FIR followed by 2:1 decimation.
#[derive(Debug, Clone, Default)]
pub struct Decimator {
    history: [f32; 2],
}

impl Decimator {
    pub fn process(&mut self, input: &[f32], output: &mut Vec<i16>) {
        output.clear();
        output.reserve(input.len() / 2);
        for (i, &x) in input.iter().enumerate() {
            let y = 0.25 * x + 0.5 * self.history[0] + 0.25 * self.history[1];
            self.history[1] = self.history[0];
            self.history[0] = x;
            if i % 2 == 1 {
                output.push(saturate(y));
            }
        }
    }

    pub fn reset(&mut self) {
        self.history = [0.0; 2];
    }
}

/// 2:1 upsampling with 4-point Catmull-Rom midpoints.
///
/// Original samples land on even indices; each odd index is the cubic
/// midpoint `(-p0 + 9p1 + 9p2 - p3) / 16`. Neighbours past either edge are
/// clamped to the edge sample.
pub fn upsample_catmull_rom(input: &[f32], out: &mut Vec<f32>) {
    out.clear();
    let n = input.len();
    if n == 0 {
        return;
    }
    out.reserve(n * 2);
    let at = |i: isize| -> f32 { input[i.clamp(0, n as isize - 1) as usize] };
    for i in 0..n as isize {
        let p0 = at(i - 1);
        let p1 = at(i);
        let p2 = at(i + 1);
        let p3 = at(i + 2);
        out.push(p1);
        out.push((-p0 + 9.0 * p1 + 9.0 * p2 - p3) / 16.0);
    }
}

pub fn saturate(value: f32) -> i16 {
    value.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_then_de_emphasis_is_identity() {
        let input: Vec<i16> = (0..64).map(|i| ((i * 37) % 200 - 100) as i16).collect();
        let mut pre = PreEmphasis::new(0.97);
        let mut de = DeEmphasis::new(0.97);
        let mut shaped = Vec::new();
        pre.process(&input, &mut shaped);
        de.process(&mut shaped);
        for (a, b) in input.iter().zip(&shaped) {
            assert!((f32::from(*a) - b).abs() < 0.01);
        }
    }

    #[test]
    fn test_decimator_halves_and_smooths() {
        let mut dec = Decimator::default();
        let mut out = Vec::new();
        dec.process(&[1000.0; 8], &mut out);
        assert_eq!(out.len(), 4);
        // After the filter settles a DC input passes unchanged.
        assert_eq!(out[3], 1000);
    }

    #[test]
    fn test_upsample_midpoints() {
        let mut out = Vec::new();
        upsample_catmull_rom(&[0.0, 16.0, 32.0, 48.0], &mut out);
        assert_eq!(out.len(), 8);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[2], 16.0);
        // Interior midpoint of a straight line is exact.
        assert_eq!(out[3], 24.0);
        assert_eq!(out[6], 48.0);
        upsample_catmull_rom(&[], &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_saturate_clamps() {
        assert_eq!(saturate(1e9), i16::MAX);
        assert_eq!(saturate(-1e9), i16::MIN);
        assert_eq!(saturate(1.6), 2);
    }
}
