//! Simple random number generator for reproducibility.
//!
//! A lightweight xorshift PRNG used by the weight fillers and by the
//! dropout masks of the native reference library. Seeding it identically
//! reproduces fills bit-for-bit.

/// Xorshift generator.
#[derive(Debug, Clone)]
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    /// Create a new RNG with explicit seed (if zero, use a fixed value).
    pub fn new(seed: u64) -> Self {
        let state = if seed == 0 { 0x9e3779b97f4a7c15 } else { seed };
        Self { state }
    }

    /// Derive an independent stream, e.g. one per layer of a stacked RNN.
    pub fn fork(&mut self, salt: u64) -> SimpleRng {
        let mixed = self.next_u64() ^ salt.wrapping_mul(0x2545f4914f6cdd1d);
        SimpleRng::new(mixed)
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    /// Convert to [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        // 24 random bits keep the result strictly below 1.0
        (self.next_u32() >> 8) as f32 / (1u32 << 24) as f32
    }

    /// Uniform sample in [low, high).
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32()
    }

    /// Two independent standard normal samples (Box-Muller).
    ///
    /// Gaussian fills consume samples in pairs, which is why they need an
    /// even element count.
    pub fn gaussian_pair(&mut self) -> (f32, f32) {
        let u1 = (1.0 - self.next_f32()).max(f32::MIN_POSITIVE);
        let u2 = self.next_f32();
        let radius = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f32::consts::PI * u2;
        (radius * theta.cos(), radius * theta.sin())
    }
}
