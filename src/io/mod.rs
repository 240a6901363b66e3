//! Randomness Abstraction
//!
//! Batch-key suffixes and fault injection draw from [`Rng`] so a whole run
//! can be replayed from a single seed in simulation.

pub mod simulation;

pub use simulation::SimulatedRng;

/// Source of randomness
pub trait Rng: Send + 'static {
    fn next_u64(&mut self) -> u64;

    fn gen_bool(&mut self, probability: f64) -> bool;

    /// Uniform value in `[min, max)`; returns `min` when the range is empty
    fn gen_range(&mut self, min: u64, max: u64) -> u64;
}

/// Entropy-seeded RNG for production use
pub struct ProductionRng {
    inner: rand::rngs::StdRng,
}

impl ProductionRng {
    pub fn new() -> Self {
        use rand::SeedableRng;
        ProductionRng {
            inner: rand::rngs::StdRng::from_entropy(),
        }
    }
}

impl Default for ProductionRng {
    fn default() -> Self {
        Self::new()
    }
}

impl Rng for ProductionRng {
    fn next_u64(&mut self) -> u64 {
        use rand::RngCore;
        self.inner.next_u64()
    }

    fn gen_bool(&mut self, probability: f64) -> bool {
        use rand::Rng;
        self.inner.gen_bool(probability.clamp(0.0, 1.0))
    }

    fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        use rand::Rng;
        if min >= max {
            return min;
        }
        self.inner.gen_range(min..max)
    }
}

/// How each actor obtains its RNG
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RngSource {
    /// Fresh entropy per actor
    Entropy,
    /// Deterministic per-key streams derived from one seed
    Seeded(u64),
}

impl RngSource {
    pub fn for_key(&self, key: &str) -> Box<dyn Rng> {
        match self {
            RngSource::Entropy => Box::new(ProductionRng::new()),
            RngSource::Seeded(seed) => Box::new(SimulatedRng::new(seed ^ fnv1a(key))),
        }
    }
}

fn fnv1a(key: &str) -> u64 {
    key.bytes().fold(0xcbf2_9ce4_8422_2325u64, |hash, b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}
