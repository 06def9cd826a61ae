use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

/// Uniform draw in `[low, high)` from a single `f64` sample, so a scripted
/// source controls each draw exactly.
pub fn uniform<R: Rng + ?Sized>(rng: &mut R, low: f64, high: f64) -> f64 {
    low + (high - low) * rng.random::<f64>()
}

/// Builds the random source for one simulation call. A configured seed makes
/// the call reproducible per patient and cycle; otherwise it is drawn from the OS.
pub fn call_rng(seed: Option<u64>, patient_id: Uuid, cycle: i32) -> StdRng {
    match seed {
        Some(seed) => {
            let (high, low) = patient_id.as_u64_pair();
            StdRng::seed_from_u64(seed ^ high ^ low.rotate_left(17) ^ cycle as u64)
        }
        None => StdRng::from_os_rng(),
    }
}

#[cfg(test)]
pub mod testing {
    use std::collections::VecDeque;

    use rand::RngCore;

    /// Replays a fixed list of unit-interval samples. Exhaustion falls back to 0.5.
    pub struct ScriptedRng {
        samples: VecDeque<f64>,
    }

    impl ScriptedRng {
        pub fn new(samples: &[f64]) -> Self {
            Self {
                samples: samples.iter().copied().collect(),
            }
        }
    }

    impl RngCore for ScriptedRng {
        fn next_u32(&mut self) -> u32 {
            (self.next_u64() >> 32) as u32
        }

        fn next_u64(&mut self) -> u64 {
            let sample = self.samples.pop_front().unwrap_or(0.5).clamp(0.0, 1.0 - f64::EPSILON);
            // f64 sampling keeps the top 53 bits.
            ((sample * (1u64 << 53) as f64) as u64) << 11
        }

        fn fill_bytes(&mut self, dst: &mut [u8]) {
            for chunk in dst.chunks_mut(8) {
                let bytes = self.next_u64().to_le_bytes();
                chunk.copy_from_slice(&bytes[..chunk.len()]);
            }
        }
    }
}
