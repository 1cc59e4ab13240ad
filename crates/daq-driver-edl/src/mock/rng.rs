//! Seeded RNG for reproducible simulator output.
//!
//! The simulator draws measurement noise and random link faults from here,
//! so a fixed seed replays the same recording and the same failures.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Seeded RNG wrapper.
pub struct SimRng {
    inner: Mutex<ChaCha8Rng>,
}

impl SimRng {
    /// Create a generator. Without a seed, entropy is taken from the OS.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            inner: Mutex::new(rng),
        }
    }

    /// Whether an operation should fail at probability `rate` (0.0..=1.0).
    pub fn should_fail(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.inner.lock().r#gen::<f64>() < rate
    }

    /// Uniform noise in `[-amplitude, amplitude)`.
    pub fn noise(&self, amplitude: f32) -> f32 {
        if amplitude <= 0.0 {
            return 0.0;
        }
        self.inner.lock().gen_range(-amplitude..amplitude)
    }
}

impl Default for SimRng {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for SimRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimRng")
            .field("inner", &"<Mutex<ChaCha8Rng>>")
            .finish()
    }
}
