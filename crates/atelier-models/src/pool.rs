//! History buffer of generated samples fed to the discriminator.

use candle_core::{Result, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Fixed-capacity pool of past fakes.
///
/// Each element of a queried batch is handled independently: while the
/// pool is filling it is stored and returned unchanged; once full, with
/// probability 0.5 a uniformly chosen stored sample is returned in its place
/// and replaced by the new one. Capacity 0 disables the pool.
pub struct ImagePool {
    capacity: usize,
    images: Vec<Tensor>,
    rng: StdRng,
}

impl ImagePool {
    pub fn new(capacity: usize, seed: u64) -> Self {
        Self {
            capacity,
            images: Vec::with_capacity(capacity),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Mix a batch (B, ...) with the history; the result is detached
    pub fn query(&mut self, batch: &Tensor) -> Result<Tensor> {
        if self.capacity == 0 {
            return Ok(batch.clone());
        }
        let batch = batch.detach();
        let mut out = Vec::with_capacity(batch.dim(0)?);
        for i in 0..batch.dim(0)? {
            let image = batch.get(i)?;
            if self.images.len() < self.capacity {
                self.images.push(image.clone());
                out.push(image);
            } else if self.rng.gen_bool(0.5) {
                let slot = self.rng.gen_range(0..self.capacity);
                let stored = std::mem::replace(&mut self.images[slot], image);
                out.push(stored);
            } else {
                out.push(image);
            }
        }
        Tensor::stack(&out, 0)
    }
}
