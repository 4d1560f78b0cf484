//! Parameter Initializers
//!
//! Stateful layers never decide how their parameters are filled. They are
//! handed an [`Initializer`] at construction and call it once, lazily, when
//! the first input reveals the shapes.
//!
//! Any `Fn(&[usize]) -> Tensor + Send + Sync` is an initializer, so tests can
//! inject exact weights:
//!
//! ```rust
//! use std::sync::Arc;
//! use touchstone::{Initializer, Tensor};
//!
//! let eye = |shape: &[usize]| {
//!     let n: usize = shape.iter().product();
//!     Tensor::new((0..n).map(|i| if i == 0 { 1.0 } else { 0.0 }).collect(), shape.to_vec())
//! };
//! let init: Arc<dyn Initializer> = Arc::new(eye);
//! assert_eq!(init.init(&[2]).data, vec![1.0, 0.0]);
//! ```
//!
//! ## Stock Initializers
//!
//! - [`Zeros`], [`Constant`]: deterministic fills
//! - [`RandomNormal`]: Gaussian, GPT-2 style default of `N(0, 0.02)`
//! - [`RandomUniform`]: uniform in `[low, high)`
//!
//! The random initializers keep their own RNG behind a mutex so a seeded
//! initializer shared by several layers produces one reproducible stream.

use std::sync::{Arc, Mutex, PoisonError};

use rand::distr::Uniform;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::tensor::Tensor;

/// Produces a tensor of the requested shape.
pub trait Initializer: Send + Sync {
    fn init(&self, shape: &[usize]) -> Tensor;
}

impl<F> Initializer for F
where
    F: Fn(&[usize]) -> Tensor + Send + Sync,
{
    fn init(&self, shape: &[usize]) -> Tensor {
        self(shape)
    }
}

/// Shared handle to an initializer.
///
/// Composite layers hold one so they can pass it to children they create
/// lazily (the transformer blocks' output projection).
pub type SharedInitializer = Arc<dyn Initializer>;

/// Fills with 0.0
#[derive(Clone, Copy, Debug, Default)]
pub struct Zeros;

impl Initializer for Zeros {
    fn init(&self, shape: &[usize]) -> Tensor {
        Tensor::zeros(shape.to_vec())
    }
}

/// Fills with a fixed value
#[derive(Clone, Copy, Debug)]
pub struct Constant(pub f64);

impl Initializer for Constant {
    fn init(&self, shape: &[usize]) -> Tensor {
        Tensor::full(shape.to_vec(), self.0)
    }
}

fn seeded(seed: Option<u64>) -> Mutex<StdRng> {
    let rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    Mutex::new(rng)
}

fn sample<D: Distribution<f64>>(rng: &Mutex<StdRng>, dist: &D, shape: &[usize]) -> Tensor {
    let size: usize = shape.iter().product();
    // A poisoned lock only means another thread panicked mid-sample; the RNG
    // state is still usable.
    let mut rng = rng.lock().unwrap_or_else(PoisonError::into_inner);
    let data = (0..size).map(|_| dist.sample(&mut *rng)).collect();
    Tensor::new(data, shape.to_vec())
}

/// Gaussian initializer
pub struct RandomNormal {
    dist: Normal<f64>,
    rng: Mutex<StdRng>,
}

impl RandomNormal {
    /// # Panics
    ///
    /// Panics if `std` is negative or not finite.
    pub fn new(mean: f64, std: f64) -> Self {
        Self::build(mean, std, None)
    }

    /// Seeded variant for reproducible runs
    pub fn seeded(mean: f64, std: f64, seed: u64) -> Self {
        Self::build(mean, std, Some(seed))
    }

    fn build(mean: f64, std: f64, seed: Option<u64>) -> Self {
        let dist = match Normal::new(mean, std) {
            Ok(dist) => dist,
            Err(err) => panic!("invalid normal distribution N({mean}, {std}): {err}"),
        };
        Self {
            dist,
            rng: seeded(seed),
        }
    }
}

impl Default for RandomNormal {
    fn default() -> Self {
        Self::new(0.0, 0.02)
    }
}

impl Initializer for RandomNormal {
    fn init(&self, shape: &[usize]) -> Tensor {
        sample(&self.rng, &self.dist, shape)
    }
}

/// Uniform initializer over `[low, high)`
pub struct RandomUniform {
    dist: Uniform<f64>,
    rng: Mutex<StdRng>,
}

impl RandomUniform {
    /// # Panics
    ///
    /// Panics unless `low < high`.
    pub fn new(low: f64, high: f64) -> Self {
        Self::build(low, high, None)
    }

    pub fn seeded(low: f64, high: f64, seed: u64) -> Self {
        Self::build(low, high, Some(seed))
    }

    fn build(low: f64, high: f64, seed: Option<u64>) -> Self {
        let dist = match Uniform::new(low, high) {
            Ok(dist) => dist,
            Err(err) => panic!("invalid uniform range [{low}, {high}): {err}"),
        };
        Self {
            dist,
            rng: seeded(seed),
        }
    }
}

impl Initializer for RandomUniform {
    fn init(&self, shape: &[usize]) -> Tensor {
        sample(&self.rng, &self.dist, shape)
    }
}

/// Default initializer for weights and biases: `N(0, 0.02)`
pub fn default_initializer() -> SharedInitializer {
    Arc::new(RandomNormal::default())
}
