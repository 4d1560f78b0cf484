//! Layer Normalization
//!
//! Normalizes each position's feature vector to zero mean and unit variance,
//! then applies a learnable scale (gamma) and shift (beta). Statistics are
//! taken over the last axis only; every leading index is independent.
//!
//! ## Forward Pass
//!
//! ```text
//! 1. mean = E[x] = sum(x) / N
//! 2. var = E[(x - mean)²] = sum((x - mean)²) / N
//! 3. x_norm = (x - mean) / √(var + ε)
//! 4. y = γ * x_norm + β
//! ```
//!
//! ## Backward Pass
//!
//! ```text
//! grad_γ = sum(grad_y * x_norm)
//! grad_β = sum(grad_y)
//! grad_x_norm = grad_y * γ
//! grad_x = (grad_x_norm - E[grad_x_norm] - x_norm * E[grad_x_norm * x_norm]) / √(var + ε)
//! ```
//!
//! The two expectation terms account for every element's influence on the
//! row mean and the row variance respectively.

use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, warn};

use super::{feature_width, take_cache, Layer, LayerState};
use crate::error::{ensure_shape, LayerError, Result};
use crate::init::{Constant, SharedInitializer, Zeros};
use crate::tensor::Tensor;

const NAME: &str = "layer_norm";

/// Default ε
pub const DEFAULT_EPSILON: f64 = 1e-3;

#[derive(Clone, Debug)]
pub struct LayerNormParams {
    pub gamma: Tensor, // Scale parameter [features]
    pub beta: Tensor,  // Shift parameter [features]
}

/// Values needed for the backward pass
struct LayerNormCache {
    x_norm: Tensor,
    std: Vec<f64>, // √(var + ε), one per row
}

/// Layer normalization layer
pub struct LayerNorm {
    epsilon: f64,
    gamma_init: SharedInitializer,
    beta_init: SharedInitializer,
    state: LayerState<LayerNormParams>,
    cache: Option<LayerNormCache>,
    grads: Option<LayerNormGradients>,
}

impl LayerNorm {
    /// Create a layer norm with gamma = 1, beta = 0 at initialization
    pub fn new(epsilon: f64) -> Self {
        Self::with_initializers(epsilon, Arc::new(Constant(1.0)), Arc::new(Zeros))
    }

    /// Draw both gamma and beta from the same initializer
    pub fn with_initializer(epsilon: f64, initializer: SharedInitializer) -> Self {
        Self::with_initializers(epsilon, initializer.clone(), initializer)
    }

    pub fn with_initializers(
        epsilon: f64,
        gamma_init: SharedInitializer,
        beta_init: SharedInitializer,
    ) -> Self {
        Self {
            epsilon,
            gamma_init,
            beta_init,
            state: LayerState::Uninitialized,
            cache: None,
            grads: None,
        }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn gamma(&self) -> Result<&Tensor> {
        Ok(&self.state.get(NAME)?.gamma)
    }

    pub fn beta(&self) -> Result<&Tensor> {
        Ok(&self.state.get(NAME)?.beta)
    }

    pub fn params_mut(&mut self) -> Result<&mut LayerNormParams> {
        self.state.get_mut(NAME)
    }

    pub fn gradients(&self) -> Option<&LayerNormGradients> {
        self.grads.as_ref()
    }
}

impl Default for LayerNorm {
    fn default() -> Self {
        Self::new(DEFAULT_EPSILON)
    }
}

impl Layer for LayerNorm {
    fn initialize(&mut self, x: &Tensor) -> Result<()> {
        if !(self.epsilon > 0.0) {
            return Err(LayerError::InvalidConfig(format!(
                "layer norm epsilon must be positive, got {}",
                self.epsilon
            )));
        }
        let features = feature_width(NAME, x)?;
        if self.state.is_initialized() {
            warn!(features, "re-initializing layer norm");
        }

        let gamma = self.gamma_init.init(&[features]);
        let beta = self.beta_init.init(&[features]);
        ensure_shape("layer norm gamma initializer", &[features], &gamma.shape)?;
        ensure_shape("layer norm beta initializer", &[features], &beta.shape)?;

        debug!(features, epsilon = self.epsilon, "initialized layer norm");
        self.state = LayerState::Initialized(LayerNormParams { gamma, beta });
        self.cache = None;
        self.grads = None;
        Ok(())
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        self.cache = None;
        if !self.state.is_initialized() {
            self.initialize(x)?;
        }
        let params = self.state.get(NAME)?;
        let features = params.gamma.len();
        if feature_width(NAME, x)? != features {
            return Err(LayerError::shape(
                "layer norm forward",
                &x.with_last_dim(features),
                &x.shape,
            ));
        }

        // Compute statistics along last dimension
        let mean = x.mean_last(false);
        let std: Vec<f64> = x
            .var_last(false)
            .data
            .par_iter()
            .map(|&v| (v + self.epsilon).sqrt())
            .collect();

        // Normalize row by row
        let mut x_norm = x.clone();
        x_norm
            .data
            .par_chunks_mut(features)
            .enumerate()
            .for_each(|(row, values)| {
                for v in values.iter_mut() {
                    *v = (*v - mean.data[row]) / std[row];
                }
            });

        // Apply learnable scale and shift
        let y = x_norm.mul(&params.gamma).add(&params.beta);

        self.cache = Some(LayerNormCache { x_norm, std });
        Ok(y)
    }

    fn backward(&mut self, grad_out: &Tensor, learning_rate: f64) -> Result<Tensor> {
        let cache = take_cache(&mut self.cache, NAME)?;
        let params = self.state.get_mut(NAME)?;
        ensure_shape("layer norm backward", &cache.x_norm.shape, &grad_out.shape)?;
        let features = params.gamma.len();

        // grad_gamma and grad_beta accumulate over every row
        let grad_gamma = grad_out.mul(&cache.x_norm).sum_leading();
        let grad_beta = grad_out.sum_leading();

        // Backprop through scale: grad_x_norm = grad_out * gamma
        let grad_x_norm = grad_out.mul(&params.gamma);

        // Backprop through normalization, accounting for the mean and
        // variance dependencies within each row
        let mut grad_x = grad_x_norm.clone();
        grad_x
            .data
            .par_chunks_mut(features)
            .enumerate()
            .for_each(|(row, grad_row)| {
                let start = row * features;
                let x_norm_row = &cache.x_norm.data[start..start + features];

                let mean_grad = grad_row.iter().sum::<f64>() / features as f64;
                let mean_grad_x = grad_row
                    .iter()
                    .zip(x_norm_row)
                    .map(|(g, x)| g * x)
                    .sum::<f64>()
                    / features as f64;

                for (g, &xn) in grad_row.iter_mut().zip(x_norm_row) {
                    *g = (*g - mean_grad - xn * mean_grad_x) / cache.std[row];
                }
            });

        params.gamma.sgd_step(&grad_gamma, learning_rate);
        params.beta.sgd_step(&grad_beta, learning_rate);

        self.grads = Some(LayerNormGradients {
            gamma: grad_gamma,
            beta: grad_beta,
            x: grad_x.clone(),
        });
        Ok(grad_x)
    }

    fn clear_cache(&mut self) {
        self.cache = None;
    }
}

/// Gradients for layer norm
#[derive(Clone, Debug)]
pub struct LayerNormGradients {
    pub gamma: Tensor,
    pub beta: Tensor,
    pub x: Tensor,
}
