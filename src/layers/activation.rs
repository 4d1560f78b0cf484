//! Activation Functions
//!
//! Elementwise nonlinearities with their derivatives. They own no parameters;
//! each keeps only the input of its last forward call, which backward needs
//! to build the gradient mask.
//!
//! ## ReLU
//!
//! ```text
//! ReLU(x)      = max(x, 0)
//! grad_x[i]    = grad_y[i]  if x[i] >= 0
//!                0          otherwise
//! ```
//!
//! The derivative at exactly zero is taken to be 1: a zero input lets the
//! upstream gradient through. Results depend on this tie-break, so keep it.
//!
//! ## GELU (Gaussian Error Linear Unit)
//!
//! Tanh approximation:
//!
//! ```text
//! GELU(x) ≈ 0.5 × x × (1 + tanh(√(2/π) × (x + 0.044715 × x³)))
//! ```

use rayon::prelude::*;

use super::{take_cache, Activation};
use crate::error::{ensure_shape, Result};
use crate::tensor::Tensor;

/// Rectified linear unit
#[derive(Clone, Debug, Default)]
pub struct ReLU {
    x: Option<Tensor>,
}

impl ReLU {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Activation for ReLU {
    fn forward(&mut self, x: &Tensor) -> Tensor {
        self.x = Some(x.clone());
        x.map(|v| v.max(0.0))
    }

    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let x = take_cache(&mut self.x, "relu")?;
        ensure_shape("relu backward", &x.shape, &grad_out.shape)?;

        let grad = x
            .data
            .par_iter()
            .zip(&grad_out.data)
            .map(|(&x_val, &g)| if x_val >= 0.0 { g } else { 0.0 })
            .collect();
        Ok(Tensor::new(grad, x.shape))
    }

    fn clear_cache(&mut self) {
        self.x = None;
    }
}

const SQRT_2_OVER_PI: f64 = 0.797_884_560_802_865_4;
const GELU_COEFF: f64 = 0.044715;

/// GELU activation, tanh approximation
#[derive(Clone, Debug, Default)]
pub struct Gelu {
    x: Option<Tensor>,
}

impl Gelu {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Activation for Gelu {
    fn forward(&mut self, x: &Tensor) -> Tensor {
        self.x = Some(x.clone());
        x.map(|val| 0.5 * val * (1.0 + (SQRT_2_OVER_PI * (val + GELU_COEFF * val.powi(3))).tanh()))
    }

    /// grad_x = grad_y × GELU'(x), where GELU'(x) combines the tanh term and
    /// the sech² term from the product rule.
    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let x = take_cache(&mut self.x, "gelu")?;
        ensure_shape("gelu backward", &x.shape, &grad_out.shape)?;

        let grad = x
            .data
            .par_iter()
            .zip(&grad_out.data)
            .map(|(&x_val, &grad_val)| {
                let inner = SQRT_2_OVER_PI * (x_val + GELU_COEFF * x_val.powi(3));
                let tanh_inner = inner.tanh();
                let sech_sq = 1.0 - tanh_inner * tanh_inner;

                let grad_gelu = 0.5 * (1.0 + tanh_inner)
                    + 0.5 * x_val * sech_sq * SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_COEFF * x_val.powi(2));

                grad_val * grad_gelu
            })
            .collect();

        Ok(Tensor::new(grad, x.shape))
    }

    fn clear_cache(&mut self) {
        self.x = None;
    }
}
