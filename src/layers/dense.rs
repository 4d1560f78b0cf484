//! Dense Layer
//!
//! A linear layer followed by an activation:
//!
//! ```text
//! x → Linear → Activation → y
//! ```
//!
//! Backward runs the same chain in reverse. The activation's gradient comes
//! first, then the linear layer's backward, which is also where the SGD
//! update happens.
//!
//! The activation is a type parameter defaulting to [`ReLU`], so
//! `Dense::new(64)` is a ReLU layer and `Dense::with_activation(64, Gelu::new())`
//! swaps it without any runtime dispatch.

use super::activation::ReLU;
use super::linear::Linear;
use super::{Activation, Layer};
use crate::error::Result;
use crate::init::SharedInitializer;
use crate::tensor::Tensor;

/// Linear + activation
pub struct Dense<A: Activation = ReLU> {
    linear: Linear,
    activation: A,
}

impl Dense<ReLU> {
    /// Dense layer with ReLU activation and default initialization
    pub fn new(units: usize) -> Self {
        Self::with_activation(units, ReLU::new())
    }
}

impl<A: Activation> Dense<A> {
    pub fn with_activation(units: usize, activation: A) -> Self {
        Self {
            linear: Linear::new(units),
            activation,
        }
    }

    /// Dense layer whose linear part draws from `initializer`
    pub fn with_initializer(units: usize, activation: A, initializer: SharedInitializer) -> Self {
        Self {
            linear: Linear::with_initializer(units, initializer),
            activation,
        }
    }

    pub fn linear(&self) -> &Linear {
        &self.linear
    }

    pub fn linear_mut(&mut self) -> &mut Linear {
        &mut self.linear
    }
}

impl<A: Activation> Layer for Dense<A> {
    fn initialize(&mut self, x: &Tensor) -> Result<()> {
        // Activations have nothing to size
        self.activation.clear_cache();
        self.linear.initialize(x)
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        self.clear_cache();
        let h = self.linear.forward(x)?;
        Ok(self.activation.forward(&h))
    }

    fn backward(&mut self, grad_out: &Tensor, learning_rate: f64) -> Result<Tensor> {
        let grad_h = self.activation.backward(grad_out)?;
        self.linear.backward(&grad_h, learning_rate)
    }

    fn clear_cache(&mut self) {
        self.linear.clear_cache();
        self.activation.clear_cache();
    }
}
