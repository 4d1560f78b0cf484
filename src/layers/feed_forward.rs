//! Position-wise Feed-Forward Network
//!
//! The feed-forward half of a transformer block:
//!
//! ```text
//! x [..., features] → Dense(hidden_units, ReLU) → Linear(features) → y [..., features]
//! ```
//!
//! The hidden width is a hyperparameter; the output width must equal the
//! input width so the block's residual sum lines up. That width is only known
//! once an input arrives, so the output projection is created at
//! initialization time rather than at construction. Initialization sizes both
//! projections at once.

use tracing::debug;

use super::activation::ReLU;
use super::dense::Dense;
use super::linear::Linear;
use super::{feature_width, Layer, LayerState};
use crate::error::{LayerError, Result};
use crate::init::SharedInitializer;
use crate::tensor::Tensor;

const NAME: &str = "feed_forward";

/// Dense → Linear, projecting back to the input width
pub struct FeedForward {
    dense: Dense,
    output: LayerState<Linear>,
    initializer: SharedInitializer,
}

impl FeedForward {
    pub fn new(hidden_units: usize, initializer: SharedInitializer) -> Self {
        Self {
            dense: Dense::with_initializer(hidden_units, ReLU::new(), initializer.clone()),
            output: LayerState::Uninitialized,
            initializer,
        }
    }

    pub fn dense(&self) -> &Dense {
        &self.dense
    }

    pub fn dense_mut(&mut self) -> &mut Dense {
        &mut self.dense
    }

    /// The output projection, once the input width is known
    pub fn output(&self) -> Result<&Linear> {
        self.output.get(NAME)
    }

    pub fn output_mut(&mut self) -> Result<&mut Linear> {
        self.output.get_mut(NAME)
    }

    /// Width the block was initialized for
    pub fn features(&self) -> Option<usize> {
        match &self.output {
            LayerState::Initialized(linear) => Some(linear.units()),
            LayerState::Uninitialized => None,
        }
    }
}

impl Layer for FeedForward {
    fn initialize(&mut self, x: &Tensor) -> Result<()> {
        let features = feature_width(NAME, x)?;
        self.dense.initialize(x)?;

        let hidden = self.dense.linear().units();
        let mut output = Linear::with_initializer(features, self.initializer.clone());
        output.initialize(&Tensor::zeros(vec![1, hidden]))?;
        self.output = LayerState::Initialized(output);
        debug!(features, hidden, "created feed-forward output projection");
        Ok(())
    }

    fn forward(&mut self, x: &Tensor) -> Result<Tensor> {
        self.clear_cache();
        if !self.output.is_initialized() {
            self.initialize(x)?;
        }
        let output = self.output.get_mut(NAME)?;
        let features = output.units();
        if feature_width(NAME, x)? != features {
            return Err(LayerError::shape(
                "feed-forward input",
                &x.with_last_dim(features),
                &x.shape,
            ));
        }

        let h = self.dense.forward(x)?;
        output.forward(&h)
    }

    fn backward(&mut self, grad_out: &Tensor, learning_rate: f64) -> Result<Tensor> {
        let output = self.output.get_mut(NAME)?;
        let grad_h = output.backward(grad_out, learning_rate)?;
        self.dense.backward(&grad_h, learning_rate)
    }

    fn clear_cache(&mut self) {
        self.dense.clear_cache();
        if let LayerState::Initialized(output) = &mut self.output {
            output.clear_cache();
        }
    }
}
