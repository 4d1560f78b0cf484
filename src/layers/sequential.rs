//! Sequential Stack
//!
//! An ordered list of boxed layers run one after another. The forward pass
//! goes front to back, the backward pass back to front, each layer consuming
//! the gradient its successor produced.
//!
//! ```rust
//! use touchstone::{Dense, Layer, Linear, Sequential, Tensor};
//!
//! let mut model = Sequential::new()
//!     .with(Dense::new(16))
//!     .with(Linear::new(1));
//!
//! let x = Tensor::full(vec![4, 3], 0.5);
//! let y = model.forward(&x).unwrap();
//! assert_eq!(y.shape, vec![4, 1]);
//!
//! let dx = model.backward(&Tensor::full(vec![4, 1], 1.0), 0.01).unwrap();
//! assert_eq!(dx.shape, vec![4, 3]);
//! ```

use tracing::debug;

use super::Layer;
use crate::error::Result;
use crate::tensor::Tensor;

#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Layer>>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`push`](Self::push)
    pub fn with(mut self, layer: impl Layer + 'static) -> Self {
        self.push(layer);
        self
    }

    pub fn push(&mut self, layer: impl Layer + 'static) {
        self.layers.push(Box::new(layer));
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Box<dyn Layer>] {
        &mut self.layers
    }
}

impl Layer for Sequential {
    /// Initialize every layer in turn.
    ///
    /// A layer's input width is only known from its predecessor's output, so
    /// each layer after the first is sized by running the sample forward.
    fn initialize(&mut self, sample: &Tensor) -> Result<()> {
        let mut x = sample.clone();
        let last = self.layers.len().saturating_sub(1);
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.initialize(&x)?;
            if i < last {
                x = layer.forward(&x)?;
            }
        }
        debug!(layers = self.layers.len(), "initialized sequential stack");
        Ok(())
    }

    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        self.clear_cache();
        let mut x = input.clone();
        for layer in self.layers.iter_mut() {
            x = layer.forward(&x)?;
        }
        Ok(x)
    }

    fn backward(&mut self, grad_output: &Tensor, learning_rate: f64) -> Result<Tensor> {
        let mut grad = grad_output.clone();
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(&grad, learning_rate)?;
        }
        Ok(grad)
    }

    fn clear_cache(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.clear_cache();
        }
    }
}
