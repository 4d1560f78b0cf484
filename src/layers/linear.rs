//! Linear Layer (Fully Connected)
//!
//! The linear layer performs an affine transformation: y = x @ W + b
//!
//! ## Forward Pass
//!
//! ```text
//! Input:  x [..., in_features]
//! Weight: W [in_features, out_features]
//! Bias:   b [out_features]
//! Output: y = x @ W + b [..., out_features]
//! ```
//!
//! Leading axes are flattened into rows for the product and restored
//! afterwards; the bias broadcasts over all of them.
//!
//! ## Backward Pass
//!
//! Using the chain rule, with x and grad_y flattened to rows:
//! ```text
//! grad_W = x^T @ grad_y
//! grad_b = sum(grad_y) over every leading axis
//! grad_x = grad_y @ W^T
//! ```
//!
//! followed by the SGD update `W -= lr * grad_W`, `b -= lr * grad_b`.

use tracing::{debug, warn};

use super::{feature_width, take_cache, Layer, LayerState};
use crate::error::{ensure_shape, LayerError, Result};
use crate::init::{default_initializer, SharedInitializer};
use crate::tensor::Tensor;

const NAME: &str = "linear";

/// Weight and bias of an initialized linear layer
#[derive(Clone, Debug)]
pub struct LinearParams {
    pub weight: Tensor,
    pub bias: Tensor,
}

/// Linear layer (fully connected)
///
/// Performs y = x @ W + b where:
/// - W: weight matrix [in_features, units]
/// - b: bias vector [units]
///
/// `in_features` is unknown until the first input arrives.
pub struct Linear {
    units: usize,
    initializer: SharedInitializer,
    state: LayerState<LinearParams>,
    cache: Option<Tensor>,
    grads: Option<LinearGradients>,
}

impl Linear {
    /// Create a linear layer with `units` outputs and the default
    /// `N(0, 0.02)` initializer
    pub fn new(units: usize) -> Self {
        Self::with_initializer(units, default_initializer())
    }

    /// Create a linear layer drawing W and b from `initializer`
    pub fn with_initializer(units: usize, initializer: SharedInitializer) -> Self {
        Self {
            units,
            initializer,
            state: LayerState::Uninitialized,
            cache: None,
            grads: None,
        }
    }

    pub fn units(&self) -> usize {
        self.units
    }

    /// Input width fixed at initialization, if any
    pub fn input_width(&self) -> Option<usize> {
        match &self.state {
            LayerState::Initialized(p) => Some(p.weight.shape[0]),
            LayerState::Uninitialized => None,
        }
    }

    pub fn weight(&self) -> Result<&Tensor> {
        Ok(&self.state.get(NAME)?.weight)
    }

    pub fn bias(&self) -> Result<&Tensor> {
        Ok(&self.state.get(NAME)?.bias)
    }

    pub fn params_mut(&mut self) -> Result<&mut LinearParams> {
        self.state.get_mut(NAME)
    }

    /// Gradients computed by the most recent backward call
    pub fn gradients(&self) -> Option<&LinearGradients> {
        self.grads.as_ref()
    }
}

impl Layer for Linear {
    fn initialize(&mut self, x: &Tensor) -> Result<()> {
        if self.units == 0 {
            return Err(LayerError::InvalidConfig(
                "linear layer needs at least one unit".into(),
            ));
        }
        let input_width = feature_width(NAME, x)?;
        if self.state.is_initialized() {
            warn!(input_width, units = self.units, "re-initializing linear layer");
        }

        let weight = self.initializer.init(&[input_width, self.units]);
        let bias = self.initializer.init(&[self.units]);
        ensure_shape("linear weight initializer", &[input_width, self.units], &weight.shape)?;
        ensure_shape("linear bias initializer", &[self.units], &bias.shape)?;

        debug!(input_width, units = self.units, "initialized linear layer");
        self.state = LayerState::Initialized(LinearParams { weight, bias });
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
        let expected = params.weight.shape[0];
        if feature_width(NAME, x)? != expected {
            return Err(LayerError::shape("linear forward", &x.with_last_dim(expected), &x.shape));
        }

        let y = x.matmul(&params.weight).add(&params.bias);
        self.cache = Some(x.clone());
        Ok(y)
    }

    fn backward(&mut self, grad_out: &Tensor, learning_rate: f64) -> Result<Tensor> {
        let x = take_cache(&mut self.cache, NAME)?;
        let params = self.state.get_mut(NAME)?;
        ensure_shape("linear backward", &x.with_last_dim(self.units), &grad_out.shape)?;

        // grad_W = x^T @ grad_out, with leading axes folded into rows
        let grad_weight = x
            .flatten_rows()
            .transpose(-2, -1)
            .matmul(&grad_out.flatten_rows());

        // grad_b = sum(grad_out) along all dims except last
        let grad_bias = grad_out.sum_leading();

        // grad_x = grad_out @ W^T, computed before W moves
        let grad_x = grad_out.matmul(&params.weight.transpose(-2, -1));

        params.weight.sgd_step(&grad_weight, learning_rate);
        params.bias.sgd_step(&grad_bias, learning_rate);

        self.grads = Some(LinearGradients {
            weight: grad_weight,
            bias: grad_bias,
            x: grad_x.clone(),
        });
        Ok(grad_x)
    }

    fn clear_cache(&mut self) {
        self.cache = None;
    }
}

/// Gradients for linear layer
#[derive(Clone, Debug)]
pub struct LinearGradients {
    pub weight: Tensor,
    pub bias: Tensor,
    pub x: Tensor, // Gradient to pass to previous layer
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::init::{Constant, RandomNormal};

    /// Initializer that hands out fixed tensors keyed by rank
    fn fixed(weight: Vec<f64>, bias: Vec<f64>) -> SharedInitializer {
        Arc::new(move |shape: &[usize]| {
            let data = if shape.len() == 2 { weight.clone() } else { bias.clone() };
            Tensor::new(data, shape.to_vec())
        })
    }

    #[test]
    fn test_forward_shape_keeps_leading_axes() {
        let mut layer = Linear::with_initializer(5, Arc::new(RandomNormal::seeded(0.0, 1.0, 3)));
        for shape in [vec![4], vec![2, 4], vec![3, 2, 4], vec![1, 2, 3, 4]] {
            let x = Tensor::zeros(shape.clone());
            let y = layer.forward(&x).unwrap();
            let mut expected = shape;
            *expected.last_mut().unwrap() = 5;
            assert_eq!(y.shape, expected);
        }
    }

    #[test]
    fn test_end_to_end_scenario() {
        let mut layer = Linear::with_initializer(
            3,
            fixed(vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0], vec![0.0, 0.0, 0.0]),
        );
        let x = Tensor::new(vec![1.0, 2.0], vec![1, 2]);
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.data, vec![1.0, 2.0, 0.0]);
        assert_eq!(y.shape, vec![1, 3]);

        let dy = Tensor::new(vec![1.0, 1.0, 1.0], vec![1, 3]);
        let dx = layer.backward(&dy, 0.1).unwrap();
        assert_eq!(dx.shape, vec![1, 2]);
        assert_eq!(dx.data, vec![1.0, 1.0]);

        let grads = layer.gradients().unwrap();
        assert_eq!(grads.bias.data, vec![1.0, 1.0, 1.0]);
        assert_eq!(grads.weight.shape, vec![2, 3]);
        assert_eq!(grads.weight.data, vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);

        let bias = layer.bias().unwrap();
        for &b in &bias.data {
            assert!((b + 0.1).abs() < 1e-12);
        }
        let weight = layer.weight().unwrap();
        let expected = [0.9, -0.1, -0.1, -0.2, 0.8, -0.2];
        for (w, e) in weight.data.iter().zip(expected) {
            assert!((w - e).abs() < 1e-12);
        }
    }

    #[test]
    fn test_bias_gradient_sums_over_all_leading_axes() {
        let mut layer = Linear::with_initializer(2, Arc::new(Constant(0.5)));
        let x = Tensor::full(vec![2, 3, 4], 1.0);
        layer.forward(&x).unwrap();
        let dy = Tensor::full(vec![2, 3, 2], 1.0);
        let dx = layer.backward(&dy, 0.0).unwrap();
        assert_eq!(dx.shape, vec![2, 3, 4]);
        assert_eq!(layer.gradients().unwrap().bias.data, vec![6.0, 6.0]);
        assert_eq!(layer.gradients().unwrap().weight.data, vec![6.0; 8]);
    }

    #[test]
    fn test_backward_without_forward_fails() {
        let mut layer = Linear::new(2);
        let err = layer.backward(&Tensor::zeros(vec![1, 2]), 0.1).unwrap_err();
        assert!(matches!(err, LayerError::Uninitialized { .. }));
    }

    #[test]
    fn test_second_backward_needs_new_forward() {
        let mut layer = Linear::new(2);
        layer.forward(&Tensor::zeros(vec![1, 3])).unwrap();
        layer.backward(&Tensor::zeros(vec![1, 2]), 0.1).unwrap();
        assert!(layer.backward(&Tensor::zeros(vec![1, 2]), 0.1).is_err());
    }

    #[test]
    fn test_backward_rejects_wrong_gradient_shape() {
        let mut layer = Linear::new(2);
        layer.forward(&Tensor::zeros(vec![4, 3])).unwrap();
        let err = layer.backward(&Tensor::zeros(vec![4, 3]), 0.1).unwrap_err();
        assert!(matches!(err, LayerError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_accessors_before_init_fail() {
        let layer = Linear::new(2);
        assert!(layer.weight().is_err());
        assert!(layer.bias().is_err());
        assert!(layer.input_width().is_none());
    }

    #[test]
    fn test_forward_rejects_changed_feature_width() {
        let mut layer = Linear::new(2);
        layer.forward(&Tensor::zeros(vec![1, 3])).unwrap();
        let err = layer.forward(&Tensor::zeros(vec![1, 4])).unwrap_err();
        assert!(matches!(err, LayerError::ShapeMismatch { .. }));
        // Parameters are untouched by the rejected call
        assert_eq!(layer.weight().unwrap().shape, vec![3, 2]);
        // and the earlier forward can no longer be backpropagated
        assert!(matches!(
            layer.backward(&Tensor::zeros(vec![1, 2]), 0.1),
            Err(LayerError::Uninitialized { .. })
        ));
    }

    #[test]
    fn test_explicit_reinitialize_reshapes_parameters() {
        let mut layer = Linear::new(2);
        layer.forward(&Tensor::zeros(vec![1, 3])).unwrap();
        layer.initialize(&Tensor::zeros(vec![1, 4])).unwrap();
        assert_eq!(layer.weight().unwrap().shape, vec![4, 2]);
        assert_eq!(layer.input_width(), Some(4));
        // The old cache is gone with the old parameters
        assert!(layer.backward(&Tensor::zeros(vec![1, 2]), 0.1).is_err());
    }

    #[test]
    fn test_bad_initializer_shape_is_rejected() {
        let mut layer = Linear::with_initializer(2, Arc::new(|_: &[usize]| Tensor::zeros(vec![1])));
        let err = layer.forward(&Tensor::zeros(vec![1, 3])).unwrap_err();
        assert!(matches!(err, LayerError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_zero_units_is_invalid() {
        let mut layer = Linear::new(0);
        assert!(matches!(
            layer.forward(&Tensor::zeros(vec![1, 3])),
            Err(LayerError::InvalidConfig(_))
        ));
    }
}
