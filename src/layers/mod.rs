//! Neural Network Layers
//!
//! Every layer here computes its own forward pass *and* the exact gradient of
//! the loss with respect to its input, then updates its parameters with plain
//! SGD. Nothing builds a graph; the composition order is the code.
//!
//! ## Layers
//!
//! - **linear**: Affine transform `y = x @ W + b`
//! - **activation**: ReLU and GELU
//! - **dense**: Linear followed by an activation
//! - **layer_norm**: Per-position feature normalization
//! - **feed_forward**: Dense then a projection back to the input width
//! - **attention**: The attention contract plus multi-head attention
//! - **encoder** / **decoder**: Transformer blocks
//! - **sequential**: An ordered stack of boxed layers
//!
//! ## Contract
//!
//! ```rust,ignore
//! let y = layer.forward(&x)?;              // lazily initializes, caches x
//! let dx = layer.backward(&dy, 0.01)?;     // gradients + SGD, consumes cache
//! ```
//!
//! A backward call is only valid against the forward call immediately before
//! it on the same layer. Calling backward with no cached forward, or after a
//! forward that failed, fails with
//! [`LayerError::Uninitialized`](crate::LayerError::Uninitialized).
//!
//! ## Lazy Parameters
//!
//! Layers are built from hyperparameters alone. The first `forward` sees the
//! real input, sizes the parameters from its feature axis, and moves the layer
//! from [`LayerState::Uninitialized`] to [`LayerState::Initialized`]. From then
//! on the feature width is fixed: a `forward` with a different width is a
//! [`LayerError::ShapeMismatch`](crate::LayerError::ShapeMismatch).

pub mod activation;
pub mod attention;
pub mod decoder;
pub mod dense;
pub mod encoder;
pub mod feed_forward;
pub mod layer_norm;
pub mod linear;
pub mod sequential;

use crate::error::{LayerError, Result};
use crate::tensor::Tensor;

/// A trainable layer.
pub trait Layer {
    /// Allocate parameters sized from `sample`'s feature axis.
    ///
    /// Calling this on an initialized layer draws fresh parameters, which
    /// discards any training.
    fn initialize(&mut self, sample: &Tensor) -> Result<()>;

    /// Compute the output, initializing on first use and caching what
    /// [`backward`](Layer::backward) needs.
    fn forward(&mut self, input: &Tensor) -> Result<Tensor>;

    /// Return the gradient with respect to the last forward input and apply
    /// an SGD step of size `learning_rate` to the layer's parameters.
    fn backward(&mut self, grad_output: &Tensor, learning_rate: f64) -> Result<Tensor>;

    /// Drop whatever the last forward left for backward, including in
    /// children. A composite calls this before running its children so a
    /// forward that fails partway leaves nothing for backward to consume.
    fn clear_cache(&mut self);
}

/// A parameter-free elementwise nonlinearity.
///
/// Activations keep their last input for backward but never take a learning
/// rate.
pub trait Activation {
    fn forward(&mut self, x: &Tensor) -> Tensor;
    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor>;
    fn clear_cache(&mut self);
}

/// Lazily created parameters.
#[derive(Clone, Debug, Default)]
pub enum LayerState<P> {
    #[default]
    Uninitialized,
    Initialized(P),
}

impl<P> LayerState<P> {
    pub fn is_initialized(&self) -> bool {
        matches!(self, LayerState::Initialized(_))
    }

    pub fn get(&self, layer: &'static str) -> Result<&P> {
        match self {
            LayerState::Initialized(params) => Ok(params),
            LayerState::Uninitialized => Err(LayerError::no_params(layer)),
        }
    }

    pub fn get_mut(&mut self, layer: &'static str) -> Result<&mut P> {
        match self {
            LayerState::Initialized(params) => Ok(params),
            LayerState::Uninitialized => Err(LayerError::no_params(layer)),
        }
    }
}

/// Feature width of a layer input; rank-0 tensors have none.
pub(crate) fn feature_width(layer: &'static str, x: &Tensor) -> Result<usize> {
    match x.shape.last() {
        Some(&width) if width > 0 => Ok(width),
        _ => Err(LayerError::Unsupported(format!(
            "{layer} needs a non-empty feature axis, got shape {:?}",
            x.shape
        ))),
    }
}

/// Take the cache from the last forward call or fail.
pub(crate) fn take_cache<C>(cache: &mut Option<C>, layer: &'static str) -> Result<C> {
    cache.take().ok_or_else(|| LayerError::no_forward(layer))
}

// Re-export main types for convenience
pub use activation::{Gelu, ReLU};
pub use attention::{Attention, AttentionGradients, MultiHeadAttention};
pub use decoder::{DecoderGradients, TransformerDecoder};
pub use dense::Dense;
pub use encoder::TransformerEncoder;
pub use feed_forward::FeedForward;
pub use layer_norm::{LayerNorm, LayerNormGradients};
pub use linear::{Linear, LinearGradients};
pub use sequential::Sequential;
