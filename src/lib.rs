//! Touchstone: Hand-Differentiated Neural Network Layers
//!
//! Trainable layers and transformer blocks implemented from scratch in Rust,
//! each with an explicit forward pass, an exact analytic backward pass, and a
//! plain SGD update. There is no autograd: every gradient is written out by
//! hand. Named after the court fool from *As You Like It*, whose wit is the
//! test other characters are measured against.
//!
//! # Modules
//!
//! - [`tensor`] - Row-major `f64` tensors
//! - [`layers`] - Linear, activations, Dense, LayerNorm, attention, encoder and decoder blocks
//! - [`init`] - Parameter initializers
//! - [`config`] - Transformer block hyperparameters (JSON via serde)
//! - [`error`] - The crate error type
//!
//! # Example
//!
//! ```rust
//! use touchstone::{Layer, Tensor, TransformerConfig, TransformerEncoder};
//!
//! let config = TransformerConfig::new(2, 16).norm_first(true);
//! let mut encoder = TransformerEncoder::new(&config).unwrap();
//!
//! // [batch, seq, features]
//! let x = Tensor::full(vec![2, 5, 8], 0.1);
//! let y = encoder.forward(&x).unwrap();
//! assert_eq!(y.shape, x.shape);
//!
//! // Gradient of the loss with respect to `y`, then one SGD step
//! let dy = Tensor::full(vec![2, 5, 8], 1.0);
//! let dx = encoder.backward(&dy, 0.01).unwrap();
//! assert_eq!(dx.shape, x.shape);
//! ```

pub mod config;
pub mod error;
pub mod init;
pub mod layers;
pub mod tensor;

// Re-export main types for convenience
pub use config::TransformerConfig;
pub use error::{LayerError, Result};
pub use init::{Constant, Initializer, RandomNormal, RandomUniform, SharedInitializer, Zeros};
pub use layers::{
    Activation, Attention, AttentionGradients, DecoderGradients, Dense, FeedForward, Gelu, Layer,
    LayerNorm, LayerState, Linear, MultiHeadAttention, ReLU, Sequential, TransformerDecoder,
    TransformerEncoder,
};
pub use tensor::Tensor;
