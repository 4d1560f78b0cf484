//! Transformer Encoder Block
//!
//! Two sublayers, each wrapped in a residual connection and a layer norm:
//! self-attention, then the position-wise feed-forward network.
//!
//! ## Post-Norm (`norm_first = false`)
//!
//! ```text
//! out = norm1(attn(x) + x)
//! out = norm2(ff(out) + out)
//! ```
//!
//! ## Pre-Norm (`norm_first = true`)
//!
//! ```text
//! out = attn(norm1(x)) + x
//! out = ff(norm2(out)) + out
//! ```
//!
//! Pre-norm leaves the final residual sum unnormalized.
//!
//! ## Backward Pass
//!
//! Stages are undone in reverse. At each residual sum the incoming gradient
//! goes both into the sublayer and straight through the skip path, and the
//! two contributions are added. Self-attention reads its input as both query
//! and key/value, so both of its input gradients flow back to the same tensor.
//!
//! Masking and dropout are not supported.

use super::attention::{Attention, MultiHeadAttention};
use super::feed_forward::FeedForward;
use super::layer_norm::LayerNorm;
use super::{feature_width, Layer};
use crate::config::TransformerConfig;
use crate::error::{ensure_shape, LayerError, Result};
use crate::init::{default_initializer, SharedInitializer};
use crate::tensor::Tensor;

/// Transformer encoder block
pub struct TransformerEncoder<A: Attention = MultiHeadAttention> {
    self_attention: A,
    feed_forward: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    norm_first: bool,
}

impl TransformerEncoder<MultiHeadAttention> {
    /// Build an encoder with multi-head attention and the default initializer
    pub fn new(config: &TransformerConfig) -> Result<Self> {
        Self::with_initializer(config, default_initializer())
    }

    /// Build an encoder whose parameters all draw from `initializer`
    pub fn with_initializer(config: &TransformerConfig, initializer: SharedInitializer) -> Result<Self> {
        let attention = MultiHeadAttention::with_initializer(config.num_heads, initializer.clone());
        Self::with_attention(config, attention, initializer)
    }
}

impl<A: Attention> TransformerEncoder<A> {
    /// Build an encoder around any attention implementation
    pub fn with_attention(
        config: &TransformerConfig,
        self_attention: A,
        initializer: SharedInitializer,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            self_attention,
            feed_forward: FeedForward::new(config.hidden_units, initializer),
            norm1: LayerNorm::new(config.epsilon),
            norm2: LayerNorm::new(config.epsilon),
            norm_first: config.norm_first,
        })
    }

    pub fn norm_first(&self) -> bool {
        self.norm_first
    }

    pub fn self_attention(&self) -> &A {
        &self.self_attention
    }

    pub fn self_attention_mut(&mut self) -> &mut A {
        &mut self.self_attention
    }

    pub fn feed_forward(&self) -> &FeedForward {
        &self.feed_forward
    }

    pub fn feed_forward_mut(&mut self) -> &mut FeedForward {
        &mut self.feed_forward
    }

    pub fn norm1(&self) -> &LayerNorm {
        &self.norm1
    }

    pub fn norm2(&self) -> &LayerNorm {
        &self.norm2
    }
}

impl<A: Attention> Layer for TransformerEncoder<A> {
    /// Redraw every sublayer's parameters for `qkv`'s width.
    fn initialize(&mut self, qkv: &Tensor) -> Result<()> {
        self.self_attention.initialize(qkv, qkv)?;
        self.norm1.initialize(qkv)?;
        self.norm2.initialize(qkv)?;
        self.feed_forward.initialize(qkv)
    }

    fn forward(&mut self, qkv: &Tensor) -> Result<Tensor> {
        self.clear_cache();
        match self.feed_forward.features() {
            None => self.initialize(qkv)?,
            Some(features) if feature_width("encoder", qkv)? != features => {
                return Err(LayerError::shape(
                    "encoder input",
                    &qkv.with_last_dim(features),
                    &qkv.shape,
                ));
            }
            Some(_) => {}
        }

        if self.norm_first {
            let normed = self.norm1.forward(qkv)?;
            let attn_out = self.self_attention.forward(&normed, &normed)?;
            ensure_shape("encoder self-attention output", &qkv.shape, &attn_out.shape)?;
            let out = attn_out.add(qkv);

            let ff_in = self.norm2.forward(&out)?;
            Ok(self.feed_forward.forward(&ff_in)?.add(&out))
        } else {
            let attn_out = self.self_attention.forward(qkv, qkv)?;
            ensure_shape("encoder self-attention output", &qkv.shape, &attn_out.shape)?;
            let out = self.norm1.forward(&attn_out.add(qkv))?;

            let ff_out = self.feed_forward.forward(&out)?.add(&out);
            self.norm2.forward(&ff_out)
        }
    }

    fn backward(&mut self, grad_out: &Tensor, learning_rate: f64) -> Result<Tensor> {
        if self.norm_first {
            // Stage 2: out = ff(norm2(r1)) + r1
            let grad_ff_in = self.feed_forward.backward(grad_out, learning_rate)?;
            let mut grad_r1 = grad_out.clone();
            grad_r1.add_assign(&self.norm2.backward(&grad_ff_in, learning_rate)?);

            // Stage 1: r1 = attn(norm1(x)) + x
            let grads = self.self_attention.backward(&grad_r1, learning_rate)?;
            grads.ensure_shapes(&grad_r1.shape, &grad_r1.shape)?;
            let mut grad_x = grad_r1;
            grad_x.add_assign(&self.norm1.backward(&grads.combined(), learning_rate)?);
            Ok(grad_x)
        } else {
            // Stage 2: out = norm2(ff(h) + h)
            let grad_sum2 = self.norm2.backward(grad_out, learning_rate)?;
            let grad_from_ff = self.feed_forward.backward(&grad_sum2, learning_rate)?;
            let mut grad_h = grad_sum2;
            grad_h.add_assign(&grad_from_ff);

            // Stage 1: h = norm1(attn(x) + x)
            let grad_sum1 = self.norm1.backward(&grad_h, learning_rate)?;
            let grads = self.self_attention.backward(&grad_sum1, learning_rate)?;
            grads.ensure_shapes(&grad_sum1.shape, &grad_sum1.shape)?;
            let mut grad_x = grad_sum1;
            grad_x.add_assign(&grads.combined());
            Ok(grad_x)
        }
    }

    fn clear_cache(&mut self) {
        self.self_attention.clear_cache();
        self.norm1.clear_cache();
        self.norm2.clear_cache();
        self.feed_forward.clear_cache();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::init::{Initializer, RandomNormal, Zeros};
    use crate::layers::attention::ZeroAttention;

    fn config(norm_first: bool) -> TransformerConfig {
        TransformerConfig::new(2, 8).norm_first(norm_first)
    }

    fn encoder(norm_first: bool) -> TransformerEncoder {
        TransformerEncoder::with_initializer(
            &config(norm_first),
            Arc::new(RandomNormal::seeded(0.0, 0.3, 17)),
        )
        .unwrap()
    }

    fn input(shape: Vec<usize>) -> Tensor {
        RandomNormal::seeded(0.0, 1.0, 99).init(&shape)
    }

    #[test]
    fn test_output_shape_matches_input() {
        for norm_first in [false, true] {
            let mut enc = encoder(norm_first);
            let x = input(vec![2, 3, 4]);
            let y = enc.forward(&x).unwrap();
            assert_eq!(y.shape, x.shape);
            let dx = enc.backward(&Tensor::full(vec![2, 3, 4], 0.1), 0.01).unwrap();
            assert_eq!(dx.shape, x.shape);
        }
    }

    #[test]
    fn test_post_norm_output_is_normalized() {
        let mut enc = encoder(false);
        let y = enc.forward(&input(vec![5, 4])).unwrap();
        // Final layer norm with gamma = 1, beta = 0
        for m in y.mean_last(false).data {
            assert!(m.abs() < 1e-9);
        }
    }

    #[test]
    fn test_pre_norm_keeps_residual_path() {
        // With zeroed attention and feed-forward outputs, pre-norm is the
        // identity while post-norm still normalizes.
        let zero: SharedInitializer = Arc::new(Zeros);
        let x = input(vec![3, 4]);

        let mut pre = TransformerEncoder::with_initializer(&config(true), zero.clone()).unwrap();
        assert_eq!(pre.forward(&x).unwrap(), x);

        let mut post = TransformerEncoder::with_initializer(&config(false), zero).unwrap();
        assert_ne!(post.forward(&x).unwrap(), x);
    }

    #[test]
    fn test_output_projection_sized_from_input() {
        let mut enc = encoder(false);
        assert!(enc.feed_forward().output().is_err());
        enc.initialize(&Tensor::zeros(vec![1, 6])).unwrap();
        assert_eq!(enc.feed_forward().features(), Some(6));
    }

    fn zero_attention_encoder(norm_first: bool) -> TransformerEncoder<ZeroAttention> {
        TransformerEncoder::with_attention(&config(norm_first), ZeroAttention::default(), Arc::new(Zeros))
            .unwrap()
    }

    #[test]
    fn test_width_change_rejected() {
        let mut enc = encoder(true);
        enc.forward(&input(vec![2, 4])).unwrap();
        assert!(matches!(
            enc.forward(&Tensor::zeros(vec![2, 6])),
            Err(LayerError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            enc.backward(&Tensor::zeros(vec![2, 4]), 0.1),
            Err(LayerError::Uninitialized { .. })
        ));
    }

    #[test]
    fn test_failed_forward_leaves_nothing_to_backprop() {
        for norm_first in [false, true] {
            let mut enc = zero_attention_encoder(norm_first);
            let x = input(vec![3, 4]);
            enc.forward(&x).unwrap();

            // Passes the width check, then fails at the attention output
            enc.self_attention_mut().output_shape = Some(vec![3, 2]);
            assert!(enc.forward(&x).is_err());
            assert!(matches!(
                enc.backward(&Tensor::full(vec![3, 4], 1.0), 0.1),
                Err(LayerError::Uninitialized { .. })
            ));
        }
    }

    #[test]
    fn test_initialize_redraws_every_sublayer() {
        let mut enc = encoder(false);
        let x = input(vec![3, 4]);
        enc.forward(&x).unwrap();
        let query_weight = enc.self_attention().projections().unwrap().query.weight().unwrap().clone();

        enc.initialize(&x).unwrap();
        assert_ne!(
            enc.self_attention().projections().unwrap().query.weight().unwrap(),
            &query_weight
        );
        // The old forward is gone with the old parameters
        assert!(enc.backward(&Tensor::full(vec![3, 4], 1.0), 0.1).is_err());

        let wide = input(vec![3, 8]);
        enc.initialize(&wide).unwrap();
        assert_eq!(enc.norm1().gamma().unwrap().shape, vec![8]);
        assert_eq!(enc.norm2().gamma().unwrap().shape, vec![8]);
        assert_eq!(enc.forward(&wide).unwrap().shape, vec![3, 8]);
        let dx = enc.backward(&Tensor::full(vec![3, 8], 0.1), 0.01).unwrap();
        assert_eq!(dx.shape, vec![3, 8]);
    }

    #[test]
    fn test_attention_output_shape_checked() {
        for norm_first in [false, true] {
            let mut enc = zero_attention_encoder(norm_first);
            enc.self_attention_mut().output_shape = Some(vec![3, 2]);
            assert!(matches!(
                enc.forward(&input(vec![3, 4])),
                Err(LayerError::ShapeMismatch { .. })
            ));
        }
    }

    #[test]
    fn test_attention_gradient_shape_checked() {
        for norm_first in [false, true] {
            let mut enc = zero_attention_encoder(norm_first);
            enc.self_attention_mut().gradient_shape = Some(vec![1, 4]);
            enc.forward(&input(vec![3, 4])).unwrap();
            assert!(matches!(
                enc.backward(&Tensor::full(vec![3, 4], 1.0), 0.1),
                Err(LayerError::ShapeMismatch { .. })
            ));
        }
    }

    #[test]
    fn test_backward_without_forward() {
        for norm_first in [false, true] {
            let mut enc = encoder(norm_first);
            assert!(matches!(
                enc.backward(&Tensor::zeros(vec![2, 4]), 0.1),
                Err(LayerError::Uninitialized { .. })
            ));
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            TransformerEncoder::new(&TransformerConfig::new(0, 8)),
            Err(LayerError::InvalidConfig(_))
        ));
    }
}
