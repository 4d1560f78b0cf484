//! Transformer Decoder Block
//!
//! Three residual stages over the query sequence:
//!
//! 1. Self-attention over the queries
//! 2. Cross-attention from the queries to the key/value sequence
//! 3. Position-wise feed-forward network
//!
//! ## Post-Norm (`norm_first = false`)
//!
//! ```text
//! out = norm1(self_attn(q, q) + q)
//! out = norm2(cross_attn(out, kv) + out)
//! out = norm3(ff(out) + out)
//! ```
//!
//! ## Pre-Norm (`norm_first = true`)
//!
//! ```text
//! out = self_attn(norm1(q), norm1(q)) + q
//! out = cross_attn(norm2(out), kv) + out
//! out = ff(norm3(out)) + out
//! ```
//!
//! The key/value sequence is never normalized. It only enters through the
//! cross-attention, so that is the only contribution to its gradient.
//!
//! The decoder takes two inputs, so it does not implement
//! [`Layer`](super::Layer); its `forward`/`backward` mirror that contract.

use super::attention::{Attention, MultiHeadAttention};
use super::feed_forward::FeedForward;
use super::layer_norm::LayerNorm;
use super::{feature_width, take_cache, Layer};
use crate::config::TransformerConfig;
use crate::error::{ensure_shape, LayerError, Result};
use crate::init::{default_initializer, SharedInitializer};
use crate::tensor::Tensor;

const NAME: &str = "decoder";

/// Input gradients of a decoder block
#[derive(Clone, Debug)]
pub struct DecoderGradients {
    pub query: Tensor,
    pub key_value: Tensor,
}

/// Transformer decoder block
pub struct TransformerDecoder<A: Attention = MultiHeadAttention> {
    self_attention: A,
    cross_attention: A,
    feed_forward: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    norm3: LayerNorm,
    norm_first: bool,
    key_value_shape: Option<Vec<usize>>,
}

impl TransformerDecoder<MultiHeadAttention> {
    pub fn new(config: &TransformerConfig) -> Result<Self> {
        Self::with_initializer(config, default_initializer())
    }

    pub fn with_initializer(config: &TransformerConfig, initializer: SharedInitializer) -> Result<Self> {
        let self_attention = MultiHeadAttention::with_initializer(config.num_heads, initializer.clone());
        let cross_attention = MultiHeadAttention::with_initializer(config.num_heads, initializer.clone());
        Self::with_attention(config, self_attention, cross_attention, initializer)
    }
}

impl<A: Attention> TransformerDecoder<A> {
    /// Build a decoder around any attention implementation
    pub fn with_attention(
        config: &TransformerConfig,
        self_attention: A,
        cross_attention: A,
        initializer: SharedInitializer,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            self_attention,
            cross_attention,
            feed_forward: FeedForward::new(config.hidden_units, initializer),
            norm1: LayerNorm::new(config.epsilon),
            norm2: LayerNorm::new(config.epsilon),
            norm3: LayerNorm::new(config.epsilon),
            norm_first: config.norm_first,
            key_value_shape: None,
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

    pub fn cross_attention(&self) -> &A {
        &self.cross_attention
    }

    pub fn cross_attention_mut(&mut self) -> &mut A {
        &mut self.cross_attention
    }

    pub fn feed_forward(&self) -> &FeedForward {
        &self.feed_forward
    }

    pub fn feed_forward_mut(&mut self) -> &mut FeedForward {
        &mut self.feed_forward
    }

    /// Redraw every sublayer's parameters for the query width, with
    /// cross-attention's key and value projections sized for `key_value`.
    pub fn initialize(&mut self, query: &Tensor, key_value: &Tensor) -> Result<()> {
        self.self_attention.initialize(query, query)?;
        self.cross_attention.initialize(query, key_value)?;
        self.norm1.initialize(query)?;
        self.norm2.initialize(query)?;
        self.norm3.initialize(query)?;
        self.feed_forward.initialize(query)
    }

    /// Drop every sublayer's forward cache
    pub fn clear_cache(&mut self) {
        self.self_attention.clear_cache();
        self.cross_attention.clear_cache();
        self.norm1.clear_cache();
        self.norm2.clear_cache();
        self.norm3.clear_cache();
        self.feed_forward.clear_cache();
        self.key_value_shape = None;
    }

    pub fn forward(&mut self, query: &Tensor, key_value: &Tensor) -> Result<Tensor> {
        self.clear_cache();
        match self.feed_forward.features() {
            None => self.initialize(query, key_value)?,
            Some(features) if feature_width(NAME, query)? != features => {
                return Err(LayerError::shape(
                    "decoder query",
                    &query.with_last_dim(features),
                    &query.shape,
                ));
            }
            Some(_) => {}
        }

        let out = self.run_stages(query, key_value)?;
        self.key_value_shape = Some(key_value.shape.clone());
        Ok(out)
    }

    fn run_stages(&mut self, query: &Tensor, key_value: &Tensor) -> Result<Tensor> {
        if self.norm_first {
            let normed = self.norm1.forward(query)?;
            let attn = self.self_attention.forward(&normed, &normed)?;
            ensure_shape("decoder self-attention output", &query.shape, &attn.shape)?;
            let out = attn.add(query);

            let normed = self.norm2.forward(&out)?;
            let attn = self.cross_attention.forward(&normed, key_value)?;
            ensure_shape("decoder cross-attention output", &out.shape, &attn.shape)?;
            let out = attn.add(&out);

            let normed = self.norm3.forward(&out)?;
            Ok(self.feed_forward.forward(&normed)?.add(&out))
        } else {
            let attn = self.self_attention.forward(query, query)?;
            ensure_shape("decoder self-attention output", &query.shape, &attn.shape)?;
            let out = self.norm1.forward(&attn.add(query))?;

            let attn = self.cross_attention.forward(&out, key_value)?;
            ensure_shape("decoder cross-attention output", &out.shape, &attn.shape)?;
            let out = attn.add(&out);
            let out = self.norm2.forward(&out)?;

            let out = self.feed_forward.forward(&out)?.add(&out);
            self.norm3.forward(&out)
        }
    }

    /// Gradients for both decoder inputs, with an SGD step on every sublayer
    pub fn backward(&mut self, grad_out: &Tensor, learning_rate: f64) -> Result<DecoderGradients> {
        let kv_shape = take_cache(&mut self.key_value_shape, NAME)?;
        if self.norm_first {
            // Stage 3: out = ff(norm3(r2)) + r2
            let grad_normed = self.feed_forward.backward(grad_out, learning_rate)?;
            let mut grad_r2 = grad_out.clone();
            grad_r2.add_assign(&self.norm3.backward(&grad_normed, learning_rate)?);

            // Stage 2: r2 = cross(norm2(r1), kv) + r1
            let cross = self.cross_attention.backward(&grad_r2, learning_rate)?;
            cross.ensure_shapes(&grad_r2.shape, &kv_shape)?;
            let mut grad_r1 = grad_r2;
            grad_r1.add_assign(&self.norm2.backward(&cross.query, learning_rate)?);

            // Stage 1: r1 = self(norm1(q)) + q
            let grads = self.self_attention.backward(&grad_r1, learning_rate)?;
            grads.ensure_shapes(&grad_r1.shape, &grad_r1.shape)?;
            let grad_normed = grads.combined();
            let mut grad_q = grad_r1;
            grad_q.add_assign(&self.norm1.backward(&grad_normed, learning_rate)?);

            Ok(DecoderGradients {
                query: grad_q,
                key_value: cross.key_value,
            })
        } else {
            // Stage 3: out = norm3(ff(h2) + h2)
            let grad_sum3 = self.norm3.backward(grad_out, learning_rate)?;
            let grad_from_ff = self.feed_forward.backward(&grad_sum3, learning_rate)?;
            let mut grad_h2 = grad_sum3;
            grad_h2.add_assign(&grad_from_ff);

            // Stage 2: h2 = norm2(cross(h1, kv) + h1)
            let grad_sum2 = self.norm2.backward(&grad_h2, learning_rate)?;
            let cross = self.cross_attention.backward(&grad_sum2, learning_rate)?;
            cross.ensure_shapes(&grad_sum2.shape, &kv_shape)?;
            let mut grad_h1 = grad_sum2;
            grad_h1.add_assign(&cross.query);

            // Stage 1: h1 = norm1(self(q) + q)
            let grad_sum1 = self.norm1.backward(&grad_h1, learning_rate)?;
            let grads = self.self_attention.backward(&grad_sum1, learning_rate)?;
            grads.ensure_shapes(&grad_sum1.shape, &grad_sum1.shape)?;
            let grad_from_attn = grads.combined();
            let mut grad_q = grad_sum1;
            grad_q.add_assign(&grad_from_attn);

            Ok(DecoderGradients {
                query: grad_q,
                key_value: cross.key_value,
            })
        }
    }
}
