//! Attention
//!
//! The transformer blocks only need *something* that maps a query sequence
//! and a key/value sequence to an output shaped like the query, and can
//! backpropagate through that mapping. That contract is the [`Attention`]
//! trait. [`MultiHeadAttention`] is the implementation the blocks use by
//! default.
//!
//! ## Scaled Dot-Product Attention, per head
//!
//! ```text
//! Q, K, V = query @ W_q, kv @ W_k, kv @ W_v
//! scores  = (Q_h @ K_h^T) / √d_head
//! weights = softmax(scores)          (over key positions)
//! out_h   = weights @ V_h
//! output  = concat(out_h) @ W_o
//! ```
//!
//! There is no mask: every query position sees every key position.
//!
//! ## Backward Pass
//!
//! 1. Backprop through the output projection
//! 2. grad_V = weights^T @ grad_out_h, grad_weights = grad_out_h @ V_h^T
//! 3. Softmax backward per row: weights * (grad_weights - Σ grad_weights * weights)
//! 4. Through the scaled product into grad_Q and grad_K
//! 5. Through the Q, K, V projections
//!
//! The key and value projections both read `kv`, so their input gradients
//! add up.

use rayon::prelude::*;
use tracing::{debug, warn};

use super::linear::Linear;
use super::{feature_width, take_cache, Layer, LayerState};
use crate::error::{ensure_shape, LayerError, Result};
use crate::init::{default_initializer, SharedInitializer};
use crate::tensor::Tensor;

const NAME: &str = "attention";

/// Query/key-value attention with manual backward.
pub trait Attention {
    /// Draw fresh parameters sized from the query and key/value widths,
    /// replacing any existing ones.
    fn initialize(&mut self, query: &Tensor, key_value: &Tensor) -> Result<()>;

    /// Attend from `query` `[..., q_len, features]` over `key_value`
    /// `[..., kv_len, kv_features]`. The output has the query's shape.
    fn forward(&mut self, query: &Tensor, key_value: &Tensor) -> Result<Tensor>;

    /// Gradients for both inputs of the last forward call, plus an SGD step
    /// on the attention parameters.
    fn backward(&mut self, grad_output: &Tensor, learning_rate: f64) -> Result<AttentionGradients>;

    /// Drop the cache of the last forward call.
    fn clear_cache(&mut self);
}

/// Input gradients of an attention call
#[derive(Clone, Debug)]
pub struct AttentionGradients {
    pub query: Tensor,
    pub key_value: Tensor,
}

impl AttentionGradients {
    /// Fail unless each gradient matches the input it belongs to
    pub fn ensure_shapes(&self, query: &[usize], key_value: &[usize]) -> Result<()> {
        ensure_shape("attention query gradient", query, &self.query.shape)?;
        ensure_shape("attention key/value gradient", key_value, &self.key_value.shape)
    }

    /// Total input gradient when query and key/value were the same tensor
    pub fn combined(self) -> Tensor {
        let mut grad = self.query;
        grad.add_assign(&self.key_value);
        grad
    }
}

/// The four projections of an initialized attention layer
pub struct Projections {
    pub query: Linear,
    pub key: Linear,
    pub value: Linear,
    pub output: Linear,
}

struct Dims {
    batch: usize,
    q_len: usize,
    kv_len: usize,
    d_model: usize,
}

struct AttentionCache {
    dims: Dims,
    q: Tensor,
    k: Tensor,
    v: Tensor,
    // [batch, heads, q_len, kv_len]
    weights: Vec<f64>,
}

/// Multi-head scaled dot-product attention
pub struct MultiHeadAttention {
    num_heads: usize,
    initializer: SharedInitializer,
    state: LayerState<Projections>,
    cache: Option<AttentionCache>,
}

impl MultiHeadAttention {
    pub fn new(num_heads: usize) -> Self {
        Self::with_initializer(num_heads, default_initializer())
    }

    pub fn with_initializer(num_heads: usize, initializer: SharedInitializer) -> Self {
        Self {
            num_heads,
            initializer,
            state: LayerState::Uninitialized,
            cache: None,
        }
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn projections(&self) -> Result<&Projections> {
        self.state.get(NAME)
    }

    pub fn projections_mut(&mut self) -> Result<&mut Projections> {
        self.state.get_mut(NAME)
    }

    fn dims(query: &Tensor, key_value: &Tensor) -> Result<Dims> {
        let rank = query.shape.len();
        if rank < 2 || key_value.shape.len() < 2 {
            return Err(LayerError::Unsupported(format!(
                "attention needs [..., seq, features] inputs, got {:?} and {:?}",
                query.shape, key_value.shape
            )));
        }
        let leading = &query.shape[..rank - 2];
        let kv_rank = key_value.shape.len();
        if leading != &key_value.shape[..kv_rank - 2] {
            let mut expected = leading.to_vec();
            expected.extend_from_slice(&key_value.shape[kv_rank - 2..]);
            return Err(LayerError::shape("attention key/value", &expected, &key_value.shape));
        }
        let dims = Dims {
            batch: leading.iter().product(),
            q_len: query.shape[rank - 2],
            kv_len: key_value.shape[kv_rank - 2],
            d_model: query.shape[rank - 1],
        };
        if dims.batch == 0 || dims.q_len == 0 || dims.kv_len == 0 {
            return Err(LayerError::Unsupported(format!(
                "attention over an empty sequence: {:?} and {:?}",
                query.shape, key_value.shape
            )));
        }
        Ok(dims)
    }
}

impl Attention for MultiHeadAttention {
    /// Size every projection: query from `query`, key and value from
    /// `key_value`, output from the model width.
    ///
    /// The model width must split evenly into heads.
    fn initialize(&mut self, query: &Tensor, key_value: &Tensor) -> Result<()> {
        let d_model = feature_width(NAME, query)?;
        if self.num_heads == 0 || d_model % self.num_heads != 0 {
            return Err(LayerError::InvalidConfig(format!(
                "model width {d_model} is not divisible into {} heads",
                self.num_heads
            )));
        }
        let kv_width = feature_width(NAME, key_value)?;
        if self.state.is_initialized() {
            warn!(d_model, kv_width, "re-initializing attention");
        }

        let make = || Linear::with_initializer(d_model, self.initializer.clone());
        let mut proj = Projections {
            query: make(),
            key: make(),
            value: make(),
            output: make(),
        };
        proj.query.initialize(query)?;
        proj.key.initialize(key_value)?;
        proj.value.initialize(key_value)?;
        proj.output.initialize(&Tensor::zeros(vec![1, d_model]))?;

        self.state = LayerState::Initialized(proj);
        self.cache = None;
        debug!(d_model, kv_width, num_heads = self.num_heads, "initialized attention");
        Ok(())
    }

    fn forward(&mut self, query: &Tensor, key_value: &Tensor) -> Result<Tensor> {
        self.clear_cache();
        let dims = Self::dims(query, key_value)?;
        if !self.state.is_initialized() {
            self.initialize(query, key_value)?;
        }
        let heads = self.num_heads;
        let proj = self.state.get_mut(NAME)?;

        let q = proj.query.forward(query)?;
        let k = proj.key.forward(key_value)?;
        let v = proj.value.forward(key_value)?;

        let Dims {
            q_len,
            kv_len,
            d_model,
            ..
        } = dims;
        let d_head = d_model / heads;
        let scale = 1.0 / (d_head as f64).sqrt();

        let mut weights = vec![0.0; dims.batch * heads * q_len * kv_len];
        let mut context = vec![0.0; dims.batch * q_len * d_model];

        // Each batch entry is independent
        weights
            .par_chunks_mut(heads * q_len * kv_len)
            .zip(context.par_chunks_mut(q_len * d_model))
            .enumerate()
            .for_each(|(b, (w, ctx))| {
                let q_b = &q.data[b * q_len * d_model..(b + 1) * q_len * d_model];
                let k_b = &k.data[b * kv_len * d_model..(b + 1) * kv_len * d_model];
                let v_b = &v.data[b * kv_len * d_model..(b + 1) * kv_len * d_model];

                for h in 0..heads {
                    let off = h * d_head;
                    for i in 0..q_len {
                        let row = &mut w[(h * q_len + i) * kv_len..(h * q_len + i + 1) * kv_len];
                        let q_i = &q_b[i * d_model + off..i * d_model + off + d_head];

                        let mut max = f64::NEG_INFINITY;
                        for (j, score) in row.iter_mut().enumerate() {
                            let k_j = &k_b[j * d_model + off..j * d_model + off + d_head];
                            *score = q_i.iter().zip(k_j).map(|(a, b)| a * b).sum::<f64>() * scale;
                            max = max.max(*score);
                        }
                        let mut sum = 0.0;
                        for score in row.iter_mut() {
                            *score = (*score - max).exp();
                            sum += *score;
                        }

                        let ctx_i = &mut ctx[i * d_model + off..i * d_model + off + d_head];
                        for (j, weight) in row.iter_mut().enumerate() {
                            *weight /= sum;
                            let v_j = &v_b[j * d_model + off..j * d_model + off + d_head];
                            for (c, &vv) in ctx_i.iter_mut().zip(v_j) {
                                *c += *weight * vv;
                            }
                        }
                    }
                }
            });

        let context = Tensor::new(context, q.shape.clone());
        let out = proj.output.forward(&context)?;

        self.cache = Some(AttentionCache {
            dims,
            q,
            k,
            v,
            weights,
        });
        Ok(out)
    }

    fn backward(&mut self, grad_out: &Tensor, learning_rate: f64) -> Result<AttentionGradients> {
        let cache = take_cache(&mut self.cache, NAME)?;
        let heads = self.num_heads;
        let proj = self.state.get_mut(NAME)?;

        // Backprop through output projection
        let grad_context = proj.output.backward(grad_out, learning_rate)?;

        let Dims {
            batch,
            q_len,
            kv_len,
            d_model,
        } = cache.dims;
        let d_head = d_model / heads;
        let scale = 1.0 / (d_head as f64).sqrt();

        let mut grad_q = vec![0.0; batch * q_len * d_model];
        let mut grad_k = vec![0.0; batch * kv_len * d_model];
        let mut grad_v = vec![0.0; batch * kv_len * d_model];

        grad_q
            .par_chunks_mut(q_len * d_model)
            .zip(grad_k.par_chunks_mut(kv_len * d_model))
            .zip(grad_v.par_chunks_mut(kv_len * d_model))
            .enumerate()
            .for_each(|(b, ((gq, gk), gv))| {
                let q_b = &cache.q.data[b * q_len * d_model..(b + 1) * q_len * d_model];
                let k_b = &cache.k.data[b * kv_len * d_model..(b + 1) * kv_len * d_model];
                let v_b = &cache.v.data[b * kv_len * d_model..(b + 1) * kv_len * d_model];
                let gc_b = &grad_context.data[b * q_len * d_model..(b + 1) * q_len * d_model];
                let w_b = &cache.weights[b * heads * q_len * kv_len..(b + 1) * heads * q_len * kv_len];

                let mut grad_w = vec![0.0; kv_len];
                for h in 0..heads {
                    let off = h * d_head;
                    for i in 0..q_len {
                        let w_row = &w_b[(h * q_len + i) * kv_len..(h * q_len + i + 1) * kv_len];
                        let gc_i = &gc_b[i * d_model + off..i * d_model + off + d_head];

                        // grad_weights = grad_out_h @ V_h^T; grad_V += weights^T @ grad_out_h
                        for j in 0..kv_len {
                            let v_j = &v_b[j * d_model + off..j * d_model + off + d_head];
                            grad_w[j] = gc_i.iter().zip(v_j).map(|(a, b)| a * b).sum();
                            let gv_j = &mut gv[j * d_model + off..j * d_model + off + d_head];
                            for (g, &c) in gv_j.iter_mut().zip(gc_i) {
                                *g += w_row[j] * c;
                            }
                        }

                        // Softmax backward, folded with the 1/√d_head scale
                        let dot: f64 = w_row.iter().zip(&grad_w).map(|(w, g)| w * g).sum();
                        let q_i = &q_b[i * d_model + off..i * d_model + off + d_head];
                        for j in 0..kv_len {
                            let grad_score = w_row[j] * (grad_w[j] - dot) * scale;
                            let k_j = &k_b[j * d_model + off..j * d_model + off + d_head];

                            let gq_i = &mut gq[i * d_model + off..i * d_model + off + d_head];
                            for (g, &kk) in gq_i.iter_mut().zip(k_j) {
                                *g += grad_score * kk;
                            }
                            let gk_j = &mut gk[j * d_model + off..j * d_model + off + d_head];
                            for (g, &qq) in gk_j.iter_mut().zip(q_i) {
                                *g += grad_score * qq;
                            }
                        }
                    }
                }
            });

        // Backprop through Q, K, V projections
        let query = proj
            .query
            .backward(&Tensor::new(grad_q, cache.q.shape.clone()), learning_rate)?;
        let mut key_value = proj
            .key
            .backward(&Tensor::new(grad_k, cache.k.shape.clone()), learning_rate)?;
        let grad_from_value = proj
            .value
            .backward(&Tensor::new(grad_v, cache.v.shape), learning_rate)?;
        key_value.add_assign(&grad_from_value);

        Ok(AttentionGradients { query, key_value })
    }

    fn clear_cache(&mut self) {
        self.cache = None;
        if let LayerState::Initialized(proj) = &mut self.state {
            proj.query.clear_cache();
            proj.key.clear_cache();
            proj.value.clear_cache();
            proj.output.clear_cache();
        }
    }
}

/// Attention that outputs zeros, with optional wrong shapes for its output
/// and input gradients
#[cfg(test)]
#[derive(Default)]
pub(crate) struct ZeroAttention {
    pub output_shape: Option<Vec<usize>>,
    pub gradient_shape: Option<Vec<usize>>,
    cache: Option<(Vec<usize>, Vec<usize>)>,
}

#[cfg(test)]
impl ZeroAttention {
    pub fn with_shapes(output_shape: Option<Vec<usize>>, gradient_shape: Option<Vec<usize>>) -> Self {
        Self {
            output_shape,
            gradient_shape,
            cache: None,
        }
    }
}

#[cfg(test)]
impl Attention for ZeroAttention {
    fn initialize(&mut self, _query: &Tensor, _key_value: &Tensor) -> Result<()> {
        self.cache = None;
        Ok(())
    }

    fn forward(&mut self, query: &Tensor, key_value: &Tensor) -> Result<Tensor> {
        self.cache = Some((query.shape.clone(), key_value.shape.clone()));
        let shape = self.output_shape.clone().unwrap_or_else(|| query.shape.clone());
        Ok(Tensor::zeros(shape))
    }

    fn backward(&mut self, _grad_output: &Tensor, _learning_rate: f64) -> Result<AttentionGradients> {
        let (query, key_value) = take_cache(&mut self.cache, "zero attention")?;
        Ok(AttentionGradients {
            query: Tensor::zeros(self.gradient_shape.clone().unwrap_or(query)),
            key_value: Tensor::zeros(self.gradient_shape.clone().unwrap_or(key_value)),
        })
    }

    fn clear_cache(&mut self) {
        self.cache = None;
    }
}
