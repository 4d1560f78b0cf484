//! Finite-difference checks of every hand-written backward pass.
//!
//! The loss is `L = Σ y · r` for a fixed random `r`, so `dL/dy = r` is what
//! each backward call receives. Backward runs with a zero learning rate so the
//! parameters stay where the numeric derivative was taken.

use std::sync::Arc;

use touchstone::{
    Attention, Dense, Gelu, Initializer, Layer, LayerNorm, Linear, MultiHeadAttention, RandomNormal,
    Sequential, SharedInitializer, Tensor, TransformerConfig, TransformerDecoder, TransformerEncoder,
};

const EPS: f64 = 1e-6;
const TOL: f64 = 1e-5;

fn random(shape: &[usize], seed: u64) -> Tensor {
    RandomNormal::seeded(0.0, 1.0, seed).init(shape)
}

fn weights(seed: u64) -> SharedInitializer {
    Arc::new(RandomNormal::seeded(0.0, 0.4, seed))
}

/// Central difference of `loss` with respect to every element of `x`
fn numeric_grad(x: &Tensor, mut loss: impl FnMut(&Tensor) -> f64) -> Tensor {
    let mut grad = Tensor::zeros(x.shape.clone());
    for i in 0..x.len() {
        let mut plus = x.clone();
        plus.data[i] += EPS;
        let mut minus = x.clone();
        minus.data[i] -= EPS;
        grad.data[i] = (loss(&plus) - loss(&minus)) / (2.0 * EPS);
    }
    grad
}

fn assert_close(name: &str, analytic: &Tensor, numeric: &Tensor) {
    assert_eq!(analytic.shape, numeric.shape, "{name}: shape");
    for (i, (a, n)) in analytic.data.iter().zip(&numeric.data).enumerate() {
        let scale = 1.0_f64.max(a.abs()).max(n.abs());
        assert!(
            (a - n).abs() <= TOL * scale,
            "{name}[{i}]: analytic {a} vs numeric {n}"
        );
    }
}

fn check_input_grad<L: Layer>(name: &str, layer: &mut L, x: &Tensor, seed: u64) {
    let y = layer.forward(x).unwrap();
    let r = random(&y.shape, seed);
    let analytic = layer.backward(&r, 0.0).unwrap();
    let numeric = numeric_grad(x, |x| layer.forward(x).unwrap().dot(&r));
    assert_close(name, &analytic, &numeric);
}

#[test]
fn linear_gradients_match_finite_differences() {
    let mut linear = Linear::with_initializer(3, weights(1));
    let x = random(&[2, 4, 5], 2);
    check_input_grad("linear dx", &mut linear, &x, 3);

    let r = random(&[2, 4, 3], 3);
    linear.forward(&x).unwrap();
    linear.backward(&r, 0.0).unwrap();
    let grads = linear.gradients().unwrap().clone();

    let weight = linear.weight().unwrap().clone();
    let numeric_w = numeric_grad(&weight, |w| {
        linear.params_mut().unwrap().weight = w.clone();
        linear.forward(&x).unwrap().dot(&r)
    });
    linear.params_mut().unwrap().weight = weight;
    assert_close("linear dW", &grads.weight, &numeric_w);

    let bias = linear.bias().unwrap().clone();
    let numeric_b = numeric_grad(&bias, |b| {
        linear.params_mut().unwrap().bias = b.clone();
        linear.forward(&x).unwrap().dot(&r)
    });
    assert_close("linear db", &grads.bias, &numeric_b);
}

#[test]
fn dense_input_gradient_matches_finite_differences() {
    let x = random(&[6, 4], 10);

    let mut relu = Dense::with_initializer(5, touchstone::ReLU::new(), weights(11));
    check_input_grad("dense relu dx", &mut relu, &x, 12);

    let mut gelu = Dense::with_initializer(5, Gelu::new(), weights(13));
    check_input_grad("dense gelu dx", &mut gelu, &x, 14);
}

#[test]
fn layer_norm_gradients_match_finite_differences() {
    let mut norm = LayerNorm::with_initializer(1e-3, Arc::new(RandomNormal::seeded(1.0, 0.5, 20)));
    let x = random(&[3, 2, 6], 21);
    check_input_grad("layer norm dx", &mut norm, &x, 22);

    let r = random(&[3, 2, 6], 22);
    norm.forward(&x).unwrap();
    norm.backward(&r, 0.0).unwrap();
    let grads = norm.gradients().unwrap().clone();

    let gamma = norm.gamma().unwrap().clone();
    let numeric_gamma = numeric_grad(&gamma, |g| {
        norm.params_mut().unwrap().gamma = g.clone();
        norm.forward(&x).unwrap().dot(&r)
    });
    norm.params_mut().unwrap().gamma = gamma;
    assert_close("layer norm dgamma", &grads.gamma, &numeric_gamma);

    let beta = norm.beta().unwrap().clone();
    let numeric_beta = numeric_grad(&beta, |b| {
        norm.params_mut().unwrap().beta = b.clone();
        norm.forward(&x).unwrap().dot(&r)
    });
    assert_close("layer norm dbeta", &grads.beta, &numeric_beta);
}

#[test]
fn attention_gradients_match_finite_differences() {
    let mut attn = MultiHeadAttention::with_initializer(2, weights(30));
    let q = random(&[2, 3, 4], 31);
    let kv = random(&[2, 5, 6], 32);

    let y = attn.forward(&q, &kv).unwrap();
    let r = random(&y.shape, 33);
    let grads = attn.backward(&r, 0.0).unwrap();

    let numeric_q = numeric_grad(&q, |q| attn.forward(q, &kv).unwrap().dot(&r));
    assert_close("attention dq", &grads.query, &numeric_q);

    let numeric_kv = numeric_grad(&kv, |kv| attn.forward(&q, kv).unwrap().dot(&r));
    assert_close("attention dkv", &grads.key_value, &numeric_kv);
}

#[test]
fn encoder_gradients_match_finite_differences() {
    for norm_first in [false, true] {
        let config = TransformerConfig::new(2, 6).norm_first(norm_first);
        let mut encoder = TransformerEncoder::with_initializer(&config, weights(40)).unwrap();
        let x = random(&[2, 3, 4], 41);
        let name = if norm_first { "pre-norm encoder dx" } else { "post-norm encoder dx" };
        check_input_grad(name, &mut encoder, &x, 42);
    }
}

#[test]
fn decoder_gradients_match_finite_differences() {
    for norm_first in [false, true] {
        let config = TransformerConfig::new(2, 6).norm_first(norm_first);
        let mut decoder = TransformerDecoder::with_initializer(&config, weights(50)).unwrap();
        let q = random(&[2, 3, 4], 51);
        let kv = random(&[2, 4, 4], 52);

        let y = decoder.forward(&q, &kv).unwrap();
        let r = random(&y.shape, 53);
        let grads = decoder.backward(&r, 0.0).unwrap();

        let numeric_q = numeric_grad(&q, |q| decoder.forward(q, &kv).unwrap().dot(&r));
        assert_close("decoder dq", &grads.query, &numeric_q);

        let numeric_kv = numeric_grad(&kv, |kv| decoder.forward(&q, kv).unwrap().dot(&r));
        assert_close("decoder dkv", &grads.key_value, &numeric_kv);
    }
}

#[test]
fn sequential_gradient_matches_finite_differences() {
    let mut model = Sequential::new()
        .with(Dense::with_initializer(8, Gelu::new(), weights(60)))
        .with(LayerNorm::default())
        .with(Linear::with_initializer(2, weights(61)));
    let x = random(&[5, 3], 62);
    check_input_grad("sequential dx", &mut model, &x, 63);
}

#[test]
fn sgd_step_moves_parameters_against_gradient() {
    let mut linear = Linear::with_initializer(2, weights(70));
    let x = random(&[4, 3], 71);
    let r = random(&[4, 2], 72);

    linear.forward(&x).unwrap();
    let before = linear.weight().unwrap().clone();
    linear.backward(&r, 0.5).unwrap();
    let grad = linear.gradients().unwrap().weight.clone();
    let expected = before.sub(&grad.mul_scalar(0.5));
    assert!(linear.weight().unwrap().max_abs_diff(&expected) < 1e-12);
}
