//! Sequence Regression with a Transformer Encoder
//!
//! Trains an encoder block plus a linear head to predict, at every position,
//! the mean of the first feature over the whole sequence. Each position has to
//! attend to the others to get it right, so the loss only falls if gradients
//! reach the attention weights.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --example regression
//! cargo run --release --example regression -- --steps 500 --lr 0.02 --norm-first
//!
//! # Architecture from a JSON file
//! echo '{"num_heads": 2, "hidden_units": 32, "norm_first": true}' > block.json
//! cargo run --release --example regression -- --config block.json
//!
//! # Per-layer initialization events
//! RUST_LOG=touchstone=debug cargo run --release --example regression
//! ```

use std::fs;
use std::sync::Arc;

use clap::Parser;
use touchstone::{
    Initializer, Layer, Linear, RandomNormal, Sequential, Tensor, TransformerConfig,
    TransformerEncoder,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "regression",
    about = "Train an encoder block on a synthetic sequence regression task"
)]
struct Args {
    /// Training steps
    #[arg(long, default_value = "300")]
    steps: usize,

    /// SGD learning rate
    #[arg(long, default_value = "0.01")]
    lr: f64,

    /// Sequences per batch
    #[arg(long, default_value = "16")]
    batch: usize,

    /// Sequence length
    #[arg(long, default_value = "6")]
    seq_len: usize,

    /// Model width
    #[arg(long, default_value = "8")]
    width: usize,

    /// Attention heads (ignored with --config)
    #[arg(long, default_value = "2")]
    heads: usize,

    /// Feed-forward hidden units (ignored with --config)
    #[arg(long, default_value = "32")]
    hidden: usize,

    /// Pre-normalization instead of post-normalization (ignored with --config)
    #[arg(long)]
    norm_first: bool,

    /// Load the block configuration from a JSON file
    #[arg(long)]
    config: Option<String>,

    /// Seed for data and parameters
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Log every N steps
    #[arg(long, default_value = "25", value_parser = clap::value_parser!(u64).range(1..))]
    log_every: u64,
}

/// Target: mean of feature 0 across the sequence, broadcast to every position
fn targets(x: &Tensor) -> Tensor {
    let (batch, seq, width) = (x.shape[0], x.shape[1], x.shape[2]);
    let mut data = Vec::with_capacity(batch * seq);
    for b in 0..batch {
        let mean = (0..seq).map(|s| x.data[(b * seq + s) * width]).sum::<f64>() / seq as f64;
        data.extend(std::iter::repeat(mean).take(seq));
    }
    Tensor::new(data, vec![batch, seq, 1])
}

/// Mean squared error and its gradient with respect to the prediction
fn mse(pred: &Tensor, target: &Tensor) -> (f64, Tensor) {
    let diff = pred.sub(target);
    let n = diff.len() as f64;
    let loss = diff.dot(&diff) / n;
    (loss, diff.mul_scalar(2.0 / n))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => TransformerConfig::from_json(&fs::read_to_string(path)?)?,
        None => TransformerConfig::new(args.heads, args.hidden).norm_first(args.norm_first),
    };
    info!(config = %config.to_json()?, "block configuration");

    let init = Arc::new(RandomNormal::seeded(0.0, 0.2, args.seed));
    let mut model = Sequential::new()
        .with(TransformerEncoder::with_initializer(&config, init.clone())?)
        .with(Linear::with_initializer(1, init));

    let data = RandomNormal::seeded(0.0, 1.0, args.seed.wrapping_add(1));
    let shape = [args.batch, args.seq_len, args.width];

    // Fixed held-out batch
    let eval_x = data.init(&shape);
    let eval_y = targets(&eval_x);

    let mut best = f64::INFINITY;
    for step in 0..args.steps {
        let x = data.init(&shape);
        let y = targets(&x);

        let pred = model.forward(&x)?;
        let (loss, grad) = mse(&pred, &y);
        if !loss.is_finite() {
            warn!(step, loss, "loss diverged, stopping");
            break;
        }
        model.backward(&grad, args.lr)?;

        if step as u64 % args.log_every == 0 || step + 1 == args.steps {
            let (eval_loss, _) = mse(&model.forward(&eval_x)?, &eval_y);
            best = best.min(eval_loss);
            info!(step, train_loss = loss, eval_loss, "training");
        }
    }

    info!(best_eval_loss = best, "done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_every_must_be_positive() {
        assert!(Args::try_parse_from(["regression", "--log-every", "0"]).is_err());
        let args = Args::try_parse_from(["regression", "--log-every", "5"]).unwrap();
        assert_eq!(args.log_every, 5);
    }
}
