//! Transformer Block Configuration
//!
//! Hyperparameters shared by [`TransformerEncoder`](crate::TransformerEncoder)
//! and [`TransformerDecoder`](crate::TransformerDecoder). The model width is
//! not part of the config: blocks infer it from their first input.
//!
//! Configs serialize to JSON so an experiment's architecture can be stored
//! next to its logs:
//!
//! ```rust
//! use touchstone::TransformerConfig;
//!
//! let config = TransformerConfig::new(4, 128).norm_first(true);
//! let json = config.to_json().unwrap();
//! assert_eq!(TransformerConfig::from_json(&json).unwrap(), config);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{LayerError, Result};
use crate::layers::layer_norm::DEFAULT_EPSILON;

/// Transformer block hyperparameters
///
/// # Fields
///
/// - `num_heads`: Attention heads; must divide the model width
/// - `hidden_units`: Width of the feed-forward hidden layer
/// - `norm_first`: Pre-normalization (`true`) or post-normalization
/// - `epsilon`: Layer norm ε
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    pub num_heads: usize,
    pub hidden_units: usize,
    #[serde(default)]
    pub norm_first: bool,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
}

fn default_epsilon() -> f64 {
    DEFAULT_EPSILON
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            num_heads: 4,
            hidden_units: 256,
            norm_first: false,
            epsilon: DEFAULT_EPSILON,
        }
    }
}

impl TransformerConfig {
    /// Post-norm config with the default ε
    pub fn new(num_heads: usize, hidden_units: usize) -> Self {
        Self {
            num_heads,
            hidden_units,
            ..Self::default()
        }
    }

    pub fn norm_first(mut self, norm_first: bool) -> Self {
        self.norm_first = norm_first;
        self
    }

    pub fn epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Reject values that can never build a working block
    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 {
            return Err(LayerError::InvalidConfig("num_heads must be at least 1".into()));
        }
        if self.hidden_units == 0 {
            return Err(LayerError::InvalidConfig("hidden_units must be at least 1".into()));
        }
        if !(self.epsilon > 0.0) {
            return Err(LayerError::InvalidConfig(format!(
                "epsilon must be positive, got {}",
                self.epsilon
            )));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and validate a JSON config
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}
