//! GPT-2 Style Inference Network
//!
//! The network behind [`CheckpointModel`](crate::provider::CheckpointModel).
//! It mirrors the weight layout of the checkpoints it loads and only runs the
//! forward pass:
//!
//! ```text
//! token ids [seq]
//!     ↓
//! token embedding + position embedding   [seq, n_embd]
//!     ↓
//! N × block:
//!     x = x + Attention(LayerNorm(x))    (causal, single head over n_embd)
//!     x = x + MLP(LayerNorm(x))          (n_embd → 4·n_embd → n_embd, GELU)
//!     ↓
//! final LayerNorm
//!     ↓
//! x @ output_weight                      [seq, vocab_size]
//! ```
//!
//! Attention uses one head spanning the whole embedding and scales scores by
//! `1/√n_embd`; `n_heads` in the config is carried for format compatibility.
//! There is no dropout: nothing here ever trains.

use crate::error::{Result, TouchstoneError};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Architecture hyperparameters, serialized into every checkpoint
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub n_embd: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    /// Context window: the most tokens one forward pass sees
    pub block_size: usize,
    pub dropout_rate: f32,
}

impl ModelConfig {
    /// A very small network, handy for tests and smoke runs
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            n_embd: 16,
            n_heads: 1,
            n_layers: 2,
            block_size: 32,
            dropout_rate: 0.0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.n_embd == 0 || self.block_size == 0 {
            return Err(TouchstoneError::InvalidConfig(format!(
                "vocab_size, n_embd and block_size must be positive: {:?}",
                self
            )));
        }
        Ok(())
    }
}

/// Fully connected layer: `y = x @ W + b`, with `W: [in, out]`
#[derive(Clone, Debug)]
pub struct Linear {
    pub weight: Tensor,
    pub bias: Tensor,
}

impl Linear {
    fn forward(&self, x: &Tensor) -> Tensor {
        x.matmul(&self.weight).add_bias(&self.bias)
    }
}

/// Layer normalization over the feature dimension
#[derive(Clone, Debug)]
pub struct LayerNorm {
    pub gamma: Tensor,
    pub beta: Tensor,
    pub eps: f32,
}

impl LayerNorm {
    pub const EPS: f32 = 1e-5;

    fn forward(&self, x: &Tensor) -> Tensor {
        let n = x.cols();
        let mut data = Vec::with_capacity(x.data.len());
        for i in 0..x.rows() {
            let row = x.row(i);
            let mean = row.iter().sum::<f32>() / n as f32;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n as f32;
            let std = (var + self.eps).sqrt();
            for (j, v) in row.iter().enumerate() {
                data.push((v - mean) / std * self.gamma.data[j] + self.beta.data[j]);
            }
        }
        Tensor::new(data, x.shape.clone())
    }
}

/// Causal self-attention with a single head
#[derive(Clone, Debug)]
pub struct Attention {
    pub q_proj: Linear,
    pub k_proj: Linear,
    pub v_proj: Linear,
    pub out_proj: Linear,
}

impl Attention {
    fn forward(&self, x: &Tensor) -> Tensor {
        let seq_len = x.rows();
        let n_embd = x.cols();

        let q = self.q_proj.forward(x);
        let k = self.k_proj.forward(x);
        let v = self.v_proj.forward(x);

        let mut scores = q.matmul(&k.transpose()).mul_scalar(1.0 / (n_embd as f32).sqrt());
        for i in 0..seq_len {
            for j in i + 1..seq_len {
                scores.data[i * seq_len + j] = f32::NEG_INFINITY;
            }
        }

        let weights = scores.softmax_rows();
        self.out_proj.forward(&weights.matmul(&v))
    }
}

/// Feedforward network with tanh-approximated GELU
#[derive(Clone, Debug)]
pub struct Mlp {
    pub fc1: Linear,
    pub fc2: Linear,
}

impl Mlp {
    fn forward(&self, x: &Tensor) -> Tensor {
        self.fc2.forward(&self.fc1.forward(x).map(gelu))
    }
}

/// GELU activation, tanh approximation
///
/// `0.5 * x * (1 + tanh(sqrt(2/π) * (x + 0.044715 * x³)))`
pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + ((2.0 / std::f32::consts::PI).sqrt() * (x + 0.044715 * x.powi(3))).tanh())
}

/// Pre-norm transformer block
#[derive(Clone, Debug)]
pub struct Block {
    pub ln1: LayerNorm,
    pub attn: Attention,
    pub ln2: LayerNorm,
    pub mlp: Mlp,
}

impl Block {
    fn forward(&self, x: &Tensor) -> Tensor {
        let x = x.add(&self.attn.forward(&self.ln1.forward(x)));
        x.add(&self.mlp.forward(&self.ln2.forward(&x)))
    }
}

/// The complete network
#[derive(Clone, Debug)]
pub struct Gpt2 {
    pub config: ModelConfig,
    /// `[vocab_size, n_embd]`
    pub token_embedding: Tensor,
    /// `[block_size, n_embd]`
    pub position_embedding: Tensor,
    pub blocks: Vec<Block>,
    pub ln_final: LayerNorm,
    /// `[n_embd, vocab_size]`, no bias
    pub output_weight: Tensor,
}

impl Gpt2 {
    /// Randomly initialized network
    ///
    /// Weights are drawn from N(0, 0.02) with a seeded generator, so the same
    /// seed always builds the same network. Biases start at 0, layer norm
    /// scales at 1.
    pub fn new(config: &ModelConfig, seed: u64) -> Result<Self> {
        config.validate()?;

        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0f32, 0.02)
            .map_err(|e| TouchstoneError::InvalidConfig(e.to_string()))?;
        let mut init = |shape: Vec<usize>| {
            let data = (0..Tensor::expected_len(&shape))
                .map(|_| normal.sample(&mut rng))
                .collect();
            Tensor::new(data, shape)
        };

        let n = config.n_embd;
        let token_embedding = init(vec![config.vocab_size, n]);
        let position_embedding = init(vec![config.block_size, n]);

        let mut blocks = Vec::with_capacity(config.n_layers);
        for _ in 0..config.n_layers {
            let mut linear = |fan_in: usize, fan_out: usize| Linear {
                weight: init(vec![fan_in, fan_out]),
                bias: Tensor::zeros(vec![fan_out]),
            };
            let attn = Attention {
                q_proj: linear(n, n),
                k_proj: linear(n, n),
                v_proj: linear(n, n),
                out_proj: linear(n, n),
            };
            let mlp = Mlp {
                fc1: linear(n, 4 * n),
                fc2: linear(4 * n, n),
            };
            blocks.push(Block {
                ln1: layer_norm(n),
                attn,
                ln2: layer_norm(n),
                mlp,
            });
        }

        let output_weight = init(vec![n, config.vocab_size]);

        Ok(Self {
            config: config.clone(),
            token_embedding,
            position_embedding,
            blocks,
            ln_final: layer_norm(n),
            output_weight,
        })
    }

    /// Forward pass: token ids → logits
    ///
    /// Adds token and position embeddings, runs every block, applies the final
    /// layer norm and projects to the vocabulary.
    ///
    /// # Arguments
    ///
    /// * `ids` - Token ids of one sequence. Ids outside the vocabulary are
    ///   clamped to the last token and positions past the context window reuse
    ///   the last position embedding; callers are expected to keep sequences
    ///   within `block_size`.
    ///
    /// # Returns
    ///
    /// Logits of shape `[seq_len, vocab_size]`; row `i` predicts the token
    /// after `ids[i]`
    ///
    /// # Panics
    ///
    /// Panics on an empty sequence.
    pub fn forward(&self, ids: &[usize]) -> Tensor {
        assert!(!ids.is_empty(), "forward needs at least one token");

        let n = self.config.n_embd;
        let mut embedded = Vec::with_capacity(ids.len() * n);
        for (pos, &id) in ids.iter().enumerate() {
            let id = id.min(self.config.vocab_size - 1);
            let pos = pos.min(self.config.block_size - 1);
            let tok = &self.token_embedding.data[id * n..(id + 1) * n];
            let posv = &self.position_embedding.data[pos * n..(pos + 1) * n];
            embedded.extend(tok.iter().zip(posv).map(|(a, b)| a + b));
        }

        let mut x = Tensor::new(embedded, vec![ids.len(), n]);
        for block in &self.blocks {
            x = block.forward(&x);
        }
        self.ln_final.forward(&x).matmul(&self.output_weight)
    }

    /// Logits for the token following `ids`
    ///
    /// # Returns
    ///
    /// The last row of [`forward`](Self::forward), `vocab_size` long
    pub fn next_token_logits(&self, ids: &[usize]) -> Vec<f32> {
        let logits = self.forward(ids);
        logits.row(ids.len() - 1).to_vec()
    }

    /// Total number of learnable parameters
    pub fn count_parameters(&self) -> usize {
        let linear = |l: &Linear| l.weight.data.len() + l.bias.data.len();
        let norm = |l: &LayerNorm| l.gamma.data.len() + l.beta.data.len();

        let blocks: usize = self
            .blocks
            .iter()
            .map(|b| {
                norm(&b.ln1)
                    + linear(&b.attn.q_proj)
                    + linear(&b.attn.k_proj)
                    + linear(&b.attn.v_proj)
                    + linear(&b.attn.out_proj)
                    + norm(&b.ln2)
                    + linear(&b.mlp.fc1)
                    + linear(&b.mlp.fc2)
            })
            .sum();

        self.token_embedding.data.len()
            + self.position_embedding.data.len()
            + blocks
            + norm(&self.ln_final)
            + self.output_weight.data.len()
    }
}

fn layer_norm(n: usize) -> LayerNorm {
    LayerNorm {
        gamma: Tensor::new(vec![1.0; n], vec![n]),
        beta: Tensor::zeros(vec![n]),
        eps: LayerNorm::EPS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_shape() {
        let model = Gpt2::new(&ModelConfig::tiny(256), 1).unwrap();
        let logits = model.forward(&[1, 2, 3, 4]);
        assert_eq!(logits.shape, vec![4, 256]);
        assert!(logits.data.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_same_seed_same_network() {
        let a = Gpt2::new(&ModelConfig::tiny(64), 7).unwrap();
        let b = Gpt2::new(&ModelConfig::tiny(64), 7).unwrap();
        assert_eq!(a.forward(&[5, 6]).data, b.forward(&[5, 6]).data);
    }

    #[test]
    fn test_causal_prefix_logits_unchanged_by_suffix() {
        let model = Gpt2::new(&ModelConfig::tiny(64), 3).unwrap();
        let short = model.forward(&[10, 11, 12]);
        let long = model.forward(&[10, 11, 12, 13, 14]);
        for i in 0..3 {
            for (a, b) in short.row(i).iter().zip(long.row(i)) {
                assert!((a - b).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_parameter_count() {
        let config = ModelConfig::tiny(100);
        let model = Gpt2::new(&config, 0).unwrap();
        let n = config.n_embd;
        let per_block = 4 * n + 4 * (n * n + n) + (n * 4 * n + 4 * n) + (4 * n * n + n);
        let expected = 100 * n + config.block_size * n + config.n_layers * per_block + 2 * n + n * 100;
        assert_eq!(model.count_parameters(), expected);
    }

    #[test]
    fn test_layer_norm_normalizes_rows() {
        let ln = layer_norm(4);
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![1, 4]);
        let y = ln.forward(&x);
        let mean: f32 = y.data.iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
    }

    #[test]
    fn test_rejects_empty_vocab() {
        assert!(Gpt2::new(&ModelConfig::tiny(0), 0).is_err());
    }
}
