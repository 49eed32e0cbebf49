//! Token Sampling
//!
//! Turns next-token logits into a token id:
//!
//! 1. Tokens that would repeat an n-gram already in the sequence are masked
//!    out (unless that would mask out everything)
//! 2. The logits are divided by the temperature and softmaxed
//! 3. A token is drawn from the distribution with a seeded generator, or the
//!    argmax is taken when sampling is off or the temperature is not positive
//!
//! ## Temperature
//!
//! `softmax(logits / T)` is the one knob the experiments sweep. At `T = 1`
//! the model's own distribution is used; `T > 1` flattens it towards uniform
//! and `T < 1` sharpens it towards the single most likely token.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// `softmax(values / temperature)`
///
/// A non-positive temperature yields a one-hot vector on the largest value.
/// Entries equal to `f32::NEG_INFINITY` get probability 0; if every entry is
/// `NEG_INFINITY` the result is uniform.
///
/// # Example
///
/// ```rust
/// # use touchstone::sampling::temperature_softmax;
/// let sharp = temperature_softmax(&[1.0, 2.0], 0.5);
/// let flat = temperature_softmax(&[1.0, 2.0], 2.0);
/// assert!(sharp[1] > flat[1]);
/// ```
pub fn temperature_softmax(values: &[f32], temperature: f32) -> Vec<f32> {
    if values.is_empty() {
        return Vec::new();
    }

    let max = values.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    if max == f32::NEG_INFINITY {
        return vec![1.0 / values.len() as f32; values.len()];
    }

    if temperature <= 0.0 {
        let mut one_hot = vec![0.0; values.len()];
        one_hot[argmax(values)] = 1.0;
        return one_hot;
    }

    let exps: Vec<f32> = values
        .iter()
        .map(|&v| ((v - max) / temperature).exp())
        .collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Index of the largest value (first one on ties)
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// Tokens that would complete an `n`-gram already present in `tokens`
///
/// The last `n - 1` tokens form the current prefix; every earlier occurrence
/// of that prefix bans the token that followed it. `n = 0` disables the rule
/// and `n = 1` bans every token seen so far.
///
/// # Example
///
/// ```rust
/// # use touchstone::sampling::banned_ngram_tokens;
/// // "a b" already occurred, so after another "a" the token "b" is banned
/// assert_eq!(banned_ngram_tokens(&[1, 2, 3, 1], 2), vec![2]);
/// ```
pub fn banned_ngram_tokens(tokens: &[usize], n: usize) -> Vec<usize> {
    if n == 0 || tokens.len() + 1 < n {
        return Vec::new();
    }

    let prefix = &tokens[tokens.len() + 1 - n..];
    let mut banned: Vec<usize> = tokens
        .windows(n)
        .filter(|window| window[..n - 1] == *prefix)
        .map(|window| window[n - 1])
        .collect();
    banned.sort_unstable();
    banned.dedup();
    banned
}

/// Seeded token sampler
///
/// The generator state advances with every draw, so a sweep of several
/// temperatures after one [`Sampler::reseed`] is reproducible as a whole.
pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Reset the generator to a fresh state derived from `seed`
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Draw an index from a probability vector by inverse CDF
    pub fn sample(&mut self, probs: &[f32]) -> usize {
        let r: f32 = self.rng.random();
        let mut cumsum = 0.0;
        for (i, &p) in probs.iter().enumerate() {
            cumsum += p;
            if r < cumsum {
                return i;
            }
        }
        // Rounding left the total just under r: fall back to the last token
        // that had any mass
        probs.iter().rposition(|&p| p > 0.0).unwrap_or(0)
    }

    /// Choose the next token from raw logits
    ///
    /// `banned` tokens are excluded unless that would exclude every token, in
    /// which case the ban is ignored for this step.
    pub fn pick(&mut self, logits: &[f32], temperature: f32, do_sample: bool, banned: &[usize]) -> usize {
        let mut masked = logits.to_vec();
        for &id in banned {
            if let Some(v) = masked.get_mut(id) {
                *v = f32::NEG_INFINITY;
            }
        }
        let logits = if masked.iter().any(|v| v.is_finite()) {
            masked
        } else {
            logits.to_vec()
        };

        if !do_sample || temperature <= 0.0 {
            return argmax(&logits);
        }
        let probs = temperature_softmax(&logits, temperature);
        self.sample(&probs)
    }
}
