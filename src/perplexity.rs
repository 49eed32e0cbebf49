//! Sliding-Window Perplexity
//!
//! Perplexity is `exp(mean NLL)` over the scored tokens. A model with a
//! finite context can't see a long text at once, so the text is walked in
//! windows:
//!
//! ```text
//! tokens:   t0 t1 t2 t3 t4 t5 t6 t7 t8
//! start=4, stride=2, context=4
//!
//! window 1:      [t1 t2 t3 t4 t5]     targets t4 t5
//! window 2:            [t3 t4 t5 t6 t7]     targets t6 t7
//! window 3:               [t4 t5 t6 t7 t8]  target  t8
//! ```
//!
//! Each window ends at its last target and reaches back as far as the
//! context allows. Only the window's new targets are scored, so a token is
//! never counted twice, and each window's mean NLL is weighted by how many
//! targets it scored.
//!
//! The first token of a text has nothing to condition on, so scoring never
//! starts before token 1.

use crate::error::{Result, TouchstoneError};

/// Perplexity of `ids[start..]` given everything before it
///
/// `window_nll(window, num_targets)` must return the mean negative
/// log-likelihood of the last `num_targets` tokens of `window`, each
/// predicted from the tokens before it. Windows never exceed
/// `context + 1` tokens: `context` inputs plus the final target.
///
/// A stride larger than the context is clamped to it.
///
/// # Errors
///
/// [`TouchstoneError::EmptyScoringSpan`] when no token is left to score;
/// anything `window_nll` returns is propagated.
///
/// # Example
///
/// ```rust
/// # use touchstone::perplexity::sliding_window_perplexity;
/// // A model that is uniformly unsure between 4 tokens has perplexity 4
/// let ppl = sliding_window_perplexity(&[1, 2, 3, 4, 5], 1, 1, 8, |_, _| {
///     Ok(4f64.ln())
/// })
/// .unwrap();
/// assert!((ppl - 4.0).abs() < 1e-9);
/// ```
pub fn sliding_window_perplexity<F>(
    ids: &[usize],
    start: usize,
    stride: usize,
    context: usize,
    mut window_nll: F,
) -> Result<f64>
where
    F: FnMut(&[usize], usize) -> Result<f64>,
{
    let first = start.max(1);
    if first >= ids.len() || context == 0 {
        return Err(TouchstoneError::EmptyScoringSpan {
            start,
            len: ids.len(),
        });
    }
    let stride = stride.clamp(1, context);

    let mut total_nll = 0.0;
    let mut scored = 0usize;
    let mut target = first;
    while target < ids.len() {
        let end = (target + stride).min(ids.len());
        let begin = (end - 1).saturating_sub(context);
        let num_targets = end - target;

        let nll = window_nll(&ids[begin..end], num_targets)?;
        total_nll += nll * num_targets as f64;
        scored += num_targets;
        target = end;
    }

    Ok((total_nll / scored as f64).exp())
}

/// Mean NLL of the last `num_targets` entries of `targets`, given
/// `log_probs[i]`, the log-distribution that predicts `targets[i]`
///
/// Shared by backends that compute a full log-softmax per position.
pub fn mean_target_nll(log_probs: &[Vec<f64>], targets: &[usize], num_targets: usize) -> f64 {
    let skip = targets.len() - num_targets;
    let sum: f64 = log_probs
        .iter()
        .zip(targets)
        .skip(skip)
        .map(|(row, &t)| -row.get(t).copied().unwrap_or(f64::NEG_INFINITY))
        .sum();
    sum / num_targets as f64
}

/// `log(softmax(logits))` in f64
pub fn log_softmax(logits: &[f32]) -> Vec<f64> {
    let max = logits
        .iter()
        .fold(f64::NEG_INFINITY, |a, &b| a.max(b as f64));
    let log_sum = logits
        .iter()
        .map(|&v| (v as f64 - max).exp())
        .sum::<f64>()
        .ln()
        + max;
    logits.iter().map(|&v| v as f64 - log_sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every window it is asked to score
    fn recording(ids: &[usize], start: usize, stride: usize, context: usize) -> Vec<(Vec<usize>, usize)> {
        let mut windows = Vec::new();
        sliding_window_perplexity(ids, start, stride, context, |w, n| {
            windows.push((w.to_vec(), n));
            Ok(1.0)
        })
        .unwrap();
        windows
    }

    #[test]
    fn test_token_by_token_windows() {
        let windows = recording(&[0, 1, 2, 3, 4], 3, 1, 8);
        assert_eq!(windows, vec![(vec![0, 1, 2, 3], 1), (vec![0, 1, 2, 3, 4], 1)]);
    }

    #[test]
    fn test_windows_respect_context() {
        let ids: Vec<usize> = (0..9).collect();
        let windows = recording(&ids, 4, 2, 4);
        assert_eq!(
            windows,
            vec![
                (vec![1, 2, 3, 4, 5], 2),
                (vec![3, 4, 5, 6, 7], 2),
                (vec![4, 5, 6, 7, 8], 1),
            ]
        );
        for (w, _) in &windows {
            assert!(w.len() <= 5);
        }
    }

    #[test]
    fn test_whole_remainder_in_one_pass() {
        let windows = recording(&[0, 1, 2, 3, 4, 5], 2, 100, 16);
        assert_eq!(windows, vec![(vec![0, 1, 2, 3, 4, 5], 4)]);
    }

    #[test]
    fn test_start_zero_scores_from_token_one() {
        let windows = recording(&[7, 8, 9], 0, 1, 8);
        assert_eq!(windows[0], (vec![7, 8], 1));
        assert_eq!(windows.len(), 2);
    }

    #[test]
    fn test_empty_span_is_an_error() {
        let err = sliding_window_perplexity(&[1, 2, 3], 3, 1, 8, |_, _| Ok(0.0)).unwrap_err();
        assert!(matches!(err, TouchstoneError::EmptyScoringSpan { start: 3, len: 3 }));
        assert!(sliding_window_perplexity(&[1], 0, 1, 8, |_, _| Ok(0.0)).is_err());
    }

    #[test]
    fn test_windows_weighted_by_target_count() {
        // 2 targets at NLL 1.0, then 1 target at NLL 4.0 → mean 2.0
        let ppl = sliding_window_perplexity(&[0, 1, 2, 3], 1, 2, 8, |_, n| {
            Ok(if n == 2 { 1.0 } else { 4.0 })
        })
        .unwrap();
        assert!((ppl - 2f64.exp()).abs() < 1e-9);
    }

    #[test]
    fn test_log_softmax_normalizes() {
        let lp = log_softmax(&[1.0, 2.0, 3.0]);
        let total: f64 = lp.iter().map(|v| v.exp()).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_mean_target_nll_uses_last_targets() {
        let rows = vec![log_softmax(&[0.0, 0.0]), log_softmax(&[0.0, 0.0]), log_softmax(&[0.0, 10.0])];
        let nll = mean_target_nll(&rows, &[0, 0, 1], 1);
        assert!(nll < 1e-3);
    }
}
