//! Processors that adjust next-token scores before selection.
//!
//! Processors are stateless. At each step they receive the scores of every
//! row plus the token history, and modify the scores in place.

use rustc_hash::FxHashSet;

use crate::sequences::Sequences;

/// Modifies next-token scores before a token is selected.
pub trait LogitsProcessor {
    /// Adjust `scores`, a `(batch_beam, vocab_size)` matrix, given the
    /// tokens generated so far.
    fn process(&self, scores: &mut [f32], vocab_size: usize, sequences: &Sequences);
}

/// Prevents the end-of-sequence token being selected until sequences have
/// reached a minimum length.
pub struct MinLength {
    pub min_length: usize,
    pub eos_token_id: i32,
}

impl LogitsProcessor for MinLength {
    fn process(&self, scores: &mut [f32], vocab_size: usize, sequences: &Sequences) {
        if sequences.sequence_length() >= self.min_length {
            return;
        }
        let eos = self.eos_token_id as usize;
        for row in scores.chunks_exact_mut(vocab_size) {
            row[eos] = f32::NEG_INFINITY;
        }
    }
}

/// Penalizes tokens that already occur in a row's history.
///
/// Positive scores are divided by the penalty and negative scores are
/// multiplied by it, so a penalty above 1 always makes a repeated token less
/// likely. Each distinct token is penalized once, however often it occurs.
pub struct RepetitionPenalty {
    pub penalty: f32,
}

impl LogitsProcessor for RepetitionPenalty {
    fn process(&self, scores: &mut [f32], vocab_size: usize, sequences: &Sequences) {
        let mut seen = FxHashSet::default();
        for (row, row_scores) in scores.chunks_exact_mut(vocab_size).enumerate() {
            seen.clear();
            for &token in sequences.sequence(row) {
                if token < 0 || token as usize >= vocab_size || !seen.insert(token) {
                    continue;
                }
                let score = &mut row_scores[token as usize];
                *score = if *score < 0. {
                    *score * self.penalty
                } else {
                    *score / self.penalty
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{LogitsProcessor, MinLength, RepetitionPenalty};
    use crate::sequences::Sequences;

    #[test]
    fn test_min_length() {
        let processor = MinLength {
            min_length: 3,
            eos_token_id: 1,
        };
        let mut seqs = Sequences::new(&[4, 5], 2, 1, 4);
        let mut scores = vec![0.5; 6];

        processor.process(&mut scores, 3, &seqs);
        assert_eq!(
            scores,
            [0.5, f32::NEG_INFINITY, 0.5, 0.5, f32::NEG_INFINITY, 0.5]
        );

        seqs.append_next_tokens(&[0, 0]);
        seqs.append_next_tokens(&[0, 0]);
        let mut scores = vec![0.5; 6];
        processor.process(&mut scores, 3, &seqs);
        assert_eq!(scores, [0.5; 6]);
    }

    #[test]
    fn test_repetition_penalty() {
        let processor = RepetitionPenalty { penalty: 2.0 };
        // Token 1 occurs twice in row 0 but is only penalized once.
        let seqs = Sequences::new(&[1, 1, 2, 3, 3, 0], 2, 1, 4);
        let mut scores = vec![
            1.0, 1.0, -1.0, 1.0, //
            1.0, 1.0, -1.0, 4.0, //
        ];

        processor.process(&mut scores, 4, &seqs);
        assert_eq!(scores, [1.0, 0.5, -2.0, 1.0, 0.5, 1.0, -1.0, 2.0]);
    }

    #[test]
    fn test_repetition_penalty_is_idempotent_on_same_input() {
        let processor = RepetitionPenalty { penalty: 1.5 };
        let seqs = Sequences::new(&[2, 0], 1, 1, 3);
        let logits = vec![-0.5, 0.25, 3.0];

        let mut a = logits.clone();
        let mut b = logits.clone();
        processor.process(&mut a, 3, &seqs);
        processor.process(&mut b, 3, &seqs);
        assert_eq!(a, b);
        assert_eq!(a, [-0.75, 0.25, 2.0]);
    }
}
