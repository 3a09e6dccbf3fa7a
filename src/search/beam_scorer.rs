//! Bookkeeping of finished and alive beams.

use std::cmp::Ordering;

use crate::config::SearchConfig;
use crate::sequences::Sequences;
use crate::topk::Candidate;

/// A finished sequence and its length-normalized score.
#[derive(Clone, Debug, PartialEq)]
pub struct Hypothesis {
    pub tokens: Vec<i32>,
    pub score: f32,
}

/// Best-first order of hypotheses: higher score, then shorter sequence.
fn hypothesis_order(a: &Hypothesis, b: &Hypothesis) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.tokens.len().cmp(&b.tokens.len()))
}

/// Up to `num_beams` finished hypotheses of one batch entry, best first.
#[derive(Clone, Debug)]
pub struct BeamHypotheses {
    beams: Vec<Hypothesis>,
    num_beams: usize,
    length_penalty: f32,
    early_stopping: bool,
}

impl BeamHypotheses {
    pub fn new(num_beams: usize, length_penalty: f32, early_stopping: bool) -> BeamHypotheses {
        BeamHypotheses {
            beams: Vec::with_capacity(num_beams + 1),
            num_beams,
            length_penalty,
            early_stopping,
        }
    }

    pub fn len(&self) -> usize {
        self.beams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beams.is_empty()
    }

    pub fn hypotheses(&self) -> &[Hypothesis] {
        &self.beams
    }

    fn normalize(&self, sum_logprobs: f32, length: usize) -> f32 {
        sum_logprobs / (length as f32).powf(self.length_penalty)
    }

    /// Add a finished sequence with cumulative log probability
    /// `sum_logprobs`, if it beats the worst one kept.
    pub fn add(&mut self, tokens: &[i32], sum_logprobs: f32) {
        let hyp = Hypothesis {
            score: self.normalize(sum_logprobs, tokens.len()),
            tokens: tokens.to_vec(),
        };
        if self.beams.len() == self.num_beams {
            match self.beams.last() {
                Some(worst) if hyp.score > worst.score => {}
                _ => return,
            }
        }
        let pos = self
            .beams
            .partition_point(|h| hypothesis_order(h, &hyp) != Ordering::Greater);
        self.beams.insert(pos, hyp);
        self.beams.truncate(self.num_beams);
    }

    /// Return true if no alive beam can produce a hypothesis better than
    /// the ones kept.
    ///
    /// `best_sum_logprobs` is the best cumulative log probability among the
    /// alive beams and `current_length` their length.
    pub fn is_done(&self, best_sum_logprobs: f32, current_length: usize) -> bool {
        if self.beams.len() < self.num_beams {
            return false;
        }
        if self.early_stopping {
            return true;
        }
        let best_possible = self.normalize(best_sum_logprobs, current_length);
        self.beams
            .last()
            .is_some_and(|worst| worst.score >= best_possible)
    }
}

/// Advances the alive beams of each batch entry and collects finished ones.
pub struct BeamScorer {
    batch_size: usize,
    num_beams: usize,
    pad_token_id: i32,
    eos_token_id: i32,

    hypotheses: Vec<BeamHypotheses>,
    done: Vec<bool>,

    // Outputs of the last `process` call, per row.
    next_scores: Vec<f32>,
    next_tokens: Vec<i32>,
    next_indices: Vec<usize>,
}

impl BeamScorer {
    pub fn new(batch_size: usize, config: &SearchConfig) -> BeamScorer {
        let num_beams = config.num_beams;
        let rows = batch_size * num_beams;
        BeamScorer {
            batch_size,
            num_beams,
            pad_token_id: config.pad_token_id,
            eos_token_id: config.eos_token_id,
            hypotheses: (0..batch_size)
                .map(|_| {
                    BeamHypotheses::new(num_beams, config.length_penalty, config.early_stopping)
                })
                .collect(),
            done: vec![false; batch_size],
            next_scores: vec![0.; rows],
            next_tokens: vec![config.pad_token_id; rows],
            next_indices: vec![0; rows],
        }
    }

    /// Choose the beams that continue from `candidates`, `(batch, 2 *
    /// num_beams)` candidates sorted best first within each batch entry.
    ///
    /// An end-of-sequence candidate ranked among the first `num_beams` of its
    /// group finishes that beam. One ranked lower is dropped. All other
    /// candidates fill the alive slots in order.
    pub fn process(&mut self, sequences: &Sequences, candidates: &[Candidate]) {
        let nb = self.num_beams;
        let k = 2 * nb;
        assert_eq!(candidates.len(), self.batch_size * k);

        for (batch, group) in candidates.chunks_exact(k).enumerate() {
            let first_row = batch * nb;
            if self.done[batch] {
                self.next_scores[first_row..first_row + nb].fill(0.);
                self.next_tokens[first_row..first_row + nb].fill(self.pad_token_id);
                self.next_indices[first_row..first_row + nb].fill(first_row);
                continue;
            }

            let mut slot = 0;
            for (rank, cand) in group.iter().enumerate() {
                let row = first_row + cand.beam as usize;
                if cand.token as i32 == self.eos_token_id {
                    if rank >= nb {
                        continue;
                    }
                    self.hypotheses[batch].add(sequences.sequence(row), cand.score);
                } else {
                    self.next_scores[first_row + slot] = cand.score;
                    self.next_tokens[first_row + slot] = cand.token as i32;
                    self.next_indices[first_row + slot] = row;
                    slot += 1;
                }
                if slot == nb {
                    break;
                }
            }

            self.done[batch] =
                self.hypotheses[batch].is_done(group[0].score, sequences.sequence_length());
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.iter().all(|&d| d)
    }

    /// Return true if batch entry `batch` has finished.
    pub fn group_done(&self, batch: usize) -> bool {
        self.done[batch]
    }

    pub fn next_scores(&self) -> &[f32] {
        &self.next_scores
    }

    pub fn next_tokens(&self) -> &[i32] {
        &self.next_tokens
    }

    /// Row each alive beam continues from.
    pub fn next_indices(&self) -> &[usize] {
        &self.next_indices
    }

    pub fn hypotheses(&self, batch: usize) -> &BeamHypotheses {
        &self.hypotheses[batch]
    }

    /// Write the best `num_return_sequences` hypotheses of every batch
    /// entry into `output` and `scores`.
    ///
    /// Alive beams of unfinished batch entries are added as hypotheses with
    /// their cumulative scores `beam_scores` first.
    pub fn finalize(
        &mut self,
        sequences: &Sequences,
        beam_scores: &[f32],
        num_return_sequences: usize,
        output: &mut [i32],
        scores: &mut [f32],
    ) {
        let nb = self.num_beams;
        let max_length = sequences.max_length();
        for batch in 0..self.batch_size {
            if !self.done[batch] {
                for row in batch * nb..(batch + 1) * nb {
                    self.hypotheses[batch].add(sequences.sequence(row), beam_scores[row]);
                }
            }

            let group_out = &mut output[batch * num_return_sequences * max_length..]
                [..num_return_sequences * max_length];
            let group_scores =
                &mut scores[batch * num_return_sequences..][..num_return_sequences];
            group_out.fill(self.pad_token_id);
            group_scores.fill(0.);

            for ((hyp, out), score) in self.hypotheses[batch]
                .hypotheses()
                .iter()
                .zip(group_out.chunks_exact_mut(max_length))
                .zip(group_scores.iter_mut())
            {
                out[..hyp.tokens.len()].copy_from_slice(&hyp.tokens);
                *score = hyp.score;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rten_testing::TestCases;

    use super::{BeamHypotheses, BeamScorer, Hypothesis};
    use crate::config::SearchConfig;
    use crate::sequences::Sequences;
    use crate::topk::Candidate;

    fn cand(score: f32, beam: u32, token: u32) -> Candidate {
        Candidate { score, beam, token }
    }

    #[test]
    fn test_hypotheses_keep_best() {
        let mut hyps = BeamHypotheses::new(2, 1.0, false);
        hyps.add(&[1, 2], -4.0);
        hyps.add(&[1, 2, 3, 4], -4.0);
        hyps.add(&[5, 6], -2.0);

        // Scores are -2, -1 and -1 after length normalization. The shorter
        // sequence wins the tie.
        let kept: Vec<&Hypothesis> = hyps.hypotheses().iter().collect();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].tokens, [5, 6]);
        assert_eq!(kept[0].score, -1.0);
        assert_eq!(kept[1].tokens, [1, 2, 3, 4]);

        // Not better than the worst, so ignored.
        hyps.add(&[7], -1.0);
        assert_eq!(hyps.hypotheses()[1].tokens, [1, 2, 3, 4]);

        hyps.add(&[8], -0.5);
        assert_eq!(hyps.hypotheses()[0].tokens, [8]);
        assert_eq!(hyps.hypotheses()[1].tokens, [5, 6]);
    }

    #[test]
    fn test_hypotheses_done() {
        #[derive(Debug)]
        struct Case {
            early_stopping: bool,
            best_sum_logprobs: f32,
            expected: bool,
        }

        let cases = [
            Case {
                early_stopping: true,
                best_sum_logprobs: 0.0,
                expected: true,
            },
            // Worst kept is -1 per token. An alive beam at -2 over 4 tokens
            // can still do better.
            Case {
                early_stopping: false,
                best_sum_logprobs: -2.0,
                expected: false,
            },
            Case {
                early_stopping: false,
                best_sum_logprobs: -8.0,
                expected: true,
            },
        ];

        cases.test_each(|case| {
            let mut hyps = BeamHypotheses::new(1, 1.0, case.early_stopping);
            assert!(!hyps.is_done(case.best_sum_logprobs, 4));
            hyps.add(&[1, 2], -2.0);
            assert_eq!(hyps.is_done(case.best_sum_logprobs, 4), case.expected);
        })
    }

    #[test]
    fn test_process_splits_eos_candidates() {
        let config = SearchConfig {
            num_beams: 2,
            eos_token_id: 9,
            pad_token_id: 0,
            early_stopping: false,
            ..Default::default()
        };
        let mut scorer = BeamScorer::new(1, &config);
        let seqs = Sequences::new(&[4, 5], 1, 2, 8);

        scorer.process(
            &seqs,
            &[
                cand(-0.5, 1, 9), // EOS within the top 2: finished
                cand(-1.0, 0, 3),
                cand(-1.5, 1, 2),
                cand(-2.0, 0, 9),
            ],
        );

        assert_eq!(scorer.next_tokens(), &[3, 2]);
        assert_eq!(scorer.next_indices(), &[0, 1]);
        assert_eq!(scorer.next_scores(), &[-1.0, -1.5]);
        assert_eq!(scorer.hypotheses(0).len(), 1);
        assert_eq!(scorer.hypotheses(0).hypotheses()[0].tokens, [4, 5]);
        assert!(!scorer.group_done(0));
    }

    #[test]
    fn test_low_ranked_eos_is_dropped() {
        let config = SearchConfig {
            num_beams: 2,
            eos_token_id: 9,
            ..Default::default()
        };
        let mut scorer = BeamScorer::new(1, &config);
        let seqs = Sequences::new(&[4], 1, 2, 8);

        scorer.process(
            &seqs,
            &[
                cand(-0.1, 0, 1),
                cand(-0.2, 0, 2),
                cand(-0.3, 1, 9),
                cand(-0.4, 1, 3),
            ],
        );

        assert_eq!(scorer.next_tokens(), &[1, 2]);
        assert!(scorer.hypotheses(0).is_empty());
    }

    #[test]
    fn test_done_groups_are_padded() {
        let config = SearchConfig {
            num_beams: 2,
            eos_token_id: 9,
            pad_token_id: 0,
            early_stopping: true,
            ..Default::default()
        };
        let mut scorer = BeamScorer::new(2, &config);
        let seqs = Sequences::new(&[4, 5], 2, 2, 8);

        // Both top candidates of batch 0 are EOS.
        let candidates = [
            cand(-0.1, 0, 9),
            cand(-0.2, 1, 9),
            cand(-0.3, 0, 1),
            cand(-0.4, 1, 1),
            cand(-0.1, 0, 1),
            cand(-0.2, 1, 2),
            cand(-0.3, 0, 3),
            cand(-0.4, 1, 4),
        ];
        scorer.process(&seqs, &candidates);
        assert!(scorer.group_done(0));
        assert!(!scorer.group_done(1));
        assert!(!scorer.is_done());

        scorer.process(&seqs, &candidates);
        assert_eq!(scorer.next_tokens()[..2], [0, 0]);
        assert_eq!(scorer.next_indices()[..2], [0, 0]);
        assert_eq!(scorer.next_scores()[..2], [0., 0.]);
    }

    #[test]
    fn test_finalize_order_and_limit() {
        let config = SearchConfig {
            num_beams: 3,
            eos_token_id: 9,
            pad_token_id: 0,
            early_stopping: false,
            ..Default::default()
        };
        let mut scorer = BeamScorer::new(1, &config);
        let mut seqs = Sequences::new(&[4], 1, 3, 4);
        seqs.append_next_tokens(&[1, 2, 3]);

        // One finished hypothesis of length 2 and score -1.
        scorer.process(
            &seqs,
            &[
                cand(-2.0, 0, 9),
                cand(-2.5, 1, 6),
                cand(-3.0, 2, 7),
                cand(-3.5, 0, 8),
                cand(-4.0, 1, 5),
                cand(-4.5, 2, 5),
            ],
        );
        seqs.append_reordered(scorer.next_indices(), scorer.next_tokens());

        // Alive beams have length 3, normalized scores -2.5/3, -1 and -3.5/3.
        let beam_scores = scorer.next_scores().to_vec();
        let mut output = vec![-1; 2 * 4];
        let mut scores = vec![0.; 2];
        scorer.finalize(&seqs, &beam_scores, 2, &mut output, &mut scores);

        assert_eq!(output, [4, 2, 6, 0, 4, 1, 0, 0]);
        assert_eq!(scores, [-2.5 / 3., -1.0]);
    }
}
