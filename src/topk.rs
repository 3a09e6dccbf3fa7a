//! Two-stage top-k selection of beam search candidates.
//!
//! Beam search needs, for each batch entry, the `2 * num_beams` best
//! `(beam, token)` pairs out of `num_beams * vocab_size` scores. Selecting
//! directly over that set needs scratch space proportional to the
//! vocabulary. Instead the vocabulary is split into shards of fixed size:
//!
//! 1. For every `(batch, beam, shard)` the local top-k is selected.
//! 2. For every batch entry the `num_beams * shards` partial lists are merged
//!    into the global top-k.
//!
//! The scratch space is `batch * beams * shards * k` candidates. Because
//! [`rank_order`] is a total order the result is identical to a single-stage
//! selection.

use std::cmp::Ordering;
use std::iter;

use rayon::prelude::*;

/// Number of vocabulary entries in each stage-1 shard.
pub const DEFAULT_SHARD_SIZE: usize = 1024;

/// A scored `(beam, token)` pair.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Candidate {
    /// Cumulative log probability of the beam extended by `token`.
    pub score: f32,

    /// Beam index within the batch entry.
    pub beam: u32,

    pub token: u32,
}

impl Candidate {
    /// Filler for shards with fewer than `k` entries. Ranks after every
    /// real candidate.
    pub const EMPTY: Candidate = Candidate {
        score: f32::NEG_INFINITY,
        beam: u32::MAX,
        token: u32::MAX,
    };
}

/// Order in which candidates are ranked: higher score first, then lower
/// beam, then lower token id.
///
/// Shards partition each beam's vocabulary in order, so among equal scores
/// in one beam the lower token id is also the one from the earlier shard.
pub fn rank_order(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.beam.cmp(&b.beam))
        .then(a.token.cmp(&b.token))
}

/// Dimensions of a top-k selection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TopKShape {
    pub batch_size: usize,
    pub num_beams: usize,
    pub vocab_size: usize,

    /// Number of candidates selected per batch entry.
    pub k: usize,

    pub shard_size: usize,
}

impl TopKShape {
    /// Shape for beam search, which selects `2 * num_beams` candidates.
    pub fn for_beams(batch_size: usize, num_beams: usize, vocab_size: usize) -> TopKShape {
        TopKShape {
            batch_size,
            num_beams,
            vocab_size,
            k: 2 * num_beams,
            shard_size: DEFAULT_SHARD_SIZE,
        }
    }

    pub fn with_shard_size(mut self, shard_size: usize) -> TopKShape {
        assert!(shard_size > 0);
        self.shard_size = shard_size;
        self
    }

    /// Number of vocabulary shards per beam.
    pub fn shards(&self) -> usize {
        self.vocab_size.div_ceil(self.shard_size)
    }

    /// Number of rows of scores, `batch_size * num_beams`.
    pub fn rows(&self) -> usize {
        self.batch_size * self.num_beams
    }

    /// Number of candidates kept between the two stages.
    pub fn partial_len(&self) -> usize {
        self.rows() * self.shards() * self.k
    }
}

/// Sort the best `k` candidates to the front of `candidates` and drop the
/// rest.
fn retain_top_k(candidates: &mut Vec<Candidate>, k: usize) {
    if k == 0 {
        candidates.clear();
        return;
    }
    if k < candidates.len() {
        candidates.select_nth_unstable_by(k - 1, rank_order);
        candidates.truncate(k);
    }
    candidates.sort_by(rank_order);
}

/// Stage 1: write the top `k` of every `(row, shard)` into `partial`.
///
/// `scores` has shape `(rows, vocab_size)`. `partial` has shape `(rows,
/// shards, k)`. Shards with fewer than `k` entries are padded with
/// [`Candidate::EMPTY`].
pub fn top_k_stage1(scores: &[f32], shape: &TopKShape, partial: &mut [Candidate]) {
    assert_eq!(scores.len(), shape.rows() * shape.vocab_size);
    assert_eq!(partial.len(), shape.partial_len());

    let k = shape.k;
    if k == 0 {
        return;
    }
    partial
        .par_chunks_mut(shape.shards() * k)
        .zip(scores.par_chunks(shape.vocab_size))
        .enumerate()
        .for_each(|(row, (row_out, row_scores))| {
            let beam = (row % shape.num_beams) as u32;
            let mut local = Vec::with_capacity(shape.shard_size);
            for (shard, (shard_out, shard_scores)) in row_out
                .chunks_mut(k)
                .zip(row_scores.chunks(shape.shard_size))
                .enumerate()
            {
                let base = shard * shape.shard_size;
                local.clear();
                local.extend(
                    shard_scores
                        .iter()
                        .enumerate()
                        .map(|(i, &score)| Candidate {
                            score,
                            beam,
                            token: (base + i) as u32,
                        }),
                );
                retain_top_k(&mut local, k);
                let padded = local.iter().chain(iter::repeat(&Candidate::EMPTY));
                for (dst, src) in shard_out.iter_mut().zip(padded) {
                    *dst = *src;
                }
            }
        });
}

/// Stage 2: merge each batch entry's partial lists into its global top `k`.
///
/// `output` has shape `(batch_size, k)`, sorted by [`rank_order`].
pub fn top_k_stage2(partial: &[Candidate], shape: &TopKShape, output: &mut [Candidate]) {
    assert_eq!(partial.len(), shape.partial_len());
    assert_eq!(output.len(), shape.batch_size * shape.k);

    let k = shape.k;
    if k == 0 {
        return;
    }
    let group_len = shape.num_beams * shape.shards() * k;
    let mut merged = Vec::with_capacity(group_len);
    for (out, group) in output.chunks_mut(k).zip(partial.chunks(group_len)) {
        merged.clear();
        merged.extend_from_slice(group);
        retain_top_k(&mut merged, k);
        out.copy_from_slice(&merged[..k]);
    }
}

/// Scratch and output memory for a two-stage top-k selection.
pub struct TopKWorkspace {
    shape: TopKShape,
    partial: Vec<Candidate>,
    output: Vec<Candidate>,
}

impl TopKWorkspace {
    pub fn new(shape: TopKShape) -> TopKWorkspace {
        TopKWorkspace {
            shape,
            partial: vec![Candidate::EMPTY; shape.partial_len()],
            output: vec![Candidate::EMPTY; shape.batch_size * shape.k],
        }
    }

    pub fn shape(&self) -> &TopKShape {
        &self.shape
    }

    /// Select the top-k candidates of every batch entry from `scores`.
    pub fn run(&mut self, scores: &[f32]) {
        top_k_stage1(scores, &self.shape, &mut self.partial);
        top_k_stage2(&self.partial, &self.shape, &mut self.output);
    }

    /// Candidates selected by the last [`run`](Self::run), with shape
    /// `(batch_size, k)`.
    pub fn output(&self) -> &[Candidate] {
        &self.output
    }

    /// Candidates of batch entry `batch`, best first.
    pub fn group(&self, batch: usize) -> &[Candidate] {
        let k = self.shape.k;
        &self.output[batch * k..(batch + 1) * k]
    }
}

#[cfg(test)]
mod tests {
    use rten_testing::{random_scores, TestCases};

    use super::{rank_order, Candidate, TopKShape, TopKWorkspace};

    /// Select the top-k of each batch entry directly over all of its
    /// `num_beams * vocab_size` scores.
    fn top_k_direct(scores: &[f32], shape: &TopKShape) -> Vec<Candidate> {
        let group_len = shape.num_beams * shape.vocab_size;
        let mut output = Vec::new();
        for group in scores.chunks(group_len) {
            let mut all: Vec<Candidate> = group
                .iter()
                .enumerate()
                .map(|(i, &score)| Candidate {
                    score,
                    beam: (i / shape.vocab_size) as u32,
                    token: (i % shape.vocab_size) as u32,
                })
                .collect();
            all.sort_by(rank_order);
            output.extend_from_slice(&all[..shape.k]);
        }
        output
    }

    #[test]
    fn test_top_k_selects_best_candidates() {
        let shape = TopKShape::for_beams(1, 2, 5).with_shard_size(2);
        #[rustfmt::skip]
        let scores = [
            // beam 0
            -1.0, -0.5, -3.0, -0.5, -9.0,
            // beam 1
            -0.2, -4.0, -0.5, -7.0, -8.0,
        ];
        let mut workspace = TopKWorkspace::new(shape);
        workspace.run(&scores);

        let selected: Vec<(u32, u32)> = workspace
            .group(0)
            .iter()
            .map(|c| (c.beam, c.token))
            .collect();

        // Ties at -0.5 go to the lower beam, then the lower token.
        assert_eq!(selected, [(1, 0), (0, 1), (0, 3), (1, 2)]);
    }

    #[test]
    fn test_small_shards_are_padded() {
        // A vocabulary of 3 with shards of 2 leaves a last shard with one
        // entry, fewer than k = 4.
        let shape = TopKShape::for_beams(1, 2, 3).with_shard_size(2);
        assert_eq!(shape.shards(), 2);
        let mut workspace = TopKWorkspace::new(shape);
        workspace.run(&[0.0, -1.0, -2.0, -3.0, -4.0, -5.0]);

        assert!(workspace.partial.contains(&Candidate::EMPTY));
        assert!(!workspace.output().contains(&Candidate::EMPTY));
        assert_eq!(workspace.group(0)[0].token, 0);
    }

    #[test]
    fn test_two_stage_matches_direct_selection() {
        #[derive(Debug)]
        struct Case {
            batch_size: usize,
            num_beams: usize,
            vocab_size: usize,
            shard_size: usize,
        }

        let cases = [
            Case {
                batch_size: 1,
                num_beams: 1,
                vocab_size: 10,
                shard_size: 3,
            },
            Case {
                batch_size: 2,
                num_beams: 3,
                vocab_size: 50,
                shard_size: 7,
            },
            Case {
                batch_size: 3,
                num_beams: 4,
                vocab_size: 64,
                shard_size: 64,
            },
            Case {
                batch_size: 2,
                num_beams: 2,
                vocab_size: 100,
                shard_size: 1,
            },
            Case {
                batch_size: 1,
                num_beams: 5,
                vocab_size: 257,
                shard_size: 16,
            },
        ];

        cases.test_each(|case| {
            let mut rng = fastrand::Rng::with_seed(1234);
            let shape = TopKShape::for_beams(case.batch_size, case.num_beams, case.vocab_size)
                .with_shard_size(case.shard_size);

            for _ in 0..10 {
                let scores = random_scores(&mut rng, shape.rows() * shape.vocab_size, 2.0);
                let mut workspace = TopKWorkspace::new(shape);
                workspace.run(&scores);
                assert_eq!(workspace.output(), top_k_direct(&scores, &shape));
            }
        })
    }

    #[test]
    fn test_workspace_size() {
        let shape = TopKShape::for_beams(2, 3, 10_000).with_shard_size(1000);
        let workspace = TopKWorkspace::new(shape);
        assert_eq!(workspace.partial.len(), 2 * 3 * 10 * 6);
        assert_eq!(workspace.output().len(), 2 * 6);
    }
}
