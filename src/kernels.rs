//! Device kernels used by the decoding loop.
//!
//! A [`Kernel`] describes work launched on an execution queue. The functions
//! in this module are the host implementations of the same operations. CPU
//! paths call them directly, and the emulated queue runs them when a kernel
//! is launched.

use std::cell::RefCell;
use std::rc::Rc;

use crate::buffer::{AnyBuffer, Buffer, IntElement};
use crate::device::DeviceError;
use crate::search::BeamScorer;
use crate::sequences::Sequences;
use crate::topk::TopKWorkspace;

/// Add one to every element.
pub fn increment<T: IntElement>(data: &mut [T]) {
    for x in data {
        *x = *x + T::ONE;
    }
}

/// Copy a `(rows, width - 1)` attention mask into a `(rows, width)` one and
/// set the new last column to 1.
pub fn extend_attention_mask<T: IntElement>(dst: &mut [T], src: &[T], rows: usize, width: usize) {
    assert!(width >= 2);
    assert_eq!(src.len(), rows * (width - 1));
    assert_eq!(dst.len(), rows * width);

    for (dst_row, src_row) in dst.chunks_exact_mut(width).zip(src.chunks_exact(width - 1)) {
        dst_row[..width - 1].copy_from_slice(src_row);
        dst_row[width - 1] = T::ONE;
    }
}

/// Write the index of the highest score of each `vocab_size` row of
/// `scores` into `tokens`.
///
/// Ties go to the lowest index.
pub fn argmax_rows(scores: &[f32], vocab_size: usize, tokens: &mut [i32]) {
    assert_eq!(scores.len(), tokens.len() * vocab_size);

    for (token, row) in tokens.iter_mut().zip(scores.chunks_exact(vocab_size)) {
        let (best, _) = row
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |(best, best_score), (i, &score)| {
                if score > best_score {
                    (i, score)
                } else {
                    (best, best_score)
                }
            });
        *token = best as i32;
    }
}

/// Replace the tokens of finished rows with `pad_token_id` and add the
/// score of every other row's token to its running total.
pub fn accept_tokens(
    scores: &[f32],
    vocab_size: usize,
    tokens: &mut [i32],
    eos_met: &[i32],
    sequence_scores: &mut [f32],
    pad_token_id: i32,
) {
    for (row, token) in tokens.iter_mut().enumerate() {
        if eos_met[row] != 0 {
            *token = pad_token_id;
        } else {
            sequence_scores[row] += scores[row * vocab_size + *token as usize];
        }
    }
}

/// Source of the end-of-sequence state read by [`Kernel::CheckEos`].
pub enum EosSource {
    /// A row finishes when its selected token is `eos_token_id`.
    Tokens {
        tokens: Buffer<i32>,
        eos_token_id: i32,
    },

    /// A row finishes when the scorer has finished its batch entry.
    BeamGroups {
        scorer: Rc<RefCell<BeamScorer>>,
        num_beams: usize,
    },
}

/// Work that can be launched on an execution queue.
pub enum Kernel {
    /// Add one to every element of an integer buffer.
    Increment(AnyBuffer),

    /// Grow a `(rows, width - 1)` attention mask in `src` into the
    /// `(rows, width)` mask `dst`.
    ExtendAttentionMask {
        src: AnyBuffer,
        dst: AnyBuffer,
        rows: usize,
        width: usize,
    },

    /// Per-row arg-max of a `(rows, vocab_size)` score buffer.
    ArgMax {
        scores: Buffer<f32>,
        vocab_size: usize,
        tokens: Buffer<i32>,
    },

    /// Two-stage top-k selection of beam candidates.
    BeamTopK {
        scores: Buffer<f32>,
        workspace: Rc<RefCell<TopKWorkspace>>,
    },

    /// Greedy post-selection. See [`accept_tokens`].
    AcceptTokens {
        scores: Buffer<f32>,
        vocab_size: usize,
        tokens: Buffer<i32>,
        eos_met: Buffer<i32>,
        sequence_scores: Buffer<f32>,
        pad_token_id: i32,
    },

    /// Write `tokens` into the next column of every row of `sequences`.
    AppendTokens {
        tokens: Buffer<i32>,
        sequences: Rc<RefCell<Sequences>>,
    },

    /// Feed the candidates in `workspace` to the beam scorer and write the
    /// token, parent row and cumulative score of every continuing beam.
    BeamScore {
        workspace: Rc<RefCell<TopKWorkspace>>,
        scorer: Rc<RefCell<BeamScorer>>,
        sequences: Rc<RefCell<Sequences>>,
        tokens: Buffer<i32>,
        parents: Buffer<i32>,
        beam_scores: Buffer<f32>,
    },

    /// Replace each row of `sequences` with the history of `parents[row]`,
    /// then append `tokens[row]`.
    AppendReordered {
        parents: Buffer<i32>,
        tokens: Buffer<i32>,
        sequences: Rc<RefCell<Sequences>>,
    },

    /// Update the per-row end-of-sequence flags in `eos_met` from `source`
    /// and write the done flag. Without a source the flags are unchanged.
    CheckEos {
        source: Option<EosSource>,
        eos_met: Buffer<i32>,
        done: Buffer<i32>,

        /// True if the sequences have reached their maximum length.
        full: bool,
    },
}

impl Kernel {
    pub fn name(&self) -> &'static str {
        match self {
            Kernel::Increment(_) => "increment",
            Kernel::ExtendAttentionMask { .. } => "extend_attention_mask",
            Kernel::ArgMax { .. } => "argmax",
            Kernel::BeamTopK { .. } => "beam_top_k",
            Kernel::AcceptTokens { .. } => "accept_tokens",
            Kernel::AppendTokens { .. } => "append_tokens",
            Kernel::BeamScore { .. } => "beam_score",
            Kernel::AppendReordered { .. } => "append_reordered",
            Kernel::CheckEos { .. } => "check_eos",
        }
    }

    /// Run the kernel using its host implementation.
    pub(crate) fn execute(&self) -> Result<(), DeviceError> {
        let invalid = |reason: String| DeviceError::InvalidArgument {
            kernel: self.name(),
            reason,
        };

        match self {
            Kernel::Increment(buf) => match buf {
                AnyBuffer::Int32(b) => increment(&mut *b.device_data_mut()),
                AnyBuffer::Int64(b) => increment(&mut *b.device_data_mut()),
                AnyBuffer::Float(_) => return Err(invalid("expected an integer buffer".into())),
            },
            Kernel::ExtendAttentionMask {
                src,
                dst,
                rows,
                width,
            } => {
                let (rows, width) = (*rows, *width);
                if width < 2 || src.len() != rows * (width - 1) || dst.len() != rows * width {
                    return Err(invalid(format!(
                        "cannot grow {} elements into {} with {} rows of width {}",
                        src.len(),
                        dst.len(),
                        rows,
                        width
                    )));
                }
                match (src, dst) {
                    (AnyBuffer::Int32(s), AnyBuffer::Int32(d)) => extend_attention_mask(
                        &mut d.device_data_mut(),
                        &s.device_data(),
                        rows,
                        width,
                    ),
                    (AnyBuffer::Int64(s), AnyBuffer::Int64(d)) => extend_attention_mask(
                        &mut d.device_data_mut(),
                        &s.device_data(),
                        rows,
                        width,
                    ),
                    _ => return Err(invalid("mask buffers must have the same integer type".into())),
                }
            }
            Kernel::ArgMax {
                scores,
                vocab_size,
                tokens,
            } => {
                if scores.len() != tokens.len() * vocab_size {
                    return Err(invalid(format!(
                        "{} scores do not form {} rows of {}",
                        scores.len(),
                        tokens.len(),
                        vocab_size
                    )));
                }
                argmax_rows(&scores.device_data(), *vocab_size, &mut tokens.device_data_mut());
            }
            Kernel::BeamTopK { scores, workspace } => {
                let mut workspace = workspace.borrow_mut();
                let shape = *workspace.shape();
                if scores.len() != shape.rows() * shape.vocab_size {
                    return Err(invalid(format!(
                        "{} scores do not match {:?}",
                        scores.len(),
                        shape
                    )));
                }
                workspace.run(&scores.device_data());
            }
            Kernel::AcceptTokens {
                scores,
                vocab_size,
                tokens,
                eos_met,
                sequence_scores,
                pad_token_id,
            } => {
                let rows = tokens.len();
                if scores.len() != rows * vocab_size
                    || eos_met.len() != rows
                    || sequence_scores.len() != rows
                {
                    return Err(invalid(format!("buffers do not all have {} rows", rows)));
                }
                let mut tokens = tokens.device_data_mut();
                if tokens.iter().any(|&t| t < 0 || t as usize >= *vocab_size) {
                    return Err(invalid("token id outside the vocabulary".into()));
                }
                accept_tokens(
                    &scores.device_data(),
                    *vocab_size,
                    &mut tokens,
                    &eos_met.device_data(),
                    &mut sequence_scores.device_data_mut(),
                    *pad_token_id,
                );
            }
            Kernel::AppendTokens { tokens, sequences } => {
                let mut sequences = sequences.borrow_mut();
                check_append(&sequences, tokens.len()).map_err(invalid)?;
                sequences.append_next_tokens(&tokens.device_data());
            }
            Kernel::BeamScore {
                workspace,
                scorer,
                sequences,
                tokens,
                parents,
                beam_scores,
            } => {
                let rows = sequences.borrow().batch_beam_size();
                if tokens.len() != rows || parents.len() != rows || beam_scores.len() != rows {
                    return Err(invalid(format!("output buffers do not have {} rows", rows)));
                }
                let mut scorer = scorer.borrow_mut();
                scorer.process(&sequences.borrow(), workspace.borrow().output());
                tokens.device_data_mut().copy_from_slice(scorer.next_tokens());
                beam_scores.device_data_mut().copy_from_slice(scorer.next_scores());
                let mut parents = parents.device_data_mut();
                for (dst, &src) in parents.iter_mut().zip(scorer.next_indices()) {
                    *dst = src as i32;
                }
            }
            Kernel::AppendReordered {
                parents,
                tokens,
                sequences,
            } => {
                let mut sequences = sequences.borrow_mut();
                check_append(&sequences, tokens.len()).map_err(invalid)?;
                let rows = sequences.batch_beam_size();
                let parents: Vec<usize> =
                    parents.device_data().iter().map(|&p| p as usize).collect();
                if parents.len() != rows || parents.iter().any(|&p| p >= rows) {
                    return Err(invalid(format!("expected {} parent rows below {}", rows, rows)));
                }
                sequences.append_reordered(&parents, &tokens.device_data());
            }
            Kernel::CheckEos {
                source,
                eos_met,
                done,
                full,
            } => {
                if done.len() != 1 {
                    return Err(invalid("done flag must have one element".into()));
                }
                let mut eos_met = eos_met.device_data_mut();
                match source {
                    Some(EosSource::Tokens {
                        tokens,
                        eos_token_id,
                    }) => {
                        if tokens.len() != eos_met.len() {
                            return Err(invalid("one token per row is required".into()));
                        }
                        let tokens = tokens.device_data();
                        for (met, &token) in eos_met.iter_mut().zip(tokens.iter()) {
                            if token == *eos_token_id {
                                *met = 1;
                            }
                        }
                    }
                    Some(EosSource::BeamGroups { scorer, num_beams }) => {
                        let scorer = scorer.borrow();
                        for (row, met) in eos_met.iter_mut().enumerate() {
                            *met = scorer.group_done(row / num_beams) as i32;
                        }
                    }
                    None => {}
                }
                let all_met = eos_met.iter().all(|&met| met != 0);
                done.device_data_mut()[0] = (*full || all_met) as i32;
            }
        }
        Ok(())
    }
}

/// Check that one token per row can be appended to `sequences`.
fn check_append(sequences: &Sequences, tokens: usize) -> Result<(), String> {
    if tokens != sequences.batch_beam_size() {
        return Err(format!(
            "{} tokens for {} rows",
            tokens,
            sequences.batch_beam_size()
        ));
    }
    if sequences.is_full() {
        return Err("sequences are full".into());
    }
    Ok(())
}
