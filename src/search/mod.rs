//! Strategies for selecting the next token of every row.
//!
//! A [`Search`] owns the token history and end-of-sequence state of a
//! generation. Each step the caller passes in the model's scores and drives
//! the search through its state machine:
//!
//! ```text
//! set_logits -> apply_processor* -> select_next_tokens
//!     -> append_next_tokens_to_sequences -> check_for_eos -> is_done
//! ```
//!
//! Selection, appending and the end-of-sequence check are kernels. On
//! accelerated devices they are submitted to the queue and write into
//! memory the host reads only once `is_done` has synchronized, so a step
//! blocks exactly once. On the CPU they run inline.
//!
//! Once `is_done` returns true only [`Search::finalize`] and the accessors
//! may be used.

use std::cell::{Ref, RefCell};
use std::rc::Rc;

use log::trace;

use crate::buffer::{AllocatorExt, Buffer};
use crate::config::ConfigError;
use crate::device::{Command, DeviceContext};
use crate::error::{DeviceResultExt, GenerateError};
use crate::kernels::{EosSource, Kernel};
use crate::params::SearchParams;
use crate::processors::LogitsProcessor;
use crate::sequences::Sequences;

mod beam;
mod beam_scorer;
mod greedy;

pub use beam::BeamSearch;
pub use beam_scorer::{BeamHypotheses, BeamScorer, Hypothesis};
pub use greedy::GreedySearch;

pub(crate) const SCORES: &str = "scores";
pub(crate) const NEXT_TOKENS: &str = "next_tokens";
pub(crate) const SEQUENCES: &str = "sequences";
pub(crate) const EOS_MET: &str = "eos_met";

/// Token selection strategy used by a [`Generator`](crate::Generator).
pub trait Search {
    /// Record the scores for this step. `logits` has shape `(batch_beam,
    /// vocab)`.
    fn set_logits(&mut self, logits: &[f32]) -> Result<(), GenerateError>;

    /// Run `processor` over the recorded scores.
    fn apply_processor(&mut self, processor: &dyn LogitsProcessor) -> Result<(), GenerateError>;

    /// Choose the next token of every row from the scores.
    fn select_next_tokens(&mut self) -> Result<(), GenerateError>;

    /// Append the selected tokens to the sequences. This can be done once
    /// per selection.
    fn append_next_tokens_to_sequences(&mut self) -> Result<(), GenerateError>;

    /// Update the end-of-sequence state of every row and the done flag.
    fn check_for_eos(&mut self) -> Result<(), GenerateError>;

    /// Tokens selected by the last step, as of the last call to `is_done`.
    fn next_tokens(&self) -> &[i32];

    /// For beam search, the row whose history each selected token extends.
    ///
    /// Callers that keep per-row state, such as a key-value cache, must
    /// reorder it the same way.
    fn next_indices(&self) -> Option<&[usize]> {
        None
    }

    /// Wait for queued device work and return true if generation is
    /// finished.
    ///
    /// This is the only point at which a step waits for the device. The
    /// step's results become visible through the accessors afterwards.
    fn is_done(&mut self) -> Result<bool, GenerateError>;

    /// Length of every row, including the prompt.
    fn sequence_length(&self) -> usize;

    /// Scores of `row` for the current step.
    fn scores(&self, row: usize) -> Ref<'_, [f32]>;

    fn sequences(&self) -> Ref<'_, Sequences>;

    /// Whether each row has finished, as of the last call to `is_done`.
    fn eos_met(&self) -> &[bool];

    /// Write the best `num_return_sequences` sequences of each batch entry
    /// into `output`, with shape `(batch, num_return_sequences,
    /// max_length)` and padded with the pad token, and their scores into
    /// `scores` with shape `(batch, num_return_sequences)`.
    fn finalize(
        &mut self,
        num_return_sequences: usize,
        output: &mut [i32],
        scores: &mut [f32],
    ) -> Result<(), GenerateError>;
}

/// State shared by the search strategies.
pub(crate) struct SearchState {
    pub ctx: DeviceContext,
    pub batch_size: usize,
    pub num_beams: usize,
    pub vocab_size: usize,
    pub pad_token_id: i32,
    pub eos_token_id: i32,

    /// Token history, in pinned memory. Kernels append to it.
    pub sequences: Rc<RefCell<Sequences>>,

    /// Length of the sequences once all submitted appends have run.
    pub sequence_length: usize,
    pub max_length: usize,

    /// `(batch_beam, vocab)` scores. This is in pinned memory so selection
    /// kernels can read it.
    pub scores: Buffer<f32>,

    /// Selected token of each row.
    pub token_buf: Buffer<i32>,

    /// End-of-sequence flag of each row, 1 once the row has finished.
    pub eos_buf: Buffer<i32>,

    /// Single element done flag.
    pub done_buf: Buffer<i32>,

    // Host copies of the kernel outputs, refreshed by `is_done`.
    pub next_tokens: Vec<i32>,
    pub eos_met: Vec<bool>,
    pub done: bool,

    /// True once tokens have been selected for the current step.
    pub selected: bool,

    /// True once the selected tokens have been appended.
    pub appended: bool,
}

impl SearchState {
    pub fn new(params: &SearchParams) -> Result<SearchState, GenerateError> {
        params.validate()?;

        let ctx = params.context.clone();
        let batch_beam_size = params.batch_beam_size();
        let scores = ctx
            .pinned
            .alloc::<f32>(batch_beam_size * params.vocab_size)
            .for_tensor(SCORES)?;
        let next_tokens = vec![params.search.pad_token_id; batch_beam_size];
        let token_buf = ctx.pinned.alloc_from(&next_tokens).for_tensor(NEXT_TOKENS)?;
        let eos_buf = ctx.pinned.alloc::<i32>(batch_beam_size).for_tensor(EOS_MET)?;

        let sequences = Sequences::new(
            &params.input_ids,
            params.batch_size,
            params.num_beams(),
            params.search.max_length,
        );
        let done = sequences.is_full();
        let done_buf = ctx.pinned.alloc_from(&[done as i32]).for_tensor(EOS_MET)?;

        Ok(SearchState {
            ctx,
            batch_size: params.batch_size,
            num_beams: params.num_beams(),
            vocab_size: params.vocab_size,
            pad_token_id: params.search.pad_token_id,
            eos_token_id: params.search.eos_token_id,
            sequence_length: sequences.sequence_length(),
            max_length: sequences.max_length(),
            sequences: Rc::new(RefCell::new(sequences)),
            scores,
            token_buf,
            eos_buf,
            done_buf,
            next_tokens,
            eos_met: vec![false; batch_beam_size],
            done,
            selected: false,
            appended: false,
        })
    }

    pub fn batch_beam_size(&self) -> usize {
        self.batch_size * self.num_beams
    }

    /// Submit `kernel` on accelerated devices, or run it inline on the CPU.
    pub fn launch(&self, kernel: Kernel, tensor: &'static str) -> Result<(), GenerateError> {
        if self.ctx.device().is_accelerated() {
            self.ctx.queue.submit(Command::Launch(kernel)).for_tensor(tensor)
        } else {
            kernel.execute().for_tensor(tensor)
        }
    }

    pub fn set_scores(
        &mut self,
        logits: &[f32],
        f: impl Fn(usize, &[f32], &mut [f32]),
    ) -> Result<(), GenerateError> {
        assert_eq!(
            logits.len(),
            self.batch_beam_size() * self.vocab_size,
            "logits do not have shape (batch_beam, vocab)"
        );
        let mut scores = self.scores.host_mut().for_tensor(SCORES)?;
        for (row, (dst, src)) in scores
            .chunks_exact_mut(self.vocab_size)
            .zip(logits.chunks_exact(self.vocab_size))
            .enumerate()
        {
            f(row, src, dst);
        }
        self.selected = false;
        self.appended = false;
        Ok(())
    }

    pub fn apply_processor(
        &mut self,
        processor: &dyn LogitsProcessor,
    ) -> Result<(), GenerateError> {
        let mut scores = self.scores.host_mut().for_tensor(SCORES)?;
        processor.process(&mut scores, self.vocab_size, &self.sequences.borrow());
        Ok(())
    }

    pub fn row_scores(&self, row: usize) -> Ref<'_, [f32]> {
        let vocab_size = self.vocab_size;
        Ref::map(self.scores.device_data(), |s| {
            &s[row * vocab_size..(row + 1) * vocab_size]
        })
    }

    /// Launch `kernel`, which appends the selected tokens.
    ///
    /// Fails if there is no room left, if no tokens have been selected or
    /// if they have already been appended.
    pub fn append(&mut self, kernel: Kernel) -> Result<(), GenerateError> {
        if self.sequence_length == self.max_length {
            return Err(GenerateError::MaxLengthReached(self.max_length));
        }
        if !self.selected {
            return Err(GenerateError::InvalidState(
                "tokens must be selected before they are appended",
            ));
        }
        if self.appended {
            return Err(GenerateError::InvalidState(
                "the selected tokens have already been appended",
            ));
        }
        self.launch(kernel, SEQUENCES)?;
        self.sequence_length += 1;
        self.appended = true;
        Ok(())
    }

    /// Launch the end-of-sequence check. A row with no token selected this
    /// step keeps its previous state.
    pub fn check_for_eos(&self, source: EosSource) -> Result<(), GenerateError> {
        self.launch(
            Kernel::CheckEos {
                source: self.selected.then_some(source),
                eos_met: self.eos_buf.clone(),
                done: self.done_buf.clone(),
                full: self.sequence_length == self.max_length,
            },
            EOS_MET,
        )
    }

    /// Wait for the queue, then copy the step's results to the host.
    pub fn is_done(&mut self) -> Result<bool, GenerateError> {
        self.ctx.queue.synchronize().for_tensor(NEXT_TOKENS)?;

        self.next_tokens.copy_from_slice(&self.token_buf.host().for_tensor(NEXT_TOKENS)?);
        let eos_buf = self.eos_buf.host().for_tensor(EOS_MET)?;
        for (met, &flag) in self.eos_met.iter_mut().zip(eos_buf.iter()) {
            *met = flag != 0;
        }
        self.done = self.done_buf.host().for_tensor(EOS_MET)?[0] != 0;

        trace!("step tokens {:?} done {}", self.next_tokens, self.done);
        Ok(self.done)
    }

    /// Check the shape of caller-provided finalization buffers.
    pub fn check_output(
        &self,
        max_return: usize,
        num_return_sequences: usize,
        output: &[i32],
        scores: &[f32],
    ) -> Result<(), GenerateError> {
        if num_return_sequences == 0 || num_return_sequences > max_return {
            return Err(ConfigError::InvalidValue {
                field: "num_return_sequences",
                reason: format!(
                    "must be between 1 and {}, got {}",
                    max_return, num_return_sequences
                ),
            }
            .into());
        }
        let groups = self.batch_size * num_return_sequences;
        assert_eq!(
            output.len(),
            groups * self.max_length,
            "output does not have shape (batch, num_return_sequences, max_length)"
        );
        assert_eq!(
            scores.len(),
            groups,
            "scores do not have shape (batch, num_return_sequences)"
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use crate::config::SearchConfig;
    use crate::device::{Device, DeviceContext};
    use crate::params::SearchParams;

    /// Build parameters for a search over `vocab_size` tokens.
    pub fn params(
        device: Device,
        input_ids: Vec<i32>,
        batch_size: usize,
        vocab_size: usize,
        search: SearchConfig,
    ) -> SearchParams {
        let ctx = DeviceContext::emulated(device).0;
        SearchParams::new(input_ids, batch_size, vocab_size, search, ctx)
    }

    /// Return log probabilities for a row which make `order[0]` the most
    /// likely token, then `order[1]`, etc.
    pub fn ranked_logits(vocab_size: usize, order: &[usize]) -> Vec<f32> {
        let mut logits = vec![-10.0; vocab_size];
        for (rank, &token) in order.iter().enumerate() {
            logits[token] = -(rank as f32);
        }
        logits
    }
}

#[cfg(test)]
mod tests {
    use rten_testing::{random_scores, TestCases};

    use super::{BeamSearch, GreedySearch, Search};
    use crate::config::SearchConfig;
    use crate::device::{Device, DeviceContext};
    use crate::params::SearchParams;

    #[test]
    fn test_one_synchronization_per_step() {
        #[derive(Debug)]
        struct Case {
            device: Device,
            num_beams: usize,
        }

        let cases = [
            Case {
                device: Device::Cuda,
                num_beams: 1,
            },
            Case {
                device: Device::Cuda,
                num_beams: 2,
            },
            Case {
                device: Device::Dml,
                num_beams: 1,
            },
            Case {
                device: Device::Dml,
                num_beams: 3,
            },
        ];

        cases.test_each(|case| {
            let config = SearchConfig {
                num_beams: case.num_beams,
                max_length: 6,
                eos_token_id: 3,
                ..Default::default()
            };
            let vocab_size = 8;
            let (ctx, queue) = DeviceContext::emulated(case.device);
            let p = SearchParams::new(vec![1, 2], 1, vocab_size, config, ctx);
            let mut search: Box<dyn Search> = if case.num_beams > 1 {
                Box::new(BeamSearch::new(&p).unwrap())
            } else {
                Box::new(GreedySearch::new(&p).unwrap())
            };

            let mut rng = fastrand::Rng::with_seed(7);
            let mut steps = 0;
            loop {
                let logits = random_scores(&mut rng, case.num_beams * vocab_size, 2.0);
                search.set_logits(&logits).unwrap();
                search.select_next_tokens().unwrap();
                search.append_next_tokens_to_sequences().unwrap();
                search.check_for_eos().unwrap();

                // All of the step's work is queued and nothing has waited.
                assert_eq!(queue.synchronizations(), steps);
                assert_eq!(queue.pending(), 4);

                steps += 1;
                let done = search.is_done().unwrap();
                assert_eq!(queue.synchronizations(), steps);
                if done {
                    break;
                }
            }
            assert!((1..=4).contains(&steps));
        })
    }
}
