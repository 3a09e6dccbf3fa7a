use std::cell::{Ref, RefCell};
use std::rc::Rc;

use log::debug;

use super::{BeamScorer, Search, SearchState, NEXT_TOKENS, SCORES};
use crate::buffer::{AllocatorExt, Buffer};
use crate::error::{DeviceResultExt, GenerateError};
use crate::kernels::{EosSource, Kernel};
use crate::params::SearchParams;
use crate::processors::LogitsProcessor;
use crate::sequences::Sequences;
use crate::topk::{TopKShape, TopKWorkspace};

/// Initial score of every beam but the first, so that the first step picks
/// all of its candidates from one copy of the prompt.
const INACTIVE_BEAM_SCORE: f32 = -1e9;

const NEXT_INDICES: &str = "next_indices";

/// Replace `row` with its log-softmax.
fn log_softmax(row: &mut [f32]) {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = row.iter().map(|x| (x - max).exp()).sum();
    let log_sum = max + sum.ln();
    for x in row {
        *x -= log_sum;
    }
}

/// Keeps the `num_beams` most likely sequences of each batch entry.
///
/// Each step the candidates are the extensions of every alive beam by every
/// token, scored by cumulative log probability. The best `2 * num_beams` of
/// them are passed to a [`BeamScorer`] which decides which beams finish and
/// which continue.
pub struct BeamSearch {
    state: SearchState,

    workspace: Rc<RefCell<TopKWorkspace>>,
    scorer: Rc<RefCell<BeamScorer>>,

    /// Row that each selected token extends. Written by the scorer.
    parent_buf: Buffer<i32>,

    /// Cumulative log probability of each alive beam. Written by the scorer.
    beam_score_buf: Buffer<f32>,

    // Host copies of the scorer outputs, refreshed by `is_done`.
    next_indices: Vec<usize>,
    beam_scores: Vec<f32>,
}

impl BeamSearch {
    pub fn new(params: &SearchParams) -> Result<BeamSearch, GenerateError> {
        let state = SearchState::new(params)?;
        let num_beams = params.num_beams();
        let rows = state.batch_beam_size();

        let beam_scores: Vec<f32> = (0..rows)
            .map(|row| {
                if row % num_beams == 0 {
                    0.
                } else {
                    INACTIVE_BEAM_SCORE
                }
            })
            .collect();
        let beam_score_buf = state.ctx.pinned.alloc_from(&beam_scores).for_tensor(SCORES)?;
        let parent_buf = state.ctx.pinned.alloc::<i32>(rows).for_tensor(NEXT_INDICES)?;

        let shape = TopKShape::for_beams(params.batch_size, num_beams, params.vocab_size);
        debug!(
            "beam search with {} beams, top-k over {} shards of {}",
            num_beams,
            shape.shards(),
            shape.shard_size
        );

        Ok(BeamSearch {
            state,
            workspace: Rc::new(RefCell::new(TopKWorkspace::new(shape))),
            scorer: Rc::new(RefCell::new(BeamScorer::new(params.batch_size, &params.search))),
            parent_buf,
            beam_score_buf,
            next_indices: vec![0; rows],
            beam_scores,
        })
    }

    /// Cumulative log probability of each alive beam.
    pub fn beam_scores(&self) -> &[f32] {
        &self.beam_scores
    }

    pub fn scorer(&self) -> Ref<'_, BeamScorer> {
        self.scorer.borrow()
    }
}

impl Search for BeamSearch {
    fn set_logits(&mut self, logits: &[f32]) -> Result<(), GenerateError> {
        self.state
            .set_scores(logits, |_row, src, dst| dst.copy_from_slice(src))
    }

    fn apply_processor(&mut self, processor: &dyn LogitsProcessor) -> Result<(), GenerateError> {
        self.state.apply_processor(processor)
    }

    fn select_next_tokens(&mut self) -> Result<(), GenerateError> {
        let state = &mut self.state;
        {
            let mut scores = state.scores.host_mut().for_tensor(SCORES)?;
            for (row, beam_score) in scores
                .chunks_exact_mut(state.vocab_size)
                .zip(&self.beam_scores)
            {
                log_softmax(row);
                for x in row {
                    *x += beam_score;
                }
            }
        }

        state.launch(
            Kernel::BeamTopK {
                scores: state.scores.clone(),
                workspace: self.workspace.clone(),
            },
            SCORES,
        )?;
        state.launch(
            Kernel::BeamScore {
                workspace: self.workspace.clone(),
                scorer: self.scorer.clone(),
                sequences: state.sequences.clone(),
                tokens: state.token_buf.clone(),
                parents: self.parent_buf.clone(),
                beam_scores: self.beam_score_buf.clone(),
            },
            NEXT_TOKENS,
        )?;
        state.selected = true;
        Ok(())
    }

    fn append_next_tokens_to_sequences(&mut self) -> Result<(), GenerateError> {
        let kernel = Kernel::AppendReordered {
            parents: self.parent_buf.clone(),
            tokens: self.state.token_buf.clone(),
            sequences: self.state.sequences.clone(),
        };
        self.state.append(kernel)
    }

    fn check_for_eos(&mut self) -> Result<(), GenerateError> {
        self.state.check_for_eos(EosSource::BeamGroups {
            scorer: self.scorer.clone(),
            num_beams: self.state.num_beams,
        })
    }

    fn next_tokens(&self) -> &[i32] {
        &self.state.next_tokens
    }

    fn next_indices(&self) -> Option<&[usize]> {
        Some(&self.next_indices)
    }

    fn is_done(&mut self) -> Result<bool, GenerateError> {
        let done = self.state.is_done()?;

        let parents = self.parent_buf.host().for_tensor(NEXT_INDICES)?;
        for (dst, &src) in self.next_indices.iter_mut().zip(parents.iter()) {
            *dst = src as usize;
        }
        self.beam_scores.copy_from_slice(&self.beam_score_buf.host().for_tensor(SCORES)?);
        Ok(done)
    }

    fn sequence_length(&self) -> usize {
        self.state.sequence_length
    }

    fn scores(&self, row: usize) -> Ref<'_, [f32]> {
        self.state.row_scores(row)
    }

    fn sequences(&self) -> Ref<'_, Sequences> {
        self.state.sequences.borrow()
    }

    fn eos_met(&self) -> &[bool] {
        &self.state.eos_met
    }

    fn finalize(
        &mut self,
        num_return_sequences: usize,
        output: &mut [i32],
        scores: &mut [f32],
    ) -> Result<(), GenerateError> {
        self.state
            .check_output(self.state.num_beams, num_return_sequences, output, scores)?;
        self.scorer.borrow_mut().finalize(
            &self.state.sequences.borrow(),
            &self.beam_scores,
            num_return_sequences,
            output,
            scores,
        );
        Ok(())
    }
}
