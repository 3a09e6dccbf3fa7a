//! The decoding loop.

use log::debug;
use rten_tensor::prelude::*;
use rten_tensor::NdTensor;

use crate::buffer::{AllocatorExt, DeviceTensor};
use crate::config::Config;
use crate::device::{Command, DeviceContext, DeviceError};
use crate::error::{DeviceResultExt, GenerateError};
use crate::metrics::Metrics;
use crate::model::{Model, ModelInputs};
use crate::params::SearchParams;
use crate::position_inputs::PositionInputs;
use crate::processors::{LogitsProcessor, MinLength, RepetitionPenalty};
use crate::search::{BeamSearch, GreedySearch, Search};

const INPUT_IDS: &str = "input_ids";

/// Copy `tokens` into a new `shape` tensor in device memory.
fn upload_tokens(
    ctx: &DeviceContext,
    tokens: &[i32],
    shape: &[usize],
) -> Result<DeviceTensor<i32>, DeviceError> {
    let tensor = ctx.device.alloc_tensor::<i32>(shape)?;
    if tensor.location().is_host_accessible() {
        tensor.buffer().host_mut()?.copy_from_slice(tokens);
    } else {
        let staging = ctx.pinned.alloc_from(tokens)?;
        ctx.queue.submit(Command::Copy {
            src: staging.into(),
            dst: tensor.buffer().clone().into(),
        })?;
    }
    Ok(tensor)
}

/// Sequences and scores produced by [`Generator::finalize`].
#[derive(Clone, Debug)]
pub struct GenerationOutput {
    /// `(batch, num_return_sequences, max_length)` token ids, padded with
    /// the pad token.
    pub sequences: NdTensor<i32, 3>,

    /// `(batch, num_return_sequences)` scores, best first within each batch
    /// entry.
    pub scores: NdTensor<f32, 2>,
}

/// Generates token sequences from a decoder model.
///
/// Each step runs the model, selects one token per row with greedy or beam
/// search, and prepares the model inputs for the next step. A `Generator`
/// is an iterator over the tokens selected at each step. Once iteration
/// ends the results are collected with [`finalize`](Self::finalize).
///
/// ```text
/// let mut generator = Generator::new(&model, &config, params)?;
/// for tokens in generator.by_ref() {
///     let tokens = tokens?;
///     // Reorder any per-row model state using `generator.next_indices()`.
/// }
/// let output = generator.finalize()?;
/// ```
pub struct Generator<'a> {
    model: &'a dyn Model,
    ctx: DeviceContext,

    inputs: ModelInputs,
    input_ids_index: usize,

    /// Number of tokens per row in the current `input_ids`.
    input_length: usize,

    position_inputs: PositionInputs,
    search: Box<dyn Search>,
    processors: Vec<Box<dyn LogitsProcessor>>,

    batch_size: usize,
    vocab_size: usize,
    num_return_sequences: usize,
    done: bool,
}

impl<'a> Generator<'a> {
    /// Prepare to generate from the prompts in `params`.
    ///
    /// The search settings are taken from `params.search`. Input names and
    /// graph capture settings are taken from `config`.
    pub fn new(
        model: &'a dyn Model,
        config: &Config,
        params: SearchParams,
    ) -> Result<Generator<'a>, GenerateError> {
        config.validate()?;
        params.validate()?;

        let ctx = params.context.clone();
        let num_beams = params.num_beams();
        let batch_beam_size = params.batch_beam_size();
        let prompt_length = params.sequence_length;

        let mut inputs = ModelInputs::new();
        let input_ids: Vec<i32> = params
            .input_ids
            .chunks_exact(prompt_length)
            .flat_map(|prompt| std::iter::repeat(prompt).take(num_beams).flatten())
            .copied()
            .collect();
        let input_ids = upload_tokens(&ctx, &input_ids, &[batch_beam_size, prompt_length])
            .for_tensor(INPUT_IDS)?;
        let input_ids_index = inputs.push(&config.inputs.input_ids, input_ids.into());

        let mut position_inputs =
            PositionInputs::new(model, &config.inputs, &params, &config.graph_capture)?;
        position_inputs.add(&mut inputs);

        let search: Box<dyn Search> = if params.search.is_beam_search() {
            Box::new(BeamSearch::new(&params)?)
        } else {
            Box::new(GreedySearch::new(&params)?)
        };

        let mut processors: Vec<Box<dyn LogitsProcessor>> = Vec::new();
        if params.search.min_length > 0 {
            processors.push(Box::new(MinLength {
                min_length: params.search.min_length,
                eos_token_id: params.search.eos_token_id,
            }));
        }
        if params.search.repetition_penalty != 1.0 {
            processors.push(Box::new(RepetitionPenalty {
                penalty: params.search.repetition_penalty,
            }));
        }

        debug!(
            "generating on {} with {} search, batch {} x {} beams, {} processors",
            ctx.device(),
            if num_beams > 1 { "beam" } else { "greedy" },
            params.batch_size,
            num_beams,
            processors.len()
        );

        let done = search.sequences().is_full();
        Ok(Generator {
            model,
            ctx,
            inputs,
            input_ids_index,
            input_length: prompt_length,
            position_inputs,
            search,
            processors,
            batch_size: params.batch_size,
            vocab_size: params.vocab_size,
            num_return_sequences: params.search.num_return_sequences,
            done,
        })
    }

    /// Run one decoding step.
    ///
    /// Returns the token selected for each row, or `None` if generation has
    /// finished.
    pub fn step(&mut self) -> Result<Option<Vec<i32>>, GenerateError> {
        if self.done {
            return Ok(None);
        }

        let logits = self
            .model
            .run(&self.inputs, &*self.ctx.queue)
            .map_err(GenerateError::Model)?;
        let batch_beam_size = self.search.sequences().batch_beam_size();
        let expected = [batch_beam_size, self.input_length, self.vocab_size];
        if logits.shape() != expected {
            return Err(GenerateError::LogitsShape {
                expected,
                actual: logits.shape(),
            });
        }

        // Only the scores for the last position predict the next token.
        let last_logits = logits.slice((.., -1)).to_vec();

        let search = &mut self.search;
        search.set_logits(&last_logits)?;
        for processor in &self.processors {
            search.apply_processor(processor.as_ref())?;
        }
        search.select_next_tokens()?;
        search.append_next_tokens_to_sequences()?;
        self.position_inputs
            .update(&mut self.inputs, search.sequence_length())?;
        search.check_for_eos()?;
        self.done = search.is_done()?;

        let tokens = search.next_tokens().to_vec();
        if !self.done {
            let input_ids = upload_tokens(&self.ctx, &tokens, &[batch_beam_size, 1])
                .for_tensor(INPUT_IDS)?;
            self.inputs.set(self.input_ids_index, input_ids.into());
            self.input_length = 1;
        }
        Ok(Some(tokens))
    }

    /// Run until generation finishes and return the results.
    pub fn generate(mut self) -> Result<GenerationOutput, GenerateError> {
        while self.step()?.is_some() {}
        self.finalize()
    }

    /// Collect the best sequences of each batch entry.
    ///
    /// This can be called before generation has finished, in which case the
    /// sequences are those generated so far.
    pub fn finalize(&mut self) -> Result<GenerationOutput, GenerateError> {
        let n = self.num_return_sequences;
        let max_length = self.search.sequences().max_length();
        let mut sequences = vec![0; self.batch_size * n * max_length];
        let mut scores = vec![0.; self.batch_size * n];
        self.search.finalize(n, &mut sequences, &mut scores)?;
        Ok(GenerationOutput {
            sequences: NdTensor::from_data([self.batch_size, n, max_length], sequences),
            scores: NdTensor::from_data([self.batch_size, n], scores),
        })
    }

    /// For beam search, the row each of the last step's tokens extends.
    ///
    /// Per-row model state, such as a key-value cache, must be gathered in
    /// this order before the next step.
    pub fn next_indices(&self) -> Option<&[usize]> {
        self.search.next_indices()
    }

    pub fn search(&self) -> &dyn Search {
        self.search.as_ref()
    }

    pub fn position_inputs(&self) -> &PositionInputs {
        &self.position_inputs
    }

    /// Inputs that will be passed to the model on the next step.
    pub fn inputs(&self) -> &ModelInputs {
        &self.inputs
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

/// Output items from a [`Generator`].
pub type GeneratorItem = Result<Vec<i32>, GenerateError>;

impl Iterator for Generator<'_> {
    type Item = GeneratorItem;

    /// Run one step. Iteration ends when generation finishes or after the
    /// first error.
    fn next(&mut self) -> Option<Self::Item> {
        let result = self.step();
        if result.is_err() {
            self.done = true;
        }
        result.transpose()
    }
}

/// Iterator utilities for a [`Generator`].
pub trait GeneratorUtils: Iterator<Item = GeneratorItem> + Sized {
    /// Record step timings into `metrics`.
    fn profile(self, metrics: &mut Metrics) -> impl Iterator<Item = Self::Item> {
        Profiler::wrap(self, metrics)
    }
}

impl<I: Iterator<Item = GeneratorItem>> GeneratorUtils for I {}

struct Profiler<'a, G: Iterator> {
    generator: G,
    metrics: &'a mut Metrics,
}

impl<'a, G: Iterator> Profiler<'a, G> {
    fn wrap(generator: G, metrics: &'a mut Metrics) -> Profiler<'a, G> {
        Profiler { generator, metrics }
    }
}

impl<G: Iterator<Item = GeneratorItem>> Iterator for Profiler<'_, G> {
    type Item = G::Item;

    fn next(&mut self) -> Option<Self::Item> {
        let start = std::time::Instant::now();
        let item = self.generator.next()?;
        let tokens = item.as_ref().map(|t| t.len()).unwrap_or(0);
        self.metrics.add_step(start.elapsed(), tokens);
        Some(item)
    }
}
