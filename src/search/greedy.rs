use std::cell::Ref;

use log::debug;

use super::{Search, SearchState, NEXT_TOKENS, SCORES};
use crate::buffer::{AllocatorExt, Buffer};
use crate::config::ConfigError;
use crate::error::{DeviceResultExt, GenerateError};
use crate::kernels::{EosSource, Kernel};
use crate::params::SearchParams;
use crate::processors::LogitsProcessor;
use crate::sequences::Sequences;

/// Selects the highest scoring token of every row.
///
/// Rows that have produced the end-of-sequence token keep producing the pad
/// token until the whole batch is done.
pub struct GreedySearch {
    state: SearchState,

    /// Sum of the selected tokens' scores, per row.
    sequence_scores: Buffer<f32>,
}

impl GreedySearch {
    pub fn new(params: &SearchParams) -> Result<GreedySearch, GenerateError> {
        if params.num_beams() != 1 {
            return Err(ConfigError::InvalidValue {
                field: "num_beams",
                reason: format!("greedy search uses 1 beam, got {}", params.num_beams()),
            }
            .into());
        }
        let state = SearchState::new(params)?;
        let sequence_scores = state
            .ctx
            .pinned
            .alloc::<f32>(state.batch_beam_size())
            .for_tensor(SCORES)?;
        debug!("greedy search over {} rows", state.batch_beam_size());
        Ok(GreedySearch {
            state,
            sequence_scores,
        })
    }

    /// Sum of the scores of the tokens selected so far for `row`.
    pub fn sequence_score(&self, row: usize) -> Result<f32, GenerateError> {
        let scores = self.sequence_scores.host().for_tensor(SCORES)?;
        Ok(scores[row])
    }
}

impl Search for GreedySearch {
    fn set_logits(&mut self, logits: &[f32]) -> Result<(), GenerateError> {
        self.state
            .set_scores(logits, |_row, src, dst| dst.copy_from_slice(src))
    }

    fn apply_processor(&mut self, processor: &dyn LogitsProcessor) -> Result<(), GenerateError> {
        self.state.apply_processor(processor)
    }

    fn select_next_tokens(&mut self) -> Result<(), GenerateError> {
        let state = &mut self.state;
        state.launch(
            Kernel::ArgMax {
                scores: state.scores.clone(),
                vocab_size: state.vocab_size,
                tokens: state.token_buf.clone(),
            },
            NEXT_TOKENS,
        )?;
        state.launch(
            Kernel::AcceptTokens {
                scores: state.scores.clone(),
                vocab_size: state.vocab_size,
                tokens: state.token_buf.clone(),
                eos_met: state.eos_buf.clone(),
                sequence_scores: self.sequence_scores.clone(),
                pad_token_id: state.pad_token_id,
            },
            NEXT_TOKENS,
        )?;
        state.selected = true;
        Ok(())
    }

    fn append_next_tokens_to_sequences(&mut self) -> Result<(), GenerateError> {
        let kernel = Kernel::AppendTokens {
            tokens: self.state.token_buf.clone(),
            sequences: self.state.sequences.clone(),
        };
        self.state.append(kernel)
    }

    fn check_for_eos(&mut self) -> Result<(), GenerateError> {
        self.state.check_for_eos(EosSource::Tokens {
            tokens: self.state.token_buf.clone(),
            eos_token_id: self.state.eos_token_id,
        })
    }

    fn next_tokens(&self) -> &[i32] {
        &self.state.next_tokens
    }

    fn is_done(&mut self) -> Result<bool, GenerateError> {
        self.state.is_done()
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
        let state = &self.state;
        state.check_output(1, num_return_sequences, output, scores)?;

        let sequences = state.sequences.borrow();
        for (row, out) in output.chunks_exact_mut(state.max_length).enumerate() {
            let seq = sequences.sequence(row);
            out[..seq.len()].copy_from_slice(seq);
            out[seq.len()..].fill(state.pad_token_id);
        }
        scores.copy_from_slice(&self.sequence_scores.host().for_tensor(SCORES)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rten_testing::{random_scores, TestCases};

    use super::GreedySearch;
    use crate::config::{ConfigError, SearchConfig};
    use crate::device::{Device, DeviceContext, DeviceError};
    use crate::error::GenerateError;
    use crate::params::SearchParams;
    use crate::search::test_util::{params, ranked_logits};
    use crate::search::Search;

    fn step(search: &mut GreedySearch, logits: &[f32]) -> bool {
        search.set_logits(logits).unwrap();
        search.select_next_tokens().unwrap();
        search.append_next_tokens_to_sequences().unwrap();
        search.check_for_eos().unwrap();
        search.is_done().unwrap()
    }

    #[test]
    fn test_select_highest_score() {
        #[derive(Debug)]
        struct Case {
            device: Device,
        }

        let cases = [
            Case {
                device: Device::Cpu,
            },
            Case {
                device: Device::Cuda,
            },
            Case {
                device: Device::Dml,
            },
        ];

        cases.test_each(|case| {
            let search_config = SearchConfig {
                eos_token_id: 3,
                max_length: 4,
                ..Default::default()
            };
            let p = params(case.device, vec![1, 2], 2, 4, search_config);
            let mut search = GreedySearch::new(&p).unwrap();

            #[rustfmt::skip]
            let logits = [
                0.1, 0.7, 0.7, 0.2,
                0.0, 0.0, 0.5, 0.9,
            ];
            assert!(!step(&mut search, &logits));

            // Ties go to the lowest index.
            assert_eq!(search.next_tokens(), &[1, 3]);
            assert_eq!(search.eos_met(), &[false, true]);
            assert_eq!(search.sequences().sequence(0), &[1, 1]);
            assert_eq!(search.sequences().sequence(1), &[2, 3]);
            assert_eq!(&*search.scores(1), &[0.0, 0.0, 0.5, 0.9]);
        })
    }

    #[test]
    fn test_selection_queue_usage() {
        #[derive(Debug)]
        struct Case {
            device: Device,
            submitted: &'static [&'static str],
        }

        let cases = [
            Case {
                device: Device::Cpu,
                submitted: &[],
            },
            Case {
                device: Device::Cuda,
                submitted: &["argmax", "accept_tokens", "append_tokens", "check_eos"],
            },
        ];

        cases.test_each(|case| {
            let (ctx, queue) = DeviceContext::emulated(case.device);
            let p = SearchParams::new(vec![1], 1, 4, SearchConfig::default(), ctx);
            let mut search = GreedySearch::new(&p).unwrap();
            step(&mut search, &[0., 1., 0., 0.]);
            assert_eq!(search.next_tokens(), &[1]);
            assert_eq!(queue.submitted(), case.submitted);

            let syncs = queue.synchronizations();
            search.is_done().unwrap();
            assert_eq!(queue.synchronizations(), syncs + 1);
        })
    }

    #[test]
    fn test_results_visible_after_is_done() {
        let search_config = SearchConfig {
            eos_token_id: 2,
            pad_token_id: 0,
            ..Default::default()
        };
        let (ctx, queue) = DeviceContext::emulated(Device::Cuda);
        let p = SearchParams::new(vec![1], 1, 4, search_config, ctx);
        let mut search = GreedySearch::new(&p).unwrap();

        search.set_logits(&[0., 0., 1., 0.]).unwrap();
        search.select_next_tokens().unwrap();
        search.append_next_tokens_to_sequences().unwrap();
        search.check_for_eos().unwrap();

        // Nothing has been read back from the device yet.
        assert_eq!(queue.synchronizations(), 0);
        assert_eq!(search.next_tokens(), &[0]);
        assert_eq!(search.eos_met(), &[false]);
        assert_eq!(search.sequence_length(), 2);

        assert!(search.is_done().unwrap());
        assert_eq!(queue.synchronizations(), 1);
        assert_eq!(search.next_tokens(), &[2]);
        assert_eq!(search.eos_met(), &[true]);
        assert_eq!(search.sequences().sequence(0), &[1, 2]);
    }

    #[test]
    fn test_rejects_multiple_beams() {
        #[derive(Debug)]
        struct Case {
            input_ids: Vec<i32>,
            num_beams: usize,
        }

        let cases = [
            Case {
                input_ids: vec![1],
                num_beams: 2,
            },
            Case {
                input_ids: vec![1, 2, 3, 4],
                num_beams: 4,
            },
        ];

        cases.test_each_value(|case| {
            let search_config = SearchConfig {
                num_beams: case.num_beams,
                ..Default::default()
            };
            let p = params(Device::Cpu, case.input_ids, 1, 4, search_config);
            let err = GreedySearch::new(&p).err().unwrap();
            assert!(matches!(
                err,
                GenerateError::Config(ConfigError::InvalidValue {
                    field: "num_beams",
                    ..
                })
            ));
        })
    }

    #[test]
    fn test_append_once_per_selection() {
        let search_config = SearchConfig {
            max_length: 8,
            ..Default::default()
        };
        let p = params(Device::Cpu, vec![1], 1, 4, search_config);
        let mut search = GreedySearch::new(&p).unwrap();

        let err = search.append_next_tokens_to_sequences().err().unwrap();
        assert!(matches!(err, GenerateError::InvalidState(_)));

        search.set_logits(&[0., 1., 0., 0.]).unwrap();
        search.select_next_tokens().unwrap();
        search.append_next_tokens_to_sequences().unwrap();
        let err = search.append_next_tokens_to_sequences().err().unwrap();
        assert!(matches!(err, GenerateError::InvalidState(_)));
        assert_eq!(search.sequence_length(), 2);
        assert_eq!(search.sequences().sequence(0), &[1, 1]);

        // The next step may append again.
        assert!(!step(&mut search, &[0., 0., 1., 0.]));
        assert_eq!(search.sequences().sequence(0), &[1, 1, 2]);
    }

    #[test]
    fn test_queue_failure_surfaces_at_is_done() {
        let (ctx, queue) = DeviceContext::emulated(Device::Cuda);
        let p = SearchParams::new(vec![1], 1, 4, SearchConfig::default(), ctx);
        let mut search = GreedySearch::new(&p).unwrap();
        search.set_logits(&[0., 1., 0., 0.]).unwrap();

        queue.fail("device lost");
        let err = search.is_done().err().unwrap();
        assert!(matches!(
            err,
            GenerateError::Device {
                tensor: "next_tokens",
                source: DeviceError::QueueFailed { .. },
            }
        ));

        // Later work is refused.
        assert!(search.select_next_tokens().is_err());
    }

    #[test]
    fn test_finished_rows_produce_padding() {
        let search_config = SearchConfig {
            eos_token_id: 2,
            pad_token_id: 0,
            max_length: 6,
            ..Default::default()
        };
        let p = params(Device::Cpu, vec![5, 5], 2, 6, search_config);
        let mut search = GreedySearch::new(&p).unwrap();

        let eos_then_one = [ranked_logits(6, &[2]), ranked_logits(6, &[1])].concat();
        assert!(!step(&mut search, &eos_then_one));
        assert_eq!(search.eos_met(), &[true, false]);

        // Row 0 stays finished even though its best token is no longer EOS.
        let ones = [ranked_logits(6, &[1]), ranked_logits(6, &[1])].concat();
        assert!(!step(&mut search, &ones));
        assert_eq!(search.next_tokens(), &[0, 1]);
        assert_eq!(search.eos_met(), &[true, false]);

        let eos = [ranked_logits(6, &[1]), ranked_logits(6, &[2])].concat();
        assert!(step(&mut search, &eos));
        assert_eq!(search.sequences().sequence(0), &[5, 2, 0, 0]);
        assert_eq!(search.sequences().sequence(1), &[5, 1, 1, 2]);
    }

    #[test]
    fn test_eos_is_monotonic_and_done_tracks_rows() {
        let mut rng = fastrand::Rng::with_seed(42);
        let search_config = SearchConfig {
            eos_token_id: 0,
            max_length: 12,
            ..Default::default()
        };
        let batch_size = 3;
        let vocab_size = 4;
        let p = params(Device::Cpu, vec![1, 2, 3], batch_size, vocab_size, search_config);
        let mut search = GreedySearch::new(&p).unwrap();

        let mut prev_eos = vec![false; batch_size];
        loop {
            let logits = random_scores(&mut rng, batch_size * vocab_size, 1.0);
            let done = step(&mut search, &logits);
            let eos = search.eos_met().to_vec();
            for (prev, now) in prev_eos.iter().zip(&eos) {
                assert!(!prev || *now);
            }
            let all_met = eos.iter().all(|&m| m);
            assert_eq!(done, all_met || search.sequence_length() == 12);
            prev_eos = eos;
            if done {
                break;
            }
        }
    }

    #[test]
    fn test_check_for_eos_without_selection() {
        let search_config = SearchConfig {
            eos_token_id: 0,
            ..Default::default()
        };
        let p = params(Device::Cpu, vec![1], 1, 4, search_config);
        let mut search = GreedySearch::new(&p).unwrap();

        // The initial next token is the pad token, which equals EOS here,
        // but no token has been selected yet.
        search.check_for_eos().unwrap();
        assert_eq!(search.eos_met(), &[false]);
        assert!(!search.is_done().unwrap());
    }

    #[test]
    fn test_max_length() {
        let search_config = SearchConfig {
            max_length: 2,
            eos_token_id: 3,
            ..Default::default()
        };
        let p = params(Device::Cpu, vec![1], 1, 4, search_config);
        let mut search = GreedySearch::new(&p).unwrap();
        assert!(step(&mut search, &[0., 1., 0., 0.]));

        search.set_logits(&[0., 1., 0., 0.]).unwrap();
        search.select_next_tokens().unwrap();
        let err = search.append_next_tokens_to_sequences().err().unwrap();
        assert!(matches!(err, GenerateError::MaxLengthReached(2)));
    }

    #[test]
    fn test_finalize() {
        let search_config = SearchConfig {
            max_length: 4,
            eos_token_id: 3,
            pad_token_id: 0,
            ..Default::default()
        };
        let p = params(Device::Cpu, vec![1, 2], 2, 4, search_config);
        let mut search = GreedySearch::new(&p).unwrap();

        #[rustfmt::skip]
        let logits = [
            0.0, 0.0, 1.5, 0.0,
            0.0, 0.0, 0.0, 2.0,
        ];
        step(&mut search, &logits);
        #[rustfmt::skip]
        let logits = [
            0.0, 0.5, 0.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        step(&mut search, &logits);

        let mut output = vec![-1; 2 * 4];
        let mut scores = vec![0.; 2];
        search.finalize(1, &mut output, &mut scores).unwrap();
        assert_eq!(output, [1, 2, 1, 0, 2, 3, 0, 0]);
        assert_eq!(scores, [2.0, 2.0]);
        assert_eq!(search.sequence_score(0).unwrap(), 2.0);

        let mut output = vec![0; 2 * 2 * 4];
        let mut scores = vec![0.; 4];
        let err = search.finalize(2, &mut output, &mut scores).err().unwrap();
        assert!(matches!(
            err,
            GenerateError::Config(ConfigError::InvalidValue {
                field: "num_return_sequences",
                ..
            })
        ));
    }
}
