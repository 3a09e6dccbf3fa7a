//! Inputs to one generation call.

use crate::config::{ConfigError, SearchConfig};
use crate::device::{Device, DeviceContext};

/// Everything a search needs to know about one generation call.
///
/// The prompt ids are owned here. Components derive their state from them
/// but never modify them.
#[derive(Clone)]
pub struct SearchParams {
    pub batch_size: usize,

    /// Length of each prompt, including any left padding.
    pub sequence_length: usize,

    pub vocab_size: usize,

    /// Prompt token ids with shape `(batch_size, sequence_length)`.
    pub input_ids: Vec<i32>,

    pub search: SearchConfig,

    pub context: DeviceContext,
}

impl SearchParams {
    /// Create parameters for a batch of equal-length (padded) prompts.
    pub fn new(
        input_ids: Vec<i32>,
        batch_size: usize,
        vocab_size: usize,
        search: SearchConfig,
        context: DeviceContext,
    ) -> SearchParams {
        let sequence_length = input_ids.len().checked_div(batch_size).unwrap_or(0);
        SearchParams {
            batch_size,
            sequence_length,
            vocab_size,
            input_ids,
            search,
            context,
        }
    }

    pub fn num_beams(&self) -> usize {
        self.search.num_beams
    }

    /// Number of decoding rows, `batch_size * num_beams`.
    pub fn batch_beam_size(&self) -> usize {
        self.batch_size * self.search.num_beams
    }

    pub fn device(&self) -> Device {
        self.context.device()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: String| ConfigError::InvalidValue { field, reason };

        self.search.validate()?;
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be at least 1".into()));
        }
        let prompt_len = self.sequence_length;
        if prompt_len == 0 || self.input_ids.len() != self.batch_size * prompt_len {
            return Err(invalid(
                "input_ids",
                format!(
                    "{} ids do not form {} non-empty prompts",
                    self.input_ids.len(),
                    self.batch_size
                ),
            ));
        }
        if self.sequence_length > self.search.max_length {
            return Err(invalid(
                "max_length",
                format!(
                    "prompt length {} exceeds max_length {}",
                    self.sequence_length, self.search.max_length
                ),
            ));
        }
        if self.vocab_size < 2 {
            return Err(invalid("vocab_size", "must be at least 2".into()));
        }
        for (field, token) in [
            ("eos_token_id", self.search.eos_token_id),
            ("pad_token_id", self.search.pad_token_id),
        ] {
            if token < 0 || token as usize >= self.vocab_size {
                return Err(invalid(
                    field,
                    format!("{} is outside the vocabulary of {}", token, self.vocab_size),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::SearchParams;
    use crate::config::{ConfigError, SearchConfig};
    use crate::device::DeviceContext;

    fn params(input_ids: Vec<i32>, batch_size: usize, search: SearchConfig) -> SearchParams {
        SearchParams::new(input_ids, batch_size, 16, search, DeviceContext::cpu())
    }

    #[test]
    fn test_shape() {
        let search = SearchConfig {
            num_beams: 3,
            ..Default::default()
        };
        let p = params(vec![1, 2, 3, 4, 5, 6], 2, search);
        assert_eq!(p.sequence_length, 3);
        assert_eq!(p.batch_beam_size(), 6);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        let field = |p: SearchParams| match p.validate() {
            Err(ConfigError::InvalidValue { field, .. }) => field,
            other => panic!("expected invalid value, got {:?}", other),
        };

        assert_eq!(field(params(vec![1, 2, 3], 2, SearchConfig::default())), "input_ids");
        assert_eq!(field(params(vec![], 1, SearchConfig::default())), "input_ids");

        let short = SearchConfig {
            max_length: 2,
            ..Default::default()
        };
        assert_eq!(field(params(vec![1, 2, 3], 1, short)), "max_length");

        let bad_eos = SearchConfig {
            eos_token_id: 16,
            ..Default::default()
        };
        assert_eq!(field(params(vec![1], 1, bad_eos)), "eos_token_id");
    }
}
