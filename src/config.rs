//! Configuration for a generation call.
//!
//! Configuration is usually loaded from JSON. Every field has a default, so
//! a file only needs to list the values that differ.

use serde::Deserialize;

use crate::buffer::DataType;
use crate::device::Device;

/// Errors in configuration, or between configuration and the model.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// The model declares position ids and attention mask inputs with
    /// different element types.
    #[error("position_ids ({position_ids}) and attention_mask ({attention_mask}) must have the same data type")]
    DataTypeMismatch {
        position_ids: DataType,
        attention_mask: DataType,
    },

    /// A model input has a type the engine cannot produce.
    #[error("input \"{input}\" has type {dtype}, expected int32 or int64")]
    UnsupportedDataType { input: String, dtype: DataType },

    /// Graph capture was requested on a device without graph replay.
    #[error("graph capture is not supported on {0}")]
    GraphCaptureUnsupported(Device),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

/// Parameters of the search strategy.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchConfig {
    /// Number of beams. `1` selects greedy search.
    pub num_beams: usize,

    /// Maximum sequence length including the prompt.
    pub max_length: usize,

    /// Length below which the end-of-sequence token is suppressed.
    pub min_length: usize,

    /// Exponent applied to the length when normalizing hypothesis scores.
    pub length_penalty: f32,

    /// Stop a beam group as soon as it has `num_beams` finished hypotheses.
    pub early_stopping: bool,

    /// Number of sequences returned per batch entry.
    pub num_return_sequences: usize,

    /// Penalty for tokens already in the sequence. `1.0` disables it.
    pub repetition_penalty: f32,

    pub pad_token_id: i32,
    pub eos_token_id: i32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            num_beams: 1,
            max_length: 20,
            min_length: 0,
            length_penalty: 1.0,
            early_stopping: true,
            num_return_sequences: 1,
            repetition_penalty: 1.0,
            pad_token_id: 0,
            eos_token_id: 0,
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_beams == 0 {
            return Err(invalid("num_beams", "must be at least 1"));
        }
        if self.max_length == 0 {
            return Err(invalid("max_length", "must be at least 1"));
        }
        if self.repetition_penalty.is_nan() || self.repetition_penalty <= 0.0 {
            return Err(invalid(
                "repetition_penalty",
                format!("must be positive, got {}", self.repetition_penalty),
            ));
        }
        if self.num_return_sequences == 0 || self.num_return_sequences > self.num_beams {
            return Err(invalid(
                "num_return_sequences",
                format!(
                    "must be between 1 and num_beams ({}), got {}",
                    self.num_beams, self.num_return_sequences
                ),
            ));
        }
        Ok(())
    }

    pub fn is_beam_search(&self) -> bool {
        self.num_beams > 1
    }
}

/// Names of model inputs and outputs.
///
/// Inputs that the model does not declare are not fed.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct InputNames {
    pub input_ids: String,
    pub attention_mask: String,
    pub position_ids: String,

    /// Per-row count of tokens decoded so far, used by fused attention
    /// kernels.
    pub seqlens_k: String,

    pub total_sequence_length: String,
}

impl Default for InputNames {
    fn default() -> Self {
        InputNames {
            input_ids: "input_ids".to_string(),
            attention_mask: "attention_mask".to_string(),
            position_ids: "position_ids".to_string(),
            seqlens_k: "seqlens_k".to_string(),
            total_sequence_length: "total_sequence_length".to_string(),
        }
    }
}

/// Settings for replaying captured execution graphs.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct GraphCaptureConfig {
    pub enabled: bool,

    /// Largest batch size a captured graph will be replayed with. Static
    /// buffers are sized for `max_batch_size * num_beams` rows.
    pub max_batch_size: usize,
}

impl GraphCaptureConfig {
    /// Number of rows static buffers must hold for `num_beams` beams on
    /// `device`, or `None` if graph capture is disabled.
    pub fn static_capacity(
        &self,
        device: Device,
        num_beams: usize,
    ) -> Result<Option<usize>, ConfigError> {
        if !self.enabled {
            return Ok(None);
        }
        if !device.supports_graph_capture() {
            return Err(ConfigError::GraphCaptureUnsupported(device));
        }
        Ok(Some(self.max_batch_size * num_beams))
    }
}

impl Default for GraphCaptureConfig {
    fn default() -> Self {
        GraphCaptureConfig {
            enabled: false,
            max_batch_size: 1,
        }
    }
}

/// Complete configuration for a [`Generator`](crate::Generator).
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub search: SearchConfig,
    pub inputs: InputNames,
    pub graph_capture: GraphCaptureConfig,
}

impl Config {
    /// Parse and validate configuration from JSON.
    pub fn from_json(json: &str) -> Result<Config, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.search.validate()?;
        if self.graph_capture.enabled && self.graph_capture.max_batch_size == 0 {
            return Err(invalid(
                "graph_capture.max_batch_size",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}
