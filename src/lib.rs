//! rten-decode is an autoregressive decoding engine for transformer
//! language models.
//!
//! Given a batch of prompts and a model which predicts next-token scores,
//! it repeatedly runs the model, selects the next token of every sequence
//! with greedy or beam search, and updates the model inputs that depend on
//! the sequence position.
//!
//! # Generating text
//!
//! 1. Implement [`Model`] for the inference session that runs the network.
//! 2. Load a [`Config`], usually with [`Config::from_json`].
//! 3. Create [`SearchParams`] holding the padded prompt ids and a
//!    [`DeviceContext`] for the device the model runs on.
//! 4. Create a [`Generator`] and iterate over it, or call
//!    [`Generator::generate`] to run to completion.
//!
//! # Devices
//!
//! Work that depends on the model's device is issued on the
//! [`ExecutionQueue`] of the [`DeviceContext`]. CPU generation never submits
//! work to the queue. On CUDA the position inputs are updated by device
//! kernels. On DirectML, which cannot run those kernels, they are updated on
//! the host and uploaded.
//!
//! [`StreamQueue`] is an in-order queue which executes each command on the
//! host as it is submitted. It is used for CPU generation and to exercise
//! the device paths without a GPU.
//!
//! # Model inputs
//!
//! [`PositionInputs`] manages the position ids, attention mask, `seqlens_k`
//! and total sequence length inputs. Only the inputs the model declares are
//! fed. With graph capture enabled, inputs are bound to static buffers whose
//! address stays fixed between steps.

mod buffer;
mod config;
mod device;
mod error;
mod generator;
mod kernels;
mod metrics;
mod model;
mod params;
mod position_inputs;
mod processors;
mod search;
mod sequences;
mod topk;

pub use buffer::{
    Allocator, AllocatorExt, AnyBuffer, AnyTensor, Buffer, DataType, DeviceTensor, Element,
    IntElement, Location, MemoryAllocator, StaticBuffer,
};
pub use config::{Config, ConfigError, GraphCaptureConfig, InputNames, SearchConfig};
pub use device::{Command, Device, DeviceContext, DeviceError, ExecutionQueue, StreamQueue};
pub use error::GenerateError;
pub use generator::{GenerationOutput, Generator, GeneratorItem, GeneratorUtils};
pub use kernels::{EosSource, Kernel};
pub use metrics::Metrics;
pub use model::{Model, ModelInputs, SessionInfo};
pub use params::SearchParams;
pub use position_inputs::{IncrementPath, MaskPath, PositionInputs};
pub use processors::{LogitsProcessor, MinLength, RepetitionPenalty};
pub use search::{BeamHypotheses, BeamScorer, BeamSearch, GreedySearch, Hypothesis, Search};
pub use sequences::Sequences;
pub use topk::{Candidate, TopKShape, TopKWorkspace};
