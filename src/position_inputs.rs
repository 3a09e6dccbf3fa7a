//! Auxiliary model inputs that track token positions.
//!
//! Besides the token ids, decoder models usually take some of these inputs:
//!
//!  - `position_ids`: position of each input token within its sequence,
//!    ignoring left padding. `(batch_beam, prompt_len)` on the first run and
//!    `(batch_beam, 1)` after that.
//!  - `attention_mask`: 1 for real tokens and 0 for padding, with one column
//!    per token processed so far.
//!  - `seqlens_k`: number of real tokens already in each row, used by fused
//!    attention kernels.
//!  - `total_sequence_length`: scalar length of the sequences.
//!
//! [`PositionInputs`] creates them from the prompt and updates them after
//! each step. Which update path is used depends on what the device can do.

use log::{debug, trace};

use crate::buffer::{
    AllocatorExt, AnyTensor, Buffer, DataType, DeviceTensor, IntElement, StaticBuffer,
};
use crate::config::{ConfigError, GraphCaptureConfig, InputNames};
use crate::device::{Command, Device, DeviceContext, DeviceError};
use crate::error::{DeviceResultExt, GenerateError};
use crate::kernels::{extend_attention_mask, increment, Kernel};
use crate::model::{ModelInputs, SessionInfo};
use crate::params::SearchParams;

const POSITION_IDS: &str = "position_ids";
const ATTENTION_MASK: &str = "attention_mask";
const SEQLENS_K: &str = "seqlens_k";
const TOTAL_SEQUENCE_LENGTH: &str = "total_sequence_length";

/// How per-row counters (position ids and `seqlens_k`) are advanced.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IncrementPath {
    /// Increment the tensor in host memory.
    Host,

    /// Launch an increment kernel on the device tensor.
    Kernel,

    /// Increment a host shadow copy and upload it into the device tensor.
    HostShadowUpload,
}

impl IncrementPath {
    pub fn for_device(device: Device) -> IncrementPath {
        if !device.is_accelerated() {
            IncrementPath::Host
        } else if device.supports_increment_kernel() {
            IncrementPath::Kernel
        } else {
            IncrementPath::HostShadowUpload
        }
    }
}

/// How the attention mask is grown by one column.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MaskPath {
    /// Grow the mask on the host.
    Host,

    /// Grow the mask in device memory with a kernel.
    Kernel,

    /// The device cannot grow the mask, so it is kept and grown in host
    /// memory.
    HostFallback,
}

impl MaskPath {
    pub fn for_device(device: Device) -> MaskPath {
        if !device.is_accelerated() {
            MaskPath::Host
        } else if device.supports_mask_kernel() {
            MaskPath::Kernel
        } else {
            MaskPath::HostFallback
        }
    }
}

/// Values derived from the prompt before the first model run, expanded over
/// beams.
struct InitialValues<T> {
    /// `(batch_beam, prompt_len)` position ids.
    position_ids: Vec<T>,

    /// `(batch_beam, prompt_len)` attention mask.
    attention_mask: Vec<T>,

    /// Position id of the first generated token in each row.
    next_position_ids: Vec<T>,

    /// Number of non-padding prompt tokens in each row.
    sequence_lengths: Vec<i32>,
}

fn initial_values<T: IntElement>(
    input_ids: &[i32],
    prompt_len: usize,
    num_beams: usize,
    pad_token_id: i32,
) -> InitialValues<T> {
    let rows = input_ids.len() / prompt_len.max(1) * num_beams;
    let mut values = InitialValues {
        position_ids: Vec::with_capacity(rows * prompt_len),
        attention_mask: Vec::with_capacity(rows * prompt_len),
        next_position_ids: Vec::with_capacity(rows),
        sequence_lengths: Vec::with_capacity(rows),
    };

    let mut positions = Vec::with_capacity(prompt_len);
    let mut mask = Vec::with_capacity(prompt_len);
    for prompt in input_ids.chunks(prompt_len.max(1)) {
        positions.clear();
        mask.clear();
        let mut position = 0;
        for &token in prompt {
            if token == pad_token_id {
                positions.push(T::ZERO);
                mask.push(T::ZERO);
            } else {
                positions.push(T::from_usize(position));
                mask.push(T::ONE);
                position += 1;
            }
        }
        for _ in 0..num_beams {
            values.position_ids.extend_from_slice(&positions);
            values.attention_mask.extend_from_slice(&mask);
            values.next_position_ids.push(T::from_usize(position));
            values.sequence_lengths.push(position as i32);
        }
    }
    values
}

/// Device context and update paths shared by all the tensors.
struct Env {
    ctx: DeviceContext,
    increment_path: IncrementPath,
    mask_path: MaskPath,
    batch_beam_size: usize,
}

impl Env {
    /// Create a tensor in device memory holding the contents of the host
    /// buffer `src`, in `slot` if given.
    ///
    /// Device memory is filled by a copy on the queue. If the device uses
    /// host memory the data is copied directly.
    fn materialize<T: IntElement>(
        &self,
        src: &Buffer<T>,
        shape: &[usize],
        slot: Option<&StaticBuffer<T>>,
    ) -> Result<DeviceTensor<T>, DeviceError> {
        let tensor = match slot {
            Some(slot) => slot.bind(shape)?,
            None => self.ctx.device.alloc_tensor(shape)?,
        };
        if tensor.location().is_host_accessible() {
            tensor.buffer().host_mut()?.copy_from_slice(&src.host()?);
        } else {
            self.upload(src, &tensor)?;
        }
        Ok(tensor)
    }

    fn upload<T: IntElement>(
        &self,
        src: &Buffer<T>,
        dst: &DeviceTensor<T>,
    ) -> Result<(), DeviceError> {
        self.ctx.queue.submit(Command::Copy {
            src: src.clone().into(),
            dst: dst.buffer().clone().into(),
        })
    }

    /// Add one to each element of `tensor`, whose current values are also
    /// held in `shadow` when the shadow path is used.
    fn increment<T: IntElement>(
        &self,
        tensor: &DeviceTensor<T>,
        shadow: &Buffer<T>,
    ) -> Result<(), DeviceError> {
        match self.increment_path {
            IncrementPath::Host => increment(&mut *tensor.buffer().host_mut()?),
            IncrementPath::Kernel => self.ctx.queue.submit(Command::Launch(Kernel::Increment(
                tensor.buffer().clone().into(),
            )))?,
            IncrementPath::HostShadowUpload => {
                increment(&mut *shadow.host_mut()?);
                self.upload(shadow, tensor)?;
            }
        }
        Ok(())
    }
}

/// Position ids and attention mask, which share an element type.
struct TypedInputs<T> {
    position_ids: DeviceTensor<T>,

    /// Host copy of the next position id of each row.
    position_ids_next: Buffer<T>,

    attention_mask: DeviceTensor<T>,

    static_position_ids: Option<StaticBuffer<T>>,
}

impl<T: IntElement> TypedInputs<T>
where
    DeviceTensor<T>: Into<AnyTensor>,
{
    fn new(
        env: &Env,
        initial: &InitialValues<T>,
        prompt_len: usize,
        static_capacity: Option<usize>,
    ) -> Result<TypedInputs<T>, GenerateError> {
        let ctx = &env.ctx;
        let shape = [env.batch_beam_size, prompt_len];

        let staging = ctx.pinned.alloc_from(&initial.position_ids).for_tensor(POSITION_IDS)?;
        let position_ids = env.materialize(&staging, &shape, None).for_tensor(POSITION_IDS)?;
        let position_ids_next = ctx
            .pinned
            .alloc_from(&initial.next_position_ids)
            .for_tensor(POSITION_IDS)?;

        let attention_mask = match env.mask_path {
            MaskPath::Kernel => {
                let staging = ctx
                    .pinned
                    .alloc_from(&initial.attention_mask)
                    .for_tensor(ATTENTION_MASK)?;
                env.materialize(&staging, &shape, None)
            }
            MaskPath::Host | MaskPath::HostFallback => ctx
                .host
                .alloc_from(&initial.attention_mask)
                .map(|buf| DeviceTensor::new(buf, &shape)),
        }
        .for_tensor(ATTENTION_MASK)?;

        let static_position_ids = static_capacity
            .map(|capacity| StaticBuffer::new(&*ctx.device, POSITION_IDS, capacity))
            .transpose()
            .for_tensor(POSITION_IDS)?;

        Ok(TypedInputs {
            position_ids,
            position_ids_next,
            attention_mask,
            static_position_ids,
        })
    }

    fn update_position_ids(&mut self, env: &Env, first: bool) -> Result<AnyTensor, DeviceError> {
        if first {
            // After the prompt each row gets one position per step.
            let shape = [env.batch_beam_size, 1];
            self.position_ids = env.materialize(
                &self.position_ids_next,
                &shape,
                self.static_position_ids.as_ref(),
            )?;
        } else {
            env.increment(&self.position_ids, &self.position_ids_next)?;
        }
        Ok(self.position_ids.clone().into())
    }

    fn update_attention_mask(
        &mut self,
        env: &Env,
        current_length: usize,
    ) -> Result<AnyTensor, DeviceError> {
        let rows = env.batch_beam_size;
        let shape = [rows, current_length];
        let next = match env.mask_path {
            MaskPath::Kernel => {
                let next = env.ctx.device.alloc_tensor::<T>(&shape)?;
                env.ctx
                    .queue
                    .submit(Command::Launch(Kernel::ExtendAttentionMask {
                        src: self.attention_mask.buffer().clone().into(),
                        dst: next.buffer().clone().into(),
                        rows,
                        width: current_length,
                    }))?;
                next
            }
            MaskPath::Host | MaskPath::HostFallback => {
                let next = env.ctx.host.alloc_tensor::<T>(&shape)?;
                extend_attention_mask(
                    &mut *next.buffer().host_mut()?,
                    &*self.attention_mask.buffer().host()?,
                    rows,
                    current_length,
                );
                next
            }
        };
        self.attention_mask = next;
        Ok(self.attention_mask.clone().into())
    }
}

enum Typed {
    Int32(TypedInputs<i32>),
    Int64(TypedInputs<i64>),
}

/// Indices of the registered inputs in a [`ModelInputs`] list.
#[derive(Default)]
struct InputIndices {
    position_ids: Option<usize>,
    seqlens_k: Option<usize>,
    total_sequence_length: Option<usize>,
    attention_mask: Option<usize>,
}

/// Manages the position-dependent inputs of a decoder model.
///
/// Only the inputs the model declares are registered and updated.
pub struct PositionInputs {
    env: Env,
    names: InputNames,
    dtype: DataType,

    has_position_ids: bool,
    has_attention_mask: bool,
    has_seqlens_k: bool,
    has_total_sequence_length: bool,

    typed: Typed,

    seqlens_k: DeviceTensor<i32>,
    seqlens_k_next: Buffer<i32>,
    static_seqlens_k: Option<StaticBuffer<i32>>,
    initial_sequence_lengths: Vec<i32>,

    total_sequence_length: DeviceTensor<i32>,

    /// Number of columns of the attention mask, which is the sequence length
    /// the inputs currently describe.
    length: usize,

    indices: InputIndices,
    is_first_position_ids_update: bool,
    is_first_seqlens_k_update: bool,
}

impl PositionInputs {
    /// Derive the initial inputs for the prompt in `params`.
    ///
    /// Fails if the model declares position ids and attention mask of
    /// different types, or of a type other than int32 or int64.
    pub fn new<S: SessionInfo + ?Sized>(
        session: &S,
        names: &InputNames,
        params: &SearchParams,
        graph_capture: &GraphCaptureConfig,
    ) -> Result<PositionInputs, GenerateError> {
        let has_position_ids = session.has_input(&names.position_ids);
        let has_attention_mask = session.has_input(&names.attention_mask);
        let has_seqlens_k = session.has_input(&names.seqlens_k);
        let has_total_sequence_length = session.has_input(&names.total_sequence_length);

        let input_type = |name: &str| session.input_type(name).unwrap_or(DataType::Int32);
        let mut dtype = DataType::Int32;
        let mut dtype_input = &names.attention_mask;
        if has_attention_mask {
            dtype = input_type(&names.attention_mask);
        }
        if has_position_ids {
            let position_type = input_type(&names.position_ids);
            if has_attention_mask && position_type != dtype {
                return Err(ConfigError::DataTypeMismatch {
                    position_ids: position_type,
                    attention_mask: dtype,
                }
                .into());
            }
            dtype = position_type;
            dtype_input = &names.position_ids;
        }
        if !matches!(dtype, DataType::Int32 | DataType::Int64) {
            return Err(ConfigError::UnsupportedDataType {
                input: dtype_input.clone(),
                dtype,
            }
            .into());
        }

        let device = params.device();
        let static_capacity = graph_capture.static_capacity(device, params.num_beams())?;

        let env = Env {
            ctx: params.context.clone(),
            increment_path: IncrementPath::for_device(device),
            mask_path: MaskPath::for_device(device),
            batch_beam_size: params.batch_beam_size(),
        };
        debug!(
            "position inputs on {}: type {}, increment {:?}, mask {:?}, static buffers {}",
            device,
            dtype,
            env.increment_path,
            env.mask_path,
            static_capacity.is_some()
        );

        let prompt_len = params.sequence_length;
        let num_beams = params.num_beams();
        let pad = params.search.pad_token_id;
        let (typed, initial_sequence_lengths) = match dtype {
            DataType::Int64 => {
                let initial = initial_values::<i64>(&params.input_ids, prompt_len, num_beams, pad);
                let typed = TypedInputs::new(&env, &initial, prompt_len, static_capacity)?;
                (Typed::Int64(typed), initial.sequence_lengths)
            }
            _ => {
                let initial = initial_values::<i32>(&params.input_ids, prompt_len, num_beams, pad);
                let typed = TypedInputs::new(&env, &initial, prompt_len, static_capacity)?;
                (Typed::Int32(typed), initial.sequence_lengths)
            }
        };

        let ctx = &env.ctx;
        let bb = env.batch_beam_size;
        let seqlens_k = ctx
            .host
            .alloc_from(&initial_sequence_lengths)
            .map(|buf| DeviceTensor::new(buf, &[bb]))
            .for_tensor(SEQLENS_K)?;
        let seqlens_k_next = ctx
            .pinned
            .alloc_from(&initial_sequence_lengths)
            .for_tensor(SEQLENS_K)?;
        let static_seqlens_k = static_capacity
            .map(|capacity| StaticBuffer::new(&*ctx.device, SEQLENS_K, capacity))
            .transpose()
            .for_tensor(SEQLENS_K)?;

        let total_sequence_length = ctx
            .host
            .alloc_from(&[prompt_len as i32])
            .map(|buf| DeviceTensor::new(buf, &[]))
            .for_tensor(TOTAL_SEQUENCE_LENGTH)?;

        Ok(PositionInputs {
            env,
            names: names.clone(),
            dtype,
            has_position_ids,
            has_attention_mask,
            has_seqlens_k,
            has_total_sequence_length,
            typed,
            seqlens_k,
            seqlens_k_next,
            static_seqlens_k,
            initial_sequence_lengths,
            total_sequence_length,
            length: prompt_len,
            indices: InputIndices::default(),
            is_first_position_ids_update: true,
            is_first_seqlens_k_update: true,
        })
    }

    /// Element type of the position ids and attention mask.
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn increment_path(&self) -> IncrementPath {
        self.env.increment_path
    }

    pub fn mask_path(&self) -> MaskPath {
        self.env.mask_path
    }

    /// Number of non-padding prompt tokens in each row.
    pub fn initial_sequence_lengths(&self) -> &[i32] {
        &self.initial_sequence_lengths
    }

    /// Sequence length the inputs currently describe.
    pub fn sequence_length(&self) -> usize {
        self.length
    }

    /// Register the inputs the model declares, in the order position ids,
    /// `seqlens_k`, total sequence length, attention mask.
    pub fn add(&mut self, inputs: &mut ModelInputs) {
        if self.has_position_ids {
            let tensor = self.position_ids();
            self.indices.position_ids = Some(inputs.push(&self.names.position_ids, tensor));
        }
        if self.has_seqlens_k {
            self.indices.seqlens_k =
                Some(inputs.push(&self.names.seqlens_k, self.seqlens_k.clone().into()));
        }
        if self.has_total_sequence_length {
            self.indices.total_sequence_length = Some(inputs.push(
                &self.names.total_sequence_length,
                self.total_sequence_length.clone().into(),
            ));
        }
        if self.has_attention_mask {
            let tensor = self.attention_mask();
            self.indices.attention_mask = Some(inputs.push(&self.names.attention_mask, tensor));
        }
    }

    /// Update the inputs for a model run over sequences of `current_length`
    /// tokens and rebind them in `inputs`.
    ///
    /// Must be called exactly once per step, after the step's tokens have
    /// been appended, so `current_length` is always one more than the
    /// previous length.
    pub fn update(
        &mut self,
        inputs: &mut ModelInputs,
        current_length: usize,
    ) -> Result<(), GenerateError> {
        if current_length != self.length + 1 {
            return Err(GenerateError::MaskWidth {
                width: self.length,
                current_length,
            });
        }
        trace!("updating position inputs for length {}", current_length);

        if let Some(index) = self.indices.position_ids {
            let first = self.is_first_position_ids_update;
            let tensor = match &mut self.typed {
                Typed::Int32(t) => t.update_position_ids(&self.env, first),
                Typed::Int64(t) => t.update_position_ids(&self.env, first),
            }
            .for_tensor(POSITION_IDS)?;
            inputs.set(index, tensor);
            self.is_first_position_ids_update = false;
        }

        if let Some(index) = self.indices.seqlens_k {
            self.update_seqlens_k().for_tensor(SEQLENS_K)?;
            inputs.set(index, self.seqlens_k.clone().into());
        }

        if let Some(index) = self.indices.total_sequence_length {
            self.total_sequence_length
                .buffer()
                .host_mut()
                .for_tensor(TOTAL_SEQUENCE_LENGTH)?[0] = current_length as i32;
            inputs.set(index, self.total_sequence_length.clone().into());
        }

        if let Some(index) = self.indices.attention_mask {
            let tensor = match &mut self.typed {
                Typed::Int32(t) => t.update_attention_mask(&self.env, current_length),
                Typed::Int64(t) => t.update_attention_mask(&self.env, current_length),
            }
            .for_tensor(ATTENTION_MASK)?;
            inputs.set(index, tensor);
        }

        self.length = current_length;
        Ok(())
    }

    fn update_seqlens_k(&mut self) -> Result<(), DeviceError> {
        if self.is_first_seqlens_k_update {
            // The lengths after the prompt are the initial ones. They are
            // moved into device memory unchanged.
            self.seqlens_k = self.env.materialize(
                &self.seqlens_k_next,
                &[self.env.batch_beam_size],
                self.static_seqlens_k.as_ref(),
            )?;
            self.is_first_seqlens_k_update = false;
        } else {
            self.env.increment(&self.seqlens_k, &self.seqlens_k_next)?;
        }
        Ok(())
    }

    /// Current position ids tensor.
    pub fn position_ids(&self) -> AnyTensor {
        match &self.typed {
            Typed::Int32(t) => t.position_ids.clone().into(),
            Typed::Int64(t) => t.position_ids.clone().into(),
        }
    }

    /// Current attention mask tensor.
    pub fn attention_mask(&self) -> AnyTensor {
        match &self.typed {
            Typed::Int32(t) => t.attention_mask.clone().into(),
            Typed::Int64(t) => t.attention_mask.clone().into(),
        }
    }

    pub fn seqlens_k(&self) -> &DeviceTensor<i32> {
        &self.seqlens_k
    }

    pub fn total_sequence_length(&self) -> &DeviceTensor<i32> {
        &self.total_sequence_length
    }
}
