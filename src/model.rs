//! Abstraction over the inference engine that executes the model.

use std::error::Error;

use rten_tensor::NdTensor;

use crate::buffer::{AnyTensor, DataType};
use crate::device::ExecutionQueue;

/// Information about the inputs a loaded model declares.
pub trait SessionInfo {
    /// Return true if the model has an input called `name`.
    fn has_input(&self, name: &str) -> bool;

    /// Return the element type of input `name`, if the model has it.
    fn input_type(&self, name: &str) -> Option<DataType>;
}

/// A model that can be run by a [`Generator`](crate::Generator).
pub trait Model: SessionInfo {
    /// Run one forward pass.
    ///
    /// `inputs` holds the named inputs in the order they were registered.
    /// Work is issued on `queue`. Returns logits with shape `(batch_beam,
    /// sequence, vocab)`.
    fn run(
        &self,
        inputs: &ModelInputs,
        queue: &dyn ExecutionQueue,
    ) -> Result<NdTensor<f32, 3>, Box<dyn Error>>;
}

/// Ordered list of named model inputs.
///
/// Components register an input once with [`push`](Self::push) and keep the
/// returned index to rebind the input with [`set`](Self::set) when its
/// tensor is replaced.
#[derive(Clone, Debug, Default)]
pub struct ModelInputs {
    names: Vec<String>,
    values: Vec<AnyTensor>,
}

impl ModelInputs {
    pub fn new() -> ModelInputs {
        ModelInputs::default()
    }

    /// Append an input and return its index.
    pub fn push(&mut self, name: &str, value: AnyTensor) -> usize {
        self.names.push(name.to_string());
        self.values.push(value);
        self.values.len() - 1
    }

    /// Replace the tensor bound to the input at `index`.
    pub fn set(&mut self, index: usize, value: AnyTensor) {
        self.values[index] = value;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Find the tensor bound to input `name`.
    pub fn get(&self, name: &str) -> Option<&AnyTensor> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|index| &self.values[index])
    }

    /// Names of the inputs in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(|n| n.as_str())
    }

    /// Iterate over `(name, tensor)` pairs in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AnyTensor)> {
        self.names.iter().map(|n| n.as_str()).zip(&self.values)
    }
}

#[cfg(test)]
mod tests {
    use super::ModelInputs;
    use crate::buffer::{AllocatorExt, AnyTensor, Location, MemoryAllocator};

    #[test]
    fn test_model_inputs() {
        let alloc = MemoryAllocator::new(Location::Host);
        let mut inputs = ModelInputs::new();
        let ids = alloc.alloc_tensor::<i32>(&[1, 4]).unwrap();
        let mask = alloc.alloc_tensor::<i64>(&[1, 4]).unwrap();
        let ids = inputs.push("input_ids", ids.into());
        let mask = inputs.push("attention_mask", mask.into());
        assert_eq!((ids, mask), (0, 1));

        inputs.set(mask, alloc.alloc_tensor::<i64>(&[1, 5]).unwrap().into());

        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs.names().collect::<Vec<_>>(), ["input_ids", "attention_mask"]);
        assert_eq!(inputs.get("attention_mask").map(AnyTensor::shape), Some([1, 5].as_slice()));
        assert!(inputs.get("position_ids").is_none());
    }
}
