use std::error::Error;

use crate::config::ConfigError;
use crate::device::DeviceError;

/// Errors that occur when creating or running a [`Generator`](crate::Generator)
/// or one of the components it drives.
#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A buffer, allocator or queue operation failed while updating the
    /// named tensor.
    #[error("device error updating {tensor}: {source}")]
    Device {
        tensor: &'static str,
        #[source]
        source: DeviceError,
    },

    /// The attention mask was updated with a length that does not follow
    /// its current width, which means a step was skipped or repeated.
    #[error("attention mask has {width} columns but current length is {current_length}")]
    MaskWidth { width: usize, current_length: usize },

    /// Tokens were appended to sequences that are already `max_length` long.
    #[error("sequences have reached the maximum length of {0}")]
    MaxLengthReached(usize),

    /// The model returned logits of an unexpected shape.
    #[error("expected logits with shape {expected:?}, got {actual:?}")]
    LogitsShape {
        expected: [usize; 3],
        actual: [usize; 3],
    },

    /// The model failed to run.
    #[error("model error: {0}")]
    Model(Box<dyn Error>),

    /// An operation was called in a state where it is not defined.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// Attach the name of the tensor being updated to device errors.
pub(crate) trait DeviceResultExt<T> {
    fn for_tensor(self, tensor: &'static str) -> Result<T, GenerateError>;
}

impl<T> DeviceResultExt<T> for Result<T, DeviceError> {
    fn for_tensor(self, tensor: &'static str) -> Result<T, GenerateError> {
        self.map_err(|source| GenerateError::Device { tensor, source })
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{DeviceResultExt, GenerateError};
    use crate::device::{Device, DeviceError};

    #[test]
    fn test_device_error_names_tensor() {
        let result: Result<(), DeviceError> = Err(DeviceError::Unsupported {
            op: "increment",
            device: Device::Dml,
        });
        let err = result.for_tensor("position_ids").err().unwrap();

        assert!(matches!(
            err,
            GenerateError::Device {
                tensor: "position_ids",
                ..
            }
        ));
        assert_eq!(
            err.to_string(),
            "device error updating position_ids: increment is not supported on dml"
        );
        assert!(err.source().is_some());
    }
}
