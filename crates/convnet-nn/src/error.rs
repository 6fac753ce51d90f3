use convnet_tensor::TensorError;
use thiserror::Error;

/// An error type for the neural network operators.
#[derive(Error, Debug, PartialEq)]
pub enum NnError {
    /// Two tensors disagree on a shared dimension, or a gradient tensor does
    /// not have the shape the forward pass would have produced.
    #[error("Shape mismatch: {0:?} != {1:?}")]
    ShapeMismatch(Vec<usize>, Vec<usize>),

    /// The padding mode string is not one of the supported modes.
    #[error("Invalid padding mode: expected \"same\" or \"valid\", got {0:?}")]
    InvalidPaddingMode(String),

    /// The kernel or pooling window does not fit in the input, so the output
    /// would have a non-positive spatial dimension.
    #[error("Kernel size ({0}, {1}) does not fit in input of size ({2}, {3})")]
    KernelTooLarge(usize, usize, usize, usize),

    /// A pooling window or stride has a zero component.
    #[error("Pooling window {0:?} and stride {1:?} must be non-zero")]
    ZeroWindowOrStride((usize, usize), (usize, usize)),

    /// Tensor error.
    #[error("Error with the tensor: {0}")]
    TensorError(#[from] TensorError),
}
