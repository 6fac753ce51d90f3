#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! The crate implements the dense numerical kernels of a stride-1,
//! dilation-1 convolutional layer over row-major NHWC tensors: the forward
//! correlation plus bias, and the adjoint backward pass producing input,
//! filter and bias gradients. Max and average pooling kernels with their
//! backward passes complete the set. Serial kernels have rayon-parallel
//! siblings producing identical results.

/// 2D convolution kernels module.
pub mod conv2d;

/// Error types for the neural network operators.
pub mod error;

/// Padding policy for the convolution kernels.
pub mod padding;

/// 2D pooling kernels module.
pub mod pool2d;

pub use crate::error::NnError;
pub use crate::padding::Padding;
