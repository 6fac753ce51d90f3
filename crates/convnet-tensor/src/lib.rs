#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! # Overview
//!
//! `convnet-tensor` provides an owned, dense, row-major multi-dimensional
//! array type with compile-time rank checking via const generics. It is the
//! storage and indexing layer under the `convnet-nn` kernels: element access
//! goes through the tensor's shape and strides, never through hand-written
//! offset arithmetic at the call sites.
//!
//! # Quick Start
//!
//! ```rust
//! use convnet_tensor::{CpuAllocator, Tensor};
//!
//! // Create a 2x3 tensor from a vector
//! let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
//! let tensor = Tensor::<f64, 2, _>::from_shape_vec([2, 3], data, CpuAllocator).unwrap();
//!
//! // Access elements
//! assert_eq!(tensor.get([0, 0]), Some(&1.0));
//! assert_eq!(tensor.get([1, 2]), Some(&6.0));
//! assert_eq!(tensor.strides, [3, 1]);
//! ```

/// Allocator module containing memory management utilities.
pub mod allocator;

/// Storage module containing the memory buffer implementation.
pub mod storage;

/// Tensor module containing the main tensor implementation and error types.
pub mod tensor;

pub use crate::allocator::{CpuAllocator, TensorAllocator, TensorAllocatorError};
pub use crate::tensor::{Tensor, TensorError};

/// Type alias for a 1-dimensional tensor.
pub type Tensor1<T, A> = Tensor<T, 1, A>;

/// Type alias for a 2-dimensional tensor.
pub type Tensor2<T, A> = Tensor<T, 2, A>;

/// Type alias for a 3-dimensional tensor.
pub type Tensor3<T, A> = Tensor<T, 3, A>;

/// Type alias for a 4-dimensional tensor.
pub type Tensor4<T, A> = Tensor<T, 4, A>;

/// Type alias for a 4-dimensional tensor with CPU allocator.
pub type CpuTensor4<T> = Tensor4<T, CpuAllocator>;
