use thiserror::Error;

use crate::allocator::TensorAllocator;
use crate::storage::TensorStorage;

/// An error type for tensor operations.
#[derive(Error, Debug, PartialEq)]
pub enum TensorError {
    /// Tensor shape does not match the provided data.
    #[error("Shape mismatch: expected {expected} elements for shape, but got {actual} elements in data")]
    InvalidShape {
        /// Expected number of elements based on the shape.
        expected: usize,
        /// Actual number of elements in the data.
        actual: usize,
    },

    /// Index exceeds tensor bounds.
    #[error("Index {index} out of bounds for tensor with {size} elements")]
    IndexOutOfBounds {
        /// The invalid index that was attempted.
        index: usize,
        /// The number of addressable elements.
        size: usize,
    },
}

impl TensorError {
    /// Creates an `InvalidShape` error with clear context.
    pub fn invalid_shape(expected: usize, actual: usize) -> Self {
        Self::InvalidShape { expected, actual }
    }

    /// Creates an `IndexOutOfBounds` error with clear context.
    pub fn index_out_of_bounds(index: usize, size: usize) -> Self {
        Self::IndexOutOfBounds { index, size }
    }
}

/// Computes the strides for a row-major (C-contiguous) tensor layout.
///
/// The rightmost dimension has stride 1, and each dimension's stride is the
/// product of all dimensions to its right.
///
/// # Arguments
///
/// * `shape` - The shape of the tensor.
///
/// # Returns
///
/// An array of strides corresponding to each dimension.
///
/// # Examples
///
/// ```rust
/// use convnet_tensor::tensor::get_strides_from_shape;
///
/// let strides = get_strides_from_shape([2, 3]);
/// assert_eq!(strides, [3, 1]);
///
/// let strides = get_strides_from_shape([2, 3, 4]);
/// assert_eq!(strides, [12, 4, 1]);
/// ```
pub fn get_strides_from_shape<const N: usize>(shape: [usize; N]) -> [usize; N] {
    let mut strides: [usize; N] = [0; N];
    let mut stride = 1;
    for i in (0..shape.len()).rev() {
        strides[i] = stride;
        stride *= shape[i];
    }
    strides
}

/// A multi-dimensional array with owned, dense, row-major data.
///
/// The tensor combines a storage buffer, a shape and the strides describing
/// the memory layout, with the rank checked at compile time through the `N`
/// const generic. Element access resolves multi-dimensional indices against
/// the strides, so callers never deal in linearized offsets.
///
/// # Examples
///
/// ```rust
/// use convnet_tensor::{CpuAllocator, Tensor2};
///
/// let data: Vec<u8> = vec![1, 2, 3, 4];
/// let t = Tensor2::<u8, CpuAllocator>::from_shape_vec([2, 2], data, CpuAllocator).unwrap();
/// assert_eq!(t.shape, [2, 2]);
/// ```
pub struct Tensor<T, const N: usize, A: TensorAllocator> {
    /// The storage of the tensor.
    pub storage: TensorStorage<T, A>,
    /// The shape of the tensor.
    pub shape: [usize; N],
    /// The strides of the tensor data in memory.
    pub strides: [usize; N],
}

impl<T, const N: usize, A: TensorAllocator> Tensor<T, N, A> {
    /// Creates a new `Tensor` with the given shape and data.
    ///
    /// # Arguments
    ///
    /// * `shape` - An array containing the shape of the tensor.
    /// * `data` - A vector containing the data of the tensor.
    /// * `alloc` - The allocator owning the tensor memory.
    ///
    /// # Errors
    ///
    /// If the number of elements in the data does not match the shape of the
    /// tensor, an error is returned.
    ///
    /// # Example
    ///
    /// ```
    /// use convnet_tensor::{CpuAllocator, Tensor2};
    ///
    /// let data: Vec<u8> = vec![1, 2, 3, 4];
    /// let t = Tensor2::<u8, CpuAllocator>::from_shape_vec([2, 2], data, CpuAllocator).unwrap();
    /// assert_eq!(t.shape, [2, 2]);
    /// ```
    pub fn from_shape_vec(shape: [usize; N], data: Vec<T>, alloc: A) -> Result<Self, TensorError> {
        let numel = shape.iter().product::<usize>();
        if numel != data.len() {
            return Err(TensorError::invalid_shape(numel, data.len()));
        }
        let storage = TensorStorage::from_vec(data, alloc);
        let strides = get_strides_from_shape(shape);
        Ok(Self {
            storage,
            shape,
            strides,
        })
    }

    /// Creates a new `Tensor` with the given shape and slice of data.
    ///
    /// # Errors
    ///
    /// If the number of elements in the data does not match the shape of the
    /// tensor, an error is returned.
    pub fn from_shape_slice(shape: [usize; N], data: &[T], alloc: A) -> Result<Self, TensorError>
    where
        T: Clone,
    {
        let numel = shape.iter().product::<usize>();
        if numel != data.len() {
            return Err(TensorError::invalid_shape(numel, data.len()));
        }
        Self::from_shape_vec(shape, data.to_vec(), alloc)
    }

    /// Creates a new `Tensor` with the given shape, filled with a constant value.
    ///
    /// # Example
    ///
    /// ```
    /// use convnet_tensor::{CpuAllocator, Tensor1};
    ///
    /// let t = Tensor1::<u8, CpuAllocator>::from_shape_val([4], 0, CpuAllocator);
    /// assert_eq!(t.as_slice(), &[0, 0, 0, 0]);
    /// ```
    pub fn from_shape_val(shape: [usize; N], value: T, alloc: A) -> Self
    where
        T: Clone,
    {
        let numel = shape.iter().product::<usize>();
        let storage = TensorStorage::from_vec(vec![value; numel], alloc);
        let strides = get_strides_from_shape(shape);
        Self {
            storage,
            shape,
            strides,
        }
    }

    /// Creates a new `Tensor` with the given shape and a function generating
    /// the element for each multi-dimensional index.
    ///
    /// # Example
    ///
    /// ```
    /// use convnet_tensor::{CpuAllocator, Tensor2};
    ///
    /// let t = Tensor2::<u8, CpuAllocator>::from_shape_fn([2, 2], CpuAllocator, |[i, j]| (i * 2 + j) as u8);
    /// assert_eq!(t.as_slice(), &[0, 1, 2, 3]);
    /// ```
    pub fn from_shape_fn<F>(shape: [usize; N], alloc: A, f: F) -> Self
    where
        F: Fn([usize; N]) -> T,
    {
        let numel = shape.iter().product::<usize>();
        let data: Vec<T> = (0..numel)
            .map(|i| {
                let mut index = [0; N];
                let mut j = i;
                for k in (0..N).rev() {
                    index[k] = j % shape[k];
                    j /= shape[k];
                }
                f(index)
            })
            .collect();
        let storage = TensorStorage::from_vec(data, alloc);
        let strides = get_strides_from_shape(shape);
        Self {
            storage,
            shape,
            strides,
        }
    }

    /// Returns the data of the tensor as a slice.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        self.storage.as_slice()
    }

    /// Returns the data of the tensor as a mutable slice.
    #[inline]
    pub fn as_slice_mut(&mut self) -> &mut [T] {
        self.storage.as_mut_slice()
    }

    /// Consumes the tensor and returns the underlying vector.
    #[inline]
    pub fn into_vec(self) -> Vec<T> {
        self.storage.into_vec()
    }

    /// Returns the number of elements in the tensor.
    #[inline]
    pub fn numel(&self) -> usize {
        self.storage.len()
    }

    /// Returns an iterator over the elements of the tensor in memory order.
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    /// Returns a mutable iterator over the elements of the tensor in memory order.
    #[inline]
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.as_slice_mut().iter_mut()
    }

    /// Gets the linear offset of the element at the given index, or `None`
    /// when any coordinate is out of bounds.
    pub fn get_iter_offset(&self, index: [usize; N]) -> Option<usize> {
        let mut offset = 0;
        for ((&idx, dim_size), stride) in index.iter().zip(self.shape).zip(self.strides) {
            if idx >= dim_size {
                return None;
            }
            offset += idx * stride;
        }
        Some(offset)
    }

    /// Gets the linear offset of the element at the given index without
    /// checking dimension sizes.
    #[inline]
    pub fn get_iter_offset_unchecked(&self, index: [usize; N]) -> usize {
        let mut offset = 0;
        for (&idx, stride) in index.iter().zip(self.strides) {
            offset += idx * stride;
        }
        offset
    }

    /// Gets the element at the given index, or `None` when the index is out
    /// of bounds.
    ///
    /// # Example
    ///
    /// ```
    /// use convnet_tensor::{CpuAllocator, Tensor2};
    ///
    /// let data: Vec<u8> = vec![1, 2, 3, 4];
    /// let t = Tensor2::<u8, CpuAllocator>::from_shape_vec([2, 2], data, CpuAllocator).unwrap();
    /// assert_eq!(t.get([1, 0]), Some(&3));
    /// assert_eq!(t.get([2, 0]), None);
    /// ```
    pub fn get(&self, index: [usize; N]) -> Option<&T> {
        let offset = self.get_iter_offset(index)?;
        self.as_slice().get(offset)
    }

    /// Gets a mutable reference to the element at the given index, or `None`
    /// when the index is out of bounds.
    pub fn get_mut(&mut self, index: [usize; N]) -> Option<&mut T> {
        let offset = self.get_iter_offset(index)?;
        self.as_slice_mut().get_mut(offset)
    }

    /// Gets the element at the given index without checking if the index is
    /// out of bounds.
    ///
    /// # Example
    ///
    /// ```
    /// use convnet_tensor::{CpuAllocator, Tensor2};
    ///
    /// let data: Vec<u8> = vec![1, 2, 3, 4];
    /// let t = Tensor2::<u8, CpuAllocator>::from_shape_vec([2, 2], data, CpuAllocator).unwrap();
    /// assert_eq!(*t.get_unchecked([0, 1]), 2);
    /// ```
    #[inline]
    pub fn get_unchecked(&self, index: [usize; N]) -> &T {
        let offset = self.get_iter_offset_unchecked(index);
        unsafe { self.as_slice().get_unchecked(offset) }
    }

    /// Gets a mutable reference to the element at the given index without
    /// checking if the index is out of bounds.
    #[inline]
    pub fn get_unchecked_mut(&mut self, index: [usize; N]) -> &mut T {
        let offset = self.get_iter_offset_unchecked(index);
        unsafe { self.storage.as_mut_slice().get_unchecked_mut(offset) }
    }

    /// Applies a function to each element of the tensor, producing a new
    /// tensor of the same shape on the same allocator.
    ///
    /// # Example
    ///
    /// ```
    /// use convnet_tensor::{CpuAllocator, Tensor1};
    ///
    /// let t = Tensor1::<f32, CpuAllocator>::from_shape_val([3], 1.0, CpuAllocator);
    /// let doubled = t.map(|&x| x * 2.0);
    /// assert_eq!(doubled.as_slice(), &[2.0, 2.0, 2.0]);
    /// ```
    pub fn map<U, F>(&self, f: F) -> Tensor<U, N, A>
    where
        F: Fn(&T) -> U,
    {
        let data: Vec<U> = self.as_slice().iter().map(f).collect();
        Tensor {
            storage: TensorStorage::from_vec(data, self.storage.alloc().clone()),
            shape: self.shape,
            strides: self.strides,
        }
    }
}

impl<T, const N: usize, A: TensorAllocator> Clone for Tensor<T, N, A>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            shape: self.shape,
            strides: self.strides,
        }
    }
}
