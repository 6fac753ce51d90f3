use convnet_tensor::{Tensor4, TensorAllocator};
use num_traits::Float;

use crate::error::NnError;

/// Spatial size of the pooling output for the given input, window and stride.
///
/// Pooling is valid-style: windows must lie fully inside the input.
fn pool_output_size(
    input: (usize, usize),
    window: (usize, usize),
    stride: (usize, usize),
) -> Result<(usize, usize), NnError> {
    if window.0 == 0 || window.1 == 0 || stride.0 == 0 || stride.1 == 0 {
        return Err(NnError::ZeroWindowOrStride(window, stride));
    }
    if window.0 > input.0 || window.1 > input.1 {
        return Err(NnError::KernelTooLarge(
            window.0, window.1, input.0, input.1,
        ));
    }
    Ok((
        (input.0 - window.0) / stride.0 + 1,
        (input.1 - window.1) / stride.1 + 1,
    ))
}

/// Computes a 2D max pooling pass.
///
/// Every output element is the maximum of its `(p1, p2)` input window, per
/// batch item and channel. Windows must lie fully inside the input; with
/// `stride < window` they overlap.
///
/// # Arguments
///
/// * `src` - Input tensor of shape `[N, H1, W1, C]`.
/// * `window` - The pooling window size `(p1, p2)`.
/// * `stride` - The window step `(s1, s2)`.
///
/// # Returns
///
/// A freshly allocated tensor of shape `[N, H2, W2, C]` with
/// `H2 = (H1 - p1)/s1 + 1` and `W2 = (W1 - p2)/s2 + 1`.
///
/// # Errors
///
/// Returns [`NnError::ZeroWindowOrStride`] for a zero window or stride
/// component and [`NnError::KernelTooLarge`] when the window exceeds the
/// input extent.
///
/// # Example
///
/// ```
/// use convnet_nn::pool2d::max_pool2d;
/// use convnet_tensor::{CpuAllocator, Tensor4};
///
/// let src = Tensor4::<f64, CpuAllocator>::from_shape_vec(
///     [1, 2, 2, 1],
///     vec![1.0, 4.0, 3.0, 2.0],
///     CpuAllocator,
/// ).unwrap();
/// let dst = max_pool2d(&src, (2, 2), (2, 2)).unwrap();
/// assert_eq!(dst.shape, [1, 1, 1, 1]);
/// assert_eq!(dst.as_slice(), &[4.0]);
/// ```
pub fn max_pool2d<T, A>(
    src: &Tensor4<T, A>,
    window: (usize, usize),
    stride: (usize, usize),
) -> Result<Tensor4<T, A>, NnError>
where
    T: Float,
    A: TensorAllocator,
{
    let [batch, src_h, src_w, channels] = src.shape;
    let (dst_h, dst_w) = pool_output_size((src_h, src_w), window, stride)?;

    let mut dst = Tensor4::from_shape_val(
        [batch, dst_h, dst_w, channels],
        T::zero(),
        src.storage.alloc().clone(),
    );

    let dst_data = dst.as_slice_mut();
    for n in 0..batch {
        for h in 0..dst_h {
            for w in 0..dst_w {
                for c in 0..channels {
                    let mut best = T::neg_infinity();
                    for i in 0..window.0 {
                        for j in 0..window.1 {
                            let val =
                                *src.get_unchecked([n, h * stride.0 + i, w * stride.1 + j, c]);
                            if val > best {
                                best = val;
                            }
                        }
                    }
                    dst_data[((n * dst_h + h) * dst_w + w) * channels + c] = best;
                }
            }
        }
    }

    Ok(dst)
}

/// Computes the backward pass of a 2D max pooling layer.
///
/// Each upstream gradient element is routed to the input position holding
/// its window maximum; on ties the first occurrence in row-major window
/// order wins. Contributions accumulate, since overlapping windows (stride
/// smaller than the window) may select the same input position.
///
/// # Arguments
///
/// * `src` - Input tensor of shape `[N, H1, W1, C]` from the forward pass.
/// * `grad_output` - Upstream gradient of shape `[N, H2, W2, C]`.
/// * `window` - The pooling window size used by the forward pass.
/// * `stride` - The window step used by the forward pass.
///
/// # Errors
///
/// Returns [`NnError::ShapeMismatch`] when `grad_output` does not have the
/// shape the forward pass would have produced, plus the window/stride
/// errors of [`max_pool2d`].
pub fn max_pool2d_backward<T, A>(
    src: &Tensor4<T, A>,
    grad_output: &Tensor4<T, A>,
    window: (usize, usize),
    stride: (usize, usize),
) -> Result<Tensor4<T, A>, NnError>
where
    T: Float,
    A: TensorAllocator,
{
    let [batch, src_h, src_w, channels] = src.shape;
    let (dst_h, dst_w) = pool_output_size((src_h, src_w), window, stride)?;
    let expected = [batch, dst_h, dst_w, channels];
    if grad_output.shape != expected {
        return Err(NnError::ShapeMismatch(
            grad_output.shape.to_vec(),
            expected.to_vec(),
        ));
    }

    let mut grad_src = Tensor4::from_shape_val(src.shape, T::zero(), src.storage.alloc().clone());
    let dx = grad_src.as_slice_mut();
    for n in 0..batch {
        for h in 0..dst_h {
            for w in 0..dst_w {
                for c in 0..channels {
                    let mut best_y = h * stride.0;
                    let mut best_x = w * stride.1;
                    let mut best = *src.get_unchecked([n, best_y, best_x, c]);
                    for i in 0..window.0 {
                        for j in 0..window.1 {
                            let y = h * stride.0 + i;
                            let x = w * stride.1 + j;
                            let val = *src.get_unchecked([n, y, x, c]);
                            if val > best {
                                best = val;
                                best_y = y;
                                best_x = x;
                            }
                        }
                    }
                    let idx = ((n * src_h + best_y) * src_w + best_x) * channels + c;
                    dx[idx] = dx[idx] + *grad_output.get_unchecked([n, h, w, c]);
                }
            }
        }
    }

    Ok(grad_src)
}

/// Computes a 2D average pooling pass.
///
/// Every output element is the mean of its `(p1, p2)` input window, per
/// batch item and channel.
///
/// # Arguments
///
/// * `src` - Input tensor of shape `[N, H1, W1, C]`.
/// * `window` - The pooling window size `(p1, p2)`.
/// * `stride` - The window step `(s1, s2)`.
///
/// # Errors
///
/// Same as [`max_pool2d`].
pub fn avg_pool2d<T, A>(
    src: &Tensor4<T, A>,
    window: (usize, usize),
    stride: (usize, usize),
) -> Result<Tensor4<T, A>, NnError>
where
    T: Float,
    A: TensorAllocator,
{
    let [batch, src_h, src_w, channels] = src.shape;
    let (dst_h, dst_w) = pool_output_size((src_h, src_w), window, stride)?;
    let area = T::from(window.0 * window.1).expect("window area must be representable in T");

    let mut dst = Tensor4::from_shape_val(
        [batch, dst_h, dst_w, channels],
        T::zero(),
        src.storage.alloc().clone(),
    );

    let dst_data = dst.as_slice_mut();
    for n in 0..batch {
        for h in 0..dst_h {
            for w in 0..dst_w {
                for c in 0..channels {
                    let mut sum = T::zero();
                    for i in 0..window.0 {
                        for j in 0..window.1 {
                            sum = sum
                                + *src.get_unchecked([n, h * stride.0 + i, w * stride.1 + j, c]);
                        }
                    }
                    dst_data[((n * dst_h + h) * dst_w + w) * channels + c] = sum / area;
                }
            }
        }
    }

    Ok(dst)
}

/// Computes the backward pass of a 2D average pooling layer.
///
/// Each upstream gradient element is spread uniformly over its window:
/// every input position of the window receives `grad / (p1 * p2)`,
/// accumulated over overlapping windows.
///
/// # Arguments
///
/// * `grad_output` - Upstream gradient of shape `[N, H2, W2, C]`.
/// * `input_size` - Spatial size `(H1, W1)` of the forward-pass input.
/// * `window` - The pooling window size used by the forward pass.
/// * `stride` - The window step used by the forward pass.
///
/// # Errors
///
/// Returns [`NnError::ShapeMismatch`] when `grad_output` does not have the
/// shape the forward pass would have produced for `input_size`, plus the
/// window/stride errors of [`avg_pool2d`].
pub fn avg_pool2d_backward<T, A>(
    grad_output: &Tensor4<T, A>,
    input_size: (usize, usize),
    window: (usize, usize),
    stride: (usize, usize),
) -> Result<Tensor4<T, A>, NnError>
where
    T: Float,
    A: TensorAllocator,
{
    let [batch, dst_h, dst_w, channels] = grad_output.shape;
    let (expected_h, expected_w) = pool_output_size(input_size, window, stride)?;
    if (dst_h, dst_w) != (expected_h, expected_w) {
        return Err(NnError::ShapeMismatch(
            grad_output.shape.to_vec(),
            vec![batch, expected_h, expected_w, channels],
        ));
    }
    let area = T::from(window.0 * window.1).expect("window area must be representable in T");

    let mut grad_src = Tensor4::from_shape_val(
        [batch, input_size.0, input_size.1, channels],
        T::zero(),
        grad_output.storage.alloc().clone(),
    );

    let dx = grad_src.as_slice_mut();
    for n in 0..batch {
        for h in 0..dst_h {
            for w in 0..dst_w {
                for c in 0..channels {
                    let share = *grad_output.get_unchecked([n, h, w, c]) / area;
                    for i in 0..window.0 {
                        for j in 0..window.1 {
                            let idx = ((n * input_size.0 + h * stride.0 + i) * input_size.1
                                + w * stride.1
                                + j)
                                * channels
                                + c;
                            dx[idx] = dx[idx] + share;
                        }
                    }
                }
            }
        }
    }

    Ok(grad_src)
}
