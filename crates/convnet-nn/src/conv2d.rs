use convnet_tensor::{Tensor1, Tensor4, TensorAllocator};
use num_traits::Float;
use rayon::prelude::*;

use crate::error::NnError;
use crate::padding::Padding;

/// Loop extents shared by the forward and backward passes.
#[derive(Clone, Copy)]
struct ConvGeometry {
    batch: usize,
    src_h: usize,
    src_w: usize,
    src_c: usize,
    kernel_h: usize,
    kernel_w: usize,
    out_c: usize,
    dst_h: usize,
    dst_w: usize,
}

fn conv_geometry<T, A>(
    src: &Tensor4<T, A>,
    filters: &Tensor4<T, A>,
    padding: Padding,
) -> Result<ConvGeometry, NnError>
where
    T: Float,
    A: TensorAllocator,
{
    let [batch, src_h, src_w, src_c] = src.shape;
    let [kernel_h, kernel_w, in_c, out_c] = filters.shape;

    if src_c != in_c {
        return Err(NnError::ShapeMismatch(
            src.shape.to_vec(),
            filters.shape.to_vec(),
        ));
    }

    let (dst_h, dst_w) = padding.output_size((src_h, src_w), (kernel_h, kernel_w))?;

    Ok(ConvGeometry {
        batch,
        src_h,
        src_w,
        src_c,
        kernel_h,
        kernel_w,
        out_c,
        dst_h,
        dst_w,
    })
}

fn backward_geometry<T, A>(
    src: &Tensor4<T, A>,
    filters: &Tensor4<T, A>,
    grad_output: &Tensor4<T, A>,
    padding: Padding,
) -> Result<ConvGeometry, NnError>
where
    T: Float,
    A: TensorAllocator,
{
    let g = conv_geometry(src, filters, padding)?;
    let expected = [g.batch, g.dst_h, g.dst_w, g.out_c];
    if grad_output.shape != expected {
        return Err(NnError::ShapeMismatch(
            grad_output.shape.to_vec(),
            expected.to_vec(),
        ));
    }
    Ok(g)
}

/// Computes one output row (fixed batch item and output row index) of the
/// forward correlation into `dst_row`, a slice of length `dst_w * out_c`.
///
/// The kernel index ranges are clamped on both ends so the implied input
/// coordinate stays inside the input extent; out-of-range coordinates are
/// the virtual zero padding and contribute nothing.
fn forward_row<T, A>(
    src: &Tensor4<T, A>,
    filters: &Tensor4<T, A>,
    bias: &[T],
    dst_row: &mut [T],
    g: &ConvGeometry,
    pad: (usize, usize),
    n: usize,
    h: usize,
) where
    T: Float,
    A: TensorAllocator,
{
    let i_min = pad.0.saturating_sub(h);
    let i_max = g.kernel_h.min((g.src_h + pad.0).saturating_sub(h));
    for w in 0..g.dst_w {
        let j_min = pad.1.saturating_sub(w);
        let j_max = g.kernel_w.min((g.src_w + pad.1).saturating_sub(w));
        for c2 in 0..g.out_c {
            let mut sum = T::zero();
            for c1 in 0..g.src_c {
                for i in i_min..i_max {
                    let src_y = h + i - pad.0;
                    for j in j_min..j_max {
                        let src_x = w + j - pad.1;
                        sum = sum
                            + *src.get_unchecked([n, src_y, src_x, c1])
                                * *filters.get_unchecked([i, j, c1, c2]);
                    }
                }
            }
            dst_row[w * g.out_c + c2] = bias[c2] + sum;
        }
    }
}

/// Adds batch item `n`'s contribution to the bias gradient.
///
/// Per output channel the traversal is increasing row, then column, so the
/// floating-point summation order is fixed and reproducible.
fn bias_gradient_item<T, A>(grad_output: &Tensor4<T, A>, db: &mut [T], g: &ConvGeometry, n: usize)
where
    T: Float,
    A: TensorAllocator,
{
    for (c2, acc) in db.iter_mut().enumerate() {
        let mut sum = T::zero();
        for h2 in 0..g.dst_h {
            for w2 in 0..g.dst_w {
                sum = sum + *grad_output.get_unchecked([n, h2, w2, c2]);
            }
        }
        *acc = *acc + sum;
    }
}

/// Scatter-accumulates the input gradient of batch item `n` into `dx_item`,
/// a slice of length `src_h * src_w * src_c`.
///
/// The contributing kernel value is the 180-degree rotated
/// `K[k1-i-1, k2-j-1, c1, c2]`; the row/column ranges are clamped so the
/// corresponding upstream-gradient index stays in bounds (outside it is
/// implicitly zero).
fn input_gradient_item<T, A>(
    filters: &Tensor4<T, A>,
    grad_output: &Tensor4<T, A>,
    dx_item: &mut [T],
    g: &ConvGeometry,
    pad: (usize, usize),
    n: usize,
) where
    T: Float,
    A: TensorAllocator,
{
    for c2 in 0..g.out_c {
        for c1 in 0..g.src_c {
            for i in 0..g.kernel_h {
                let h_min = pad.0.saturating_sub(i);
                let h_max = g.src_h.min((g.dst_h + pad.0).saturating_sub(i));
                for j in 0..g.kernel_w {
                    let w_min = pad.1.saturating_sub(j);
                    let w_max = g.src_w.min((g.dst_w + pad.1).saturating_sub(j));
                    let k_val =
                        *filters.get_unchecked([g.kernel_h - i - 1, g.kernel_w - j - 1, c1, c2]);
                    for h1 in h_min..h_max {
                        let out_y = h1 + i - pad.0;
                        for w1 in w_min..w_max {
                            let out_x = w1 + j - pad.1;
                            let idx = (h1 * g.src_w + w1) * g.src_c + c1;
                            dx_item[idx] = dx_item[idx]
                                + *grad_output.get_unchecked([n, out_y, out_x, c2]) * k_val;
                        }
                    }
                }
            }
        }
    }
}

/// Adds batch item `n`'s contribution to the filter gradient in `dw`, a
/// slice of length `kernel_h * kernel_w * src_c * out_c`.
fn filter_gradient_item<T, A>(
    src: &Tensor4<T, A>,
    grad_output: &Tensor4<T, A>,
    dw: &mut [T],
    g: &ConvGeometry,
    pad: (usize, usize),
    n: usize,
) where
    T: Float,
    A: TensorAllocator,
{
    for i in 0..g.kernel_h {
        let h_min = pad.0.saturating_sub(i);
        let h_max = g.dst_h.min((g.src_h + pad.0).saturating_sub(i));
        for j in 0..g.kernel_w {
            let w_min = pad.1.saturating_sub(j);
            let w_max = g.dst_w.min((g.src_w + pad.1).saturating_sub(j));
            for c1 in 0..g.src_c {
                for c2 in 0..g.out_c {
                    let mut sum = T::zero();
                    for h2 in h_min..h_max {
                        let src_y = h2 + i - pad.0;
                        for w2 in w_min..w_max {
                            let src_x = w2 + j - pad.1;
                            sum = sum
                                + *src.get_unchecked([n, src_y, src_x, c1])
                                    * *grad_output.get_unchecked([n, h2, w2, c2]);
                        }
                    }
                    let idx = ((i * g.kernel_w + j) * g.src_c + c1) * g.out_c + c2;
                    dw[idx] = dw[idx] + sum;
                }
            }
        }
    }
}

/// Computes the forward pass of a stride-1 2D convolution layer.
///
/// Every output element is the correlation of the input window with the
/// filter bank plus the per-channel bias:
///
/// `dst[n,h,w,c2] = bias[c2] + sum over (c1,i,j) of src[n, h+i-pad_x, w+j-pad_y, c1] * filters[i,j,c1,c2]`
///
/// Zero padding is virtual: the kernel index ranges are clamped per output
/// position instead of reading a padded buffer.
///
/// # Arguments
///
/// * `src` - Input tensor of shape `[N, H1, W1, C1]`.
/// * `filters` - Filter bank of shape `[k1, k2, C1, C2]`.
/// * `bias` - Bias tensor of shape `[C2]`.
/// * `padding` - The padding policy determining the output spatial size.
///
/// # Returns
///
/// A freshly allocated output tensor of shape `[N, H2, W2, C2]`.
///
/// # Errors
///
/// Returns [`NnError::ShapeMismatch`] when the channel dimensions disagree,
/// or [`NnError::KernelTooLarge`] when `"valid"` padding yields a
/// non-positive output dimension.
///
/// # Example
///
/// ```
/// use convnet_nn::conv2d::conv2d_forward;
/// use convnet_nn::padding::Padding;
/// use convnet_tensor::{CpuAllocator, Tensor1, Tensor4};
///
/// // 3x3 identity image convolved with a 2x2 diagonal kernel
/// let src = Tensor4::<f64, CpuAllocator>::from_shape_fn(
///     [1, 3, 3, 1],
///     CpuAllocator,
///     |[_, h, w, _]| if h == w { 1.0 } else { 0.0 },
/// );
/// let filters = Tensor4::<f64, CpuAllocator>::from_shape_vec(
///     [2, 2, 1, 1],
///     vec![1.0, 0.0, 0.0, 1.0],
///     CpuAllocator,
/// ).unwrap();
/// let bias = Tensor1::<f64, CpuAllocator>::from_shape_val([1], 0.0, CpuAllocator);
///
/// let dst = conv2d_forward(&src, &filters, &bias, Padding::Valid).unwrap();
/// assert_eq!(dst.shape, [1, 2, 2, 1]);
/// assert_eq!(dst.as_slice(), &[2.0, 0.0, 0.0, 2.0]);
/// ```
pub fn conv2d_forward<T, A>(
    src: &Tensor4<T, A>,
    filters: &Tensor4<T, A>,
    bias: &Tensor1<T, A>,
    padding: Padding,
) -> Result<Tensor4<T, A>, NnError>
where
    T: Float,
    A: TensorAllocator,
{
    let g = conv_geometry(src, filters, padding)?;
    if bias.shape[0] != g.out_c {
        return Err(NnError::ShapeMismatch(bias.shape.to_vec(), vec![g.out_c]));
    }
    let pad = padding.forward_offsets((g.kernel_h, g.kernel_w));

    let mut dst = Tensor4::from_shape_val(
        [g.batch, g.dst_h, g.dst_w, g.out_c],
        T::zero(),
        src.storage.alloc().clone(),
    );

    let row_len = g.dst_w * g.out_c;
    if row_len > 0 {
        for (idx, dst_row) in dst.as_slice_mut().chunks_exact_mut(row_len).enumerate() {
            let (n, h) = (idx / g.dst_h, idx % g.dst_h);
            forward_row(src, filters, bias.as_slice(), dst_row, &g, pad, n, h);
        }
    }

    Ok(dst)
}

/// Computes the forward pass of a stride-1 2D convolution layer in parallel.
///
/// Partitions the output into disjoint `(n, h)` row chunks with rayon;
/// output positions are mutually independent, so the result is bit-identical
/// to [`conv2d_forward`].
///
/// # Arguments
///
/// * `src` - Input tensor of shape `[N, H1, W1, C1]`.
/// * `filters` - Filter bank of shape `[k1, k2, C1, C2]`.
/// * `bias` - Bias tensor of shape `[C2]`.
/// * `padding` - The padding policy determining the output spatial size.
pub fn conv2d_forward_parallel<T, A>(
    src: &Tensor4<T, A>,
    filters: &Tensor4<T, A>,
    bias: &Tensor1<T, A>,
    padding: Padding,
) -> Result<Tensor4<T, A>, NnError>
where
    T: Float + Send + Sync,
    A: TensorAllocator + Sync,
{
    let g = conv_geometry(src, filters, padding)?;
    if bias.shape[0] != g.out_c {
        return Err(NnError::ShapeMismatch(bias.shape.to_vec(), vec![g.out_c]));
    }
    let pad = padding.forward_offsets((g.kernel_h, g.kernel_w));

    let mut dst = Tensor4::from_shape_val(
        [g.batch, g.dst_h, g.dst_w, g.out_c],
        T::zero(),
        src.storage.alloc().clone(),
    );

    let row_len = g.dst_w * g.out_c;
    if row_len > 0 {
        let bias_data = bias.as_slice();
        dst.as_slice_mut()
            .par_chunks_exact_mut(row_len)
            .enumerate()
            .for_each(|(idx, dst_row)| {
                let (n, h) = (idx / g.dst_h, idx % g.dst_h);
                forward_row(src, filters, bias_data, dst_row, &g, pad, n, h);
            });
    }

    Ok(dst)
}

/// Computes the backward pass of a stride-1 2D convolution layer.
///
/// Produces the three gradients of the layer from the upstream gradient,
/// using the adjoint of the forward correlation:
///
/// * the bias gradient, a pure reduction of `grad_output` over batch and
///   spatial dimensions;
/// * the input gradient, a scatter-accumulation with the spatially flipped
///   kernel (a transposed correlation, not a re-run of the forward pass);
/// * the filter gradient, the correlation of the input with the upstream
///   gradient accumulated over the batch.
///
/// All gradients are freshly allocated; the accumulation traverses batch
/// items in increasing order so results are reproducible bit-for-bit.
///
/// # Arguments
///
/// * `src` - Input tensor of shape `[N, H1, W1, C1]` from the forward pass.
/// * `filters` - Filter bank of shape `[k1, k2, C1, C2]`.
/// * `grad_output` - Upstream gradient of shape `[N, H2, W2, C2]`.
/// * `padding` - The padding policy used by the forward pass.
///
/// # Returns
///
/// The tuple `(grad_src, grad_filters, grad_bias)` with the shapes of
/// `src`, `filters` and the bias respectively.
///
/// # Errors
///
/// Returns [`NnError::ShapeMismatch`] when the channel dimensions disagree
/// or `grad_output` does not have the shape the forward pass would have
/// produced, and [`NnError::KernelTooLarge`] when `"valid"` padding yields
/// a non-positive output dimension.
pub fn conv2d_backward<T, A>(
    src: &Tensor4<T, A>,
    filters: &Tensor4<T, A>,
    grad_output: &Tensor4<T, A>,
    padding: Padding,
) -> Result<(Tensor4<T, A>, Tensor4<T, A>, Tensor1<T, A>), NnError>
where
    T: Float,
    A: TensorAllocator,
{
    let g = backward_geometry(src, filters, grad_output, padding)?;
    let pad_dx = padding.input_grad_offsets((g.kernel_h, g.kernel_w));
    let pad_dw = padding.filter_grad_offsets((g.kernel_h, g.kernel_w));

    let alloc = src.storage.alloc().clone();
    let mut grad_src = Tensor4::from_shape_val(src.shape, T::zero(), alloc.clone());
    let mut grad_filters = Tensor4::from_shape_val(filters.shape, T::zero(), alloc.clone());
    let mut grad_bias = Tensor1::from_shape_val([g.out_c], T::zero(), alloc);

    let db = grad_bias.as_slice_mut();
    for n in 0..g.batch {
        bias_gradient_item(grad_output, db, &g, n);
    }

    let item_len = g.src_h * g.src_w * g.src_c;
    if item_len > 0 {
        let dw = grad_filters.as_slice_mut();
        for (n, dx_item) in grad_src
            .as_slice_mut()
            .chunks_exact_mut(item_len)
            .enumerate()
        {
            input_gradient_item(filters, grad_output, dx_item, &g, pad_dx, n);
            filter_gradient_item(src, grad_output, dw, &g, pad_dw, n);
        }
    }

    Ok((grad_src, grad_filters, grad_bias))
}

/// Computes the backward pass of a stride-1 2D convolution layer in parallel.
///
/// The input gradient parallelizes over batch items, whose destination
/// ranges are disjoint; the filter and bias gradients are computed as
/// per-batch-item partial buffers in parallel and combined sequentially in
/// increasing batch order, so the reduction order is canonical and the
/// result is bit-identical to [`conv2d_backward`].
///
/// # Arguments
///
/// * `src` - Input tensor of shape `[N, H1, W1, C1]` from the forward pass.
/// * `filters` - Filter bank of shape `[k1, k2, C1, C2]`.
/// * `grad_output` - Upstream gradient of shape `[N, H2, W2, C2]`.
/// * `padding` - The padding policy used by the forward pass.
pub fn conv2d_backward_parallel<T, A>(
    src: &Tensor4<T, A>,
    filters: &Tensor4<T, A>,
    grad_output: &Tensor4<T, A>,
    padding: Padding,
) -> Result<(Tensor4<T, A>, Tensor4<T, A>, Tensor1<T, A>), NnError>
where
    T: Float + Send + Sync,
    A: TensorAllocator + Sync,
{
    let g = backward_geometry(src, filters, grad_output, padding)?;
    let pad_dx = padding.input_grad_offsets((g.kernel_h, g.kernel_w));
    let pad_dw = padding.filter_grad_offsets((g.kernel_h, g.kernel_w));

    let alloc = src.storage.alloc().clone();
    let mut grad_src = Tensor4::from_shape_val(src.shape, T::zero(), alloc.clone());
    let mut grad_filters = Tensor4::from_shape_val(filters.shape, T::zero(), alloc.clone());
    let mut grad_bias = Tensor1::from_shape_val([g.out_c], T::zero(), alloc);

    let item_len = g.src_h * g.src_w * g.src_c;
    if item_len > 0 {
        grad_src
            .as_slice_mut()
            .par_chunks_exact_mut(item_len)
            .enumerate()
            .for_each(|(n, dx_item)| {
                input_gradient_item(filters, grad_output, dx_item, &g, pad_dx, n);
            });
    }

    let filter_len = g.kernel_h * g.kernel_w * g.src_c * g.out_c;
    let partials: Vec<(Vec<T>, Vec<T>)> = (0..g.batch)
        .into_par_iter()
        .map(|n| {
            let mut dw_part = vec![T::zero(); filter_len];
            let mut db_part = vec![T::zero(); g.out_c];
            filter_gradient_item(src, grad_output, &mut dw_part, &g, pad_dw, n);
            bias_gradient_item(grad_output, &mut db_part, &g, n);
            (dw_part, db_part)
        })
        .collect();

    let dw = grad_filters.as_slice_mut();
    let db = grad_bias.as_slice_mut();
    for (dw_part, db_part) in partials {
        for (acc, v) in dw.iter_mut().zip(dw_part) {
            *acc = *acc + v;
        }
        for (acc, v) in db.iter_mut().zip(db_part) {
            *acc = *acc + v;
        }
    }

    Ok((grad_src, grad_filters, grad_bias))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use convnet_tensor::CpuAllocator;

    fn pseudo_tensor4(shape: [usize; 4], seed: f64) -> Tensor4<f64, CpuAllocator> {
        Tensor4::from_shape_fn(shape, CpuAllocator, |[n, h, w, c]| {
            ((n * 53 + h * 31 + w * 17 + c * 7) as f64 * 0.43 + seed).sin()
        })
    }

    fn dot(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_forward_valid_diagonal_kernel() -> Result<(), NnError> {
        // 3x3 identity image, 2x2 diagonal kernel: each output is the sum of
        // the two diagonal input values in its receptive field
        let src = Tensor4::<f64, CpuAllocator>::from_shape_fn(
            [1, 3, 3, 1],
            CpuAllocator,
            |[_, h, w, _]| if h == w { 1.0 } else { 0.0 },
        );
        let filters = Tensor4::<f64, CpuAllocator>::from_shape_vec(
            [2, 2, 1, 1],
            vec![1.0, 0.0, 0.0, 1.0],
            CpuAllocator,
        )?;
        let bias = Tensor1::<f64, CpuAllocator>::from_shape_val([1], 0.0, CpuAllocator);

        let dst = conv2d_forward(&src, &filters, &bias, Padding::Valid)?;
        assert_eq!(dst.shape, [1, 2, 2, 1]);
        assert_eq!(dst.as_slice(), &[2.0, 0.0, 0.0, 2.0]);
        Ok(())
    }

    #[test]
    fn test_forward_bias_only() -> Result<(), NnError> {
        let src = pseudo_tensor4([2, 4, 5, 3], 0.0);
        let filters =
            Tensor4::<f64, CpuAllocator>::from_shape_val([3, 3, 3, 2], 0.0, CpuAllocator);
        let bias = Tensor1::<f64, CpuAllocator>::from_shape_vec([2], vec![0.7, -1.5], CpuAllocator)?;

        let dst = conv2d_forward(&src, &filters, &bias, Padding::Same)?;
        assert_eq!(dst.shape, [2, 4, 5, 2]);
        for chunk in dst.as_slice().chunks_exact(2) {
            assert_eq!(chunk, &[0.7, -1.5]);
        }
        Ok(())
    }

    #[test]
    fn test_forward_identity_kernel_1x1() -> Result<(), NnError> {
        // 1x1 kernel mixing two input channels into one output channel
        let src = Tensor4::<f64, CpuAllocator>::from_shape_vec(
            [1, 2, 2, 2],
            vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0],
            CpuAllocator,
        )?;
        let filters = Tensor4::<f64, CpuAllocator>::from_shape_vec(
            [1, 1, 2, 1],
            vec![2.0, 3.0],
            CpuAllocator,
        )?;
        let bias = Tensor1::<f64, CpuAllocator>::from_shape_val([1], 0.0, CpuAllocator);

        let dst = conv2d_forward(&src, &filters, &bias, Padding::Valid)?;
        assert_eq!(dst.shape, [1, 2, 2, 1]);
        assert_eq!(dst.as_slice(), &[32.0, 64.0, 96.0, 128.0]);
        Ok(())
    }

    #[test]
    fn test_forward_same_ones_kernel_3x3() -> Result<(), NnError> {
        // zero-padded 3x3 neighborhood sums; exercises the clamps on all
        // four edges, including the upper bounds at the bottom/right
        let src = Tensor4::<f64, CpuAllocator>::from_shape_vec(
            [1, 3, 3, 1],
            (1..=9).map(|x| x as f64).collect(),
            CpuAllocator,
        )?;
        let filters =
            Tensor4::<f64, CpuAllocator>::from_shape_val([3, 3, 1, 1], 1.0, CpuAllocator);
        let bias = Tensor1::<f64, CpuAllocator>::from_shape_val([1], 0.5, CpuAllocator);

        let dst = conv2d_forward(&src, &filters, &bias, Padding::Same)?;
        assert_eq!(dst.shape, [1, 3, 3, 1]);
        #[rustfmt::skip]
        assert_eq!(
            dst.as_slice(),
            &[
                12.5, 21.5, 16.5,
                27.5, 45.5, 33.5,
                24.5, 39.5, 28.5,
            ],
        );
        Ok(())
    }

    #[test]
    fn test_forward_same_even_kernel() -> Result<(), NnError> {
        let src = Tensor4::<f64, CpuAllocator>::from_shape_vec(
            [1, 2, 2, 1],
            vec![1.0, 2.0, 3.0, 4.0],
            CpuAllocator,
        )?;
        let filters =
            Tensor4::<f64, CpuAllocator>::from_shape_val([2, 2, 1, 1], 1.0, CpuAllocator);
        let bias = Tensor1::<f64, CpuAllocator>::from_shape_val([1], 0.0, CpuAllocator);

        let dst = conv2d_forward(&src, &filters, &bias, Padding::Same)?;
        assert_eq!(dst.as_slice(), &[1.0, 3.0, 4.0, 10.0]);
        Ok(())
    }

    #[test]
    fn test_forward_same_kernel_larger_than_input() -> Result<(), NnError> {
        // 5x5 kernel over a single pixel: only the center tap overlaps
        let src = Tensor4::<f64, CpuAllocator>::from_shape_vec([1, 1, 1, 1], vec![3.0], CpuAllocator)?;
        let filters = Tensor4::<f64, CpuAllocator>::from_shape_fn(
            [5, 5, 1, 1],
            CpuAllocator,
            |[i, j, _, _]| (i * 5 + j) as f64,
        );
        let bias = Tensor1::<f64, CpuAllocator>::from_shape_val([1], 0.0, CpuAllocator);

        let dst = conv2d_forward(&src, &filters, &bias, Padding::Same)?;
        assert_eq!(dst.shape, [1, 1, 1, 1]);
        assert_eq!(dst.as_slice(), &[3.0 * 12.0]);
        Ok(())
    }

    #[test]
    fn test_forward_valid_kernel_too_large() {
        let src = pseudo_tensor4([1, 3, 3, 1], 0.0);
        let filters =
            Tensor4::<f64, CpuAllocator>::from_shape_val([4, 2, 1, 1], 1.0, CpuAllocator);
        let bias = Tensor1::<f64, CpuAllocator>::from_shape_val([1], 0.0, CpuAllocator);

        let result = conv2d_forward(&src, &filters, &bias, Padding::Valid);
        assert!(matches!(result, Err(NnError::KernelTooLarge(4, 2, 3, 3))));
    }

    #[test]
    fn test_forward_channel_mismatch() {
        let src = pseudo_tensor4([1, 4, 4, 3], 0.0);
        let filters =
            Tensor4::<f64, CpuAllocator>::from_shape_val([3, 3, 2, 4], 0.1, CpuAllocator);
        let bias = Tensor1::<f64, CpuAllocator>::from_shape_val([4], 0.0, CpuAllocator);

        let result = conv2d_forward(&src, &filters, &bias, Padding::Same);
        assert!(matches!(result, Err(NnError::ShapeMismatch(_, _))));
    }

    #[test]
    fn test_forward_bias_mismatch() {
        let src = pseudo_tensor4([1, 4, 4, 3], 0.0);
        let filters =
            Tensor4::<f64, CpuAllocator>::from_shape_val([3, 3, 3, 4], 0.1, CpuAllocator);
        let bias = Tensor1::<f64, CpuAllocator>::from_shape_val([3], 0.0, CpuAllocator);

        let result = conv2d_forward(&src, &filters, &bias, Padding::Same);
        assert!(matches!(result, Err(NnError::ShapeMismatch(_, _))));
    }

    #[test]
    fn test_forward_parallel_matches_serial() -> Result<(), NnError> {
        let src = pseudo_tensor4([2, 5, 4, 3], 0.1);
        let filters = pseudo_tensor4([3, 2, 3, 2], 0.2);
        let bias = Tensor1::<f64, CpuAllocator>::from_shape_vec([2], vec![0.3, -0.2], CpuAllocator)?;

        for padding in [Padding::Same, Padding::Valid] {
            let serial = conv2d_forward(&src, &filters, &bias, padding)?;
            let parallel = conv2d_forward_parallel(&src, &filters, &bias, padding)?;
            assert_eq!(serial.as_slice(), parallel.as_slice());
        }
        Ok(())
    }

    #[test]
    fn test_backward_valid_1x1_exact() -> Result<(), NnError> {
        // with a 1x1 kernel the layer is an elementwise scale, so all three
        // gradients have closed forms
        let src = Tensor4::<f64, CpuAllocator>::from_shape_vec(
            [1, 2, 2, 1],
            vec![1.0, 2.0, 3.0, 4.0],
            CpuAllocator,
        )?;
        let filters =
            Tensor4::<f64, CpuAllocator>::from_shape_vec([1, 1, 1, 1], vec![2.0], CpuAllocator)?;
        let grad_output = Tensor4::<f64, CpuAllocator>::from_shape_vec(
            [1, 2, 2, 1],
            vec![0.5, -1.0, 2.0, 3.0],
            CpuAllocator,
        )?;

        let (dx, dw, db) = conv2d_backward(&src, &filters, &grad_output, Padding::Valid)?;
        assert_eq!(dx.as_slice(), &[1.0, -2.0, 4.0, 6.0]);
        assert_eq!(dw.as_slice(), &[16.5]);
        assert_eq!(db.as_slice(), &[4.5]);
        Ok(())
    }

    #[test]
    fn test_backward_same_center_delta() -> Result<(), NnError> {
        // a centered delta kernel makes the forward pass the identity, so
        // the input gradient is exactly the upstream gradient
        let src = pseudo_tensor4([2, 3, 4, 1], 0.5);
        let filters = Tensor4::<f64, CpuAllocator>::from_shape_fn(
            [3, 3, 1, 1],
            CpuAllocator,
            |[i, j, _, _]| if i == 1 && j == 1 { 1.0 } else { 0.0 },
        );
        let bias = Tensor1::<f64, CpuAllocator>::from_shape_val([1], 0.0, CpuAllocator);
        let grad_output = pseudo_tensor4([2, 3, 4, 1], 1.5);

        let dst = conv2d_forward(&src, &filters, &bias, Padding::Same)?;
        assert_eq!(dst.as_slice(), src.as_slice());

        let (dx, _dw, db) = conv2d_backward(&src, &filters, &grad_output, Padding::Same)?;
        assert_eq!(dx.as_slice(), grad_output.as_slice());
        let expected_db: f64 = grad_output.as_slice().iter().sum();
        assert_relative_eq!(db.as_slice()[0], expected_db, max_relative = 1e-12);
        Ok(())
    }

    #[test]
    fn test_backward_bias_gradient_is_sum() -> Result<(), NnError> {
        let src = pseudo_tensor4([2, 4, 4, 2], 0.0);
        let filters = pseudo_tensor4([3, 3, 2, 3], 0.3);
        let grad_output = pseudo_tensor4([2, 4, 4, 3], 0.9);

        let (_dx, _dw, db) = conv2d_backward(&src, &filters, &grad_output, Padding::Same)?;
        for c2 in 0..3 {
            let expected: f64 = grad_output
                .as_slice()
                .iter()
                .skip(c2)
                .step_by(3)
                .sum();
            assert_relative_eq!(db.as_slice()[c2], expected, max_relative = 1e-12);
        }
        Ok(())
    }

    #[test]
    fn test_backward_adjoint_identities() -> Result<(), NnError> {
        // the layer is linear in src and in filters when the bias is zero,
        // so <dY, forward(X,K,0)> = <dX, X> = <dW, K>
        let src = pseudo_tensor4([2, 4, 5, 3], 0.1);
        let filters = pseudo_tensor4([3, 2, 3, 2], 0.7);
        let zero_bias = Tensor1::<f64, CpuAllocator>::from_shape_val([2], 0.0, CpuAllocator);

        for padding in [Padding::Same, Padding::Valid] {
            let dst = conv2d_forward(&src, &filters, &zero_bias, padding)?;
            let grad_output = pseudo_tensor4(dst.shape, 1.3);

            let (dx, dw, _db) = conv2d_backward(&src, &filters, &grad_output, padding)?;

            let lhs = dot(grad_output.as_slice(), dst.as_slice());
            assert_relative_eq!(dot(dx.as_slice(), src.as_slice()), lhs, max_relative = 1e-10);
            assert_relative_eq!(
                dot(dw.as_slice(), filters.as_slice()),
                lhs,
                max_relative = 1e-10
            );
        }
        Ok(())
    }

    #[test]
    fn test_backward_grad_shape_mismatch() {
        let src = pseudo_tensor4([1, 4, 4, 2], 0.0);
        let filters = pseudo_tensor4([3, 3, 2, 3], 0.3);
        // valid padding would produce [1, 2, 2, 3]
        let grad_output = pseudo_tensor4([1, 4, 4, 3], 0.9);

        let result = conv2d_backward(&src, &filters, &grad_output, Padding::Valid);
        assert!(matches!(result, Err(NnError::ShapeMismatch(_, _))));
    }

    #[test]
    fn test_backward_parallel_matches_serial() -> Result<(), NnError> {
        let src = pseudo_tensor4([3, 4, 5, 2], 0.2);
        let filters = pseudo_tensor4([2, 3, 2, 4], 0.8);

        for padding in [Padding::Same, Padding::Valid] {
            let (dst_h, dst_w) = padding.output_size((4, 5), (2, 3))?;
            let grad_output = pseudo_tensor4([3, dst_h, dst_w, 4], 1.1);

            let (dx_s, dw_s, db_s) = conv2d_backward(&src, &filters, &grad_output, padding)?;
            let (dx_p, dw_p, db_p) =
                conv2d_backward_parallel(&src, &filters, &grad_output, padding)?;

            assert_eq!(dx_s.as_slice(), dx_p.as_slice());
            assert_eq!(dw_s.as_slice(), dw_p.as_slice());
            assert_eq!(db_s.as_slice(), db_p.as_slice());
        }
        Ok(())
    }
}
