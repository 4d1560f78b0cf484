//! Tensor Operations for Layer Math
//!
//! A minimal n-dimensional array: exactly the operations the layers in this
//! crate need, and nothing more.
//!
//! ## Core Concepts
//!
//! - **Data**: Flat `Vec<f64>` storing all elements in row-major order
//! - **Shape**: Dimensions of the tensor (e.g., `[batch, seq, features]`)
//! - **Strides**: Step sizes for each dimension to compute flat indices
//!
//! The last axis is always the feature axis. Most operations treat a tensor of
//! shape `[a, b, ..., k]` as `a * b * ...` rows of `k` features, which is how
//! every layer here handles arbitrary leading (batch/sequence) axes.
//!
//! ## Example
//!
//! ```rust
//! use touchstone::Tensor;
//!
//! // A [2, 3] input times a [3, 2] weight
//! let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
//! let w = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
//! let y = x.matmul(&w);
//! assert_eq!(y.shape, vec![2, 2]);
//! assert_eq!(y.data, vec![4.0, 5.0, 10.0, 11.0]);
//! ```
//!
//! ## Panics vs Errors
//!
//! Tensor operations assert their shape requirements and panic on violation.
//! Layers validate user-facing preconditions *before* calling into this
//! module and report violations as [`LayerError`](crate::LayerError), so a
//! panic here means a bug in the crate, not bad input.
//!
//! ## Performance
//!
//! Elementwise operations, softmax and large matrix products run in parallel
//! via Rayon.

use rayon::prelude::*;

/// A multi-dimensional array of `f64` values in row-major layout.
///
/// For shape `[2, 3]`, data is stored as
/// `[r0c0, r0c1, r0c2, r1c0, r1c1, r1c2]` and strides are `[3, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all tensor elements
    pub data: Vec<f64>,
    /// Shape of the tensor (dimensions)
    pub shape: Vec<usize>,
    /// Strides for each dimension (computed from shape)
    pub strides: Vec<usize>,
}

impl Tensor {
    /// Create a new tensor with given data and shape
    ///
    /// # Panics
    ///
    /// Panics if the product of shape dimensions doesn't equal data length
    ///
    /// # Example
    ///
    /// ```rust
    /// # use touchstone::Tensor;
    /// let tensor = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
    /// assert_eq!(tensor.shape, vec![2, 2]);
    /// ```
    pub fn new(data: Vec<f64>, shape: Vec<usize>) -> Self {
        let expected_size: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_size,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_size
        );

        let strides = Self::compute_strides(&shape);
        Self {
            data,
            shape,
            strides,
        }
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::full(shape, 0.0)
    }

    /// Create a tensor with every element set to `value`
    ///
    /// ```rust
    /// # use touchstone::Tensor;
    /// let tensor = Tensor::full(vec![2, 3], 0.5);
    /// assert!(tensor.data.iter().all(|&x| x == 0.5));
    /// ```
    pub fn full(shape: Vec<usize>, value: f64) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![value; size], shape)
    }

    /// Compute strides from shape (row-major layout)
    ///
    /// For shape `[d0, d1, d2]`, strides are `[d1*d2, d2, 1]`
    fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the trailing (feature) axis, or 1 for a scalar tensor
    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Number of feature rows: product of all leading axes
    pub fn rows(&self) -> usize {
        self.shape[..self.shape.len().saturating_sub(1)]
            .iter()
            .product()
    }

    /// Shape with the feature axis replaced by `width`
    pub fn with_last_dim(&self, width: usize) -> Vec<usize> {
        let mut shape = self.shape.clone();
        match shape.last_mut() {
            Some(last) => *last = width,
            None => shape.push(width),
        }
        shape
    }

    /// SIMD-friendly inner loop for matrix multiplication
    /// Computes: result[j] += a_val * b[j] for all j
    #[inline(always)]
    fn matmul_inner_simd(a_val: f64, b: &[f64], result: &mut [f64]) {
        for (r, &b_val) in result.iter_mut().zip(b.iter()) {
            *r += a_val * b_val;
        }
    }

    /// Matrix multiplication over the trailing axis
    ///
    /// `self` has shape `[..., k]` and is treated as `rows × k`; `other` must
    /// be a 2-D `[k, n]` matrix. The result has shape `[..., n]`, so leading
    /// axes pass through untouched.
    ///
    /// # Performance
    ///
    /// - **Small products** (< 1K multiply-adds): Sequential triple loop
    /// - **Large products**: Parallel cache-blocked algorithm
    ///
    /// # Panics
    ///
    /// Panics if `other` is not 2-D or the inner dimensions differ
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        assert_eq!(
            other.shape.len(),
            2,
            "Right operand of matmul must be 2-D, got {:?}",
            other.shape
        );
        let k = self.last_dim();
        assert_eq!(
            k, other.shape[0],
            "Matrix dimensions incompatible: {:?} @ {:?}",
            self.shape, other.shape
        );

        let m = self.rows();
        let n = other.shape[1];
        let out_shape = self.with_last_dim(n);

        if m * n * k >= 1_000 {
            let result = self.matmul_parallel_blocked(other, m, n, k);
            return Tensor::new(result, out_shape);
        }

        let mut result = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                let mut sum = 0.0;
                for l in 0..k {
                    sum += self.data[i * k + l] * other.data[l * n + j];
                }
                result[i * n + j] = sum;
            }
        }

        Tensor::new(result, out_shape)
    }

    /// Parallel cache-blocked matrix multiplication
    ///
    /// Processes 8×8 blocks so the working set stays in L1, and distributes
    /// row blocks across cores.
    fn matmul_parallel_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Vec<f64> {
        const BLOCK_SIZE: usize = 8;

        let mut result = vec![0.0; m * n];

        result
            .par_chunks_mut(BLOCK_SIZE * n)
            .enumerate()
            .for_each(|(block_i, result_block)| {
                let i_start = block_i * BLOCK_SIZE;
                let i_end = (i_start + BLOCK_SIZE).min(m);

                for j_start in (0..n).step_by(BLOCK_SIZE) {
                    let j_end = (j_start + BLOCK_SIZE).min(n);

                    for k_start in (0..k).step_by(BLOCK_SIZE) {
                        let k_end = (k_start + BLOCK_SIZE).min(k);

                        for i in i_start..i_end {
                            let row_offset = (i - i_start) * n;
                            for k_idx in k_start..k_end {
                                let a_val = self.data[i * k + k_idx];
                                Self::matmul_inner_simd(
                                    a_val,
                                    &other.data[k_idx * n + j_start..k_idx * n + j_end],
                                    &mut result_block[row_offset + j_start..row_offset + j_end],
                                );
                            }
                        }
                    }
                }
            });

        result
    }

    /// View the tensor as a 2-D `[rows, last_dim]` matrix
    pub fn flatten_rows(&self) -> Tensor {
        Tensor::new(self.data.clone(), vec![self.rows(), self.last_dim()])
    }

    /// Softmax along the last axis
    ///
    /// Uses the numerically stable form `exp(x - max) / sum(exp(x - max))`,
    /// computed per row in parallel.
    ///
    /// ```rust
    /// # use touchstone::Tensor;
    /// let t = Tensor::new(vec![1.0, 2.0, 3.0], vec![1, 3]);
    /// let s = t.softmax();
    /// assert!((s.data.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    /// ```
    pub fn softmax(&self) -> Tensor {
        let cols = self.last_dim();
        let mut result = self.data.clone();
        result.par_chunks_mut(cols).for_each(|row| {
            let max = row.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
            let mut sum = 0.0;
            for v in row.iter_mut() {
                *v = (*v - max).exp();
                sum += *v;
            }
            for v in row.iter_mut() {
                *v /= sum;
            }
        });
        Tensor::new(result, self.shape.clone())
    }

    /// Index into `other` for flat position `i` when broadcasting `other`
    /// over `self`. Supported: equal shapes, or `other.shape` a suffix of
    /// `self.shape` (e.g. `[*, n] + [n]` for bias addition).
    fn broadcast_len(&self, other: &Tensor, op: &str) -> usize {
        if self.shape == other.shape {
            return other.data.len();
        }
        let suffix = self.shape.len() >= other.shape.len()
            && self.shape[self.shape.len() - other.shape.len()..] == other.shape[..];
        assert!(
            suffix && !other.data.is_empty(),
            "Unsupported broadcast for {}: {:?} and {:?}",
            op,
            self.shape,
            other.shape
        );
        other.data.len()
    }

    fn zip_broadcast(&self, other: &Tensor, op: &str, f: impl Fn(f64, f64) -> f64 + Sync) -> Tensor {
        let period = self.broadcast_len(other, op);
        let result = self
            .data
            .par_iter()
            .enumerate()
            .map(|(i, &a)| f(a, other.data[i % period]))
            .collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Element-wise addition with suffix broadcasting
    ///
    /// ```rust
    /// # use touchstone::Tensor;
    /// let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
    /// let bias = Tensor::new(vec![10.0, 20.0], vec![2]);
    /// assert_eq!(a.add(&bias).data, vec![11.0, 22.0, 13.0, 24.0]);
    /// ```
    pub fn add(&self, other: &Tensor) -> Tensor {
        self.zip_broadcast(other, "add", |a, b| a + b)
    }

    /// Element-wise subtraction with suffix broadcasting
    pub fn sub(&self, other: &Tensor) -> Tensor {
        self.zip_broadcast(other, "sub", |a, b| a - b)
    }

    /// Element-wise multiplication with suffix broadcasting
    pub fn mul(&self, other: &Tensor) -> Tensor {
        self.zip_broadcast(other, "mul", |a, b| a * b)
    }

    /// Add `other` (same shape) into `self` in place
    pub fn add_assign(&mut self, other: &Tensor) {
        assert_eq!(self.shape, other.shape, "Shapes must match for add_assign");
        self.data
            .par_iter_mut()
            .zip(&other.data)
            .for_each(|(a, b)| *a += b);
    }

    /// In-place SGD step: `self -= learning_rate * grad`
    pub fn sgd_step(&mut self, grad: &Tensor, learning_rate: f64) {
        assert_eq!(self.shape, grad.shape, "Gradient shape must match parameter");
        self.data
            .par_iter_mut()
            .zip(&grad.data)
            .for_each(|(p, g)| *p -= learning_rate * g);
    }

    /// Multiply all elements by scalar
    pub fn mul_scalar(&self, scalar: f64) -> Tensor {
        self.map(|x| x * scalar)
    }

    /// Apply `f` to every element
    pub fn map(&self, f: impl Fn(f64) -> f64 + Sync + Send) -> Tensor {
        let result = self.data.par_iter().map(|&x| f(x)).collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Sum of all elements
    pub fn sum(&self) -> f64 {
        self.data.par_iter().sum()
    }

    /// Sum of the element-wise product with a same-shaped tensor
    pub fn dot(&self, other: &Tensor) -> f64 {
        assert_eq!(self.shape, other.shape, "Shapes must match for dot");
        self.data
            .par_iter()
            .zip(&other.data)
            .map(|(a, b)| a * b)
            .sum()
    }

    /// Reduce every leading axis by summation, leaving `[last_dim]`
    ///
    /// This is the bias-gradient reduction: one total per feature.
    pub fn sum_leading(&self) -> Tensor {
        let cols = self.last_dim();
        let mut totals = vec![0.0; cols];
        for row in self.data.chunks(cols) {
            for (t, v) in totals.iter_mut().zip(row) {
                *t += v;
            }
        }
        Tensor::new(totals, vec![cols])
    }

    /// Mean along the last axis
    ///
    /// With `keepdim` the result has shape `[..., 1]`, otherwise the last
    /// axis is dropped.
    pub fn mean_last(&self, keepdim: bool) -> Tensor {
        let cols = self.last_dim();
        let result: Vec<f64> = self
            .data
            .par_chunks(cols)
            .map(|row| row.iter().sum::<f64>() / cols as f64)
            .collect();
        Tensor::new(result, self.reduced_shape(keepdim))
    }

    /// Population variance along the last axis (divides by N)
    pub fn var_last(&self, keepdim: bool) -> Tensor {
        let cols = self.last_dim();
        let result: Vec<f64> = self
            .data
            .par_chunks(cols)
            .map(|row| {
                let mean = row.iter().sum::<f64>() / cols as f64;
                row.iter()
                    .map(|&x| {
                        let diff = x - mean;
                        diff * diff
                    })
                    .sum::<f64>()
                    / cols as f64
            })
            .collect();
        Tensor::new(result, self.reduced_shape(keepdim))
    }

    fn reduced_shape(&self, keepdim: bool) -> Vec<usize> {
        if keepdim {
            self.with_last_dim(1)
        } else {
            self.shape[..self.shape.len().saturating_sub(1)].to_vec()
        }
    }

    /// Reshape tensor to new shape
    ///
    /// Total number of elements must remain the same.
    pub fn reshape(&self, new_shape: &[usize]) -> Tensor {
        let new_size: usize = new_shape.iter().product();
        assert_eq!(
            self.data.len(),
            new_size,
            "Cannot reshape: element count mismatch"
        );
        Tensor::new(self.data.clone(), new_shape.to_vec())
    }

    /// Transpose two dimensions (negative indices count from the end)
    ///
    /// ```rust
    /// # use touchstone::Tensor;
    /// let t = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
    /// let tt = t.transpose(-2, -1);
    /// assert_eq!(tt.shape, vec![3, 2]);
    /// assert_eq!(tt.data, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    /// ```
    pub fn transpose(&self, dim1: isize, dim2: isize) -> Tensor {
        let ndim = self.shape.len() as isize;
        let d1 = (if dim1 < 0 { ndim + dim1 } else { dim1 }) as usize;
        let d2 = (if dim2 < 0 { ndim + dim2 } else { dim2 }) as usize;
        if d1 == d2 {
            return self.clone();
        }

        let mut new_shape = self.shape.clone();
        new_shape.swap(d1, d2);

        if self.shape.len() == 2 {
            let rows = self.shape[0];
            let cols = self.shape[1];
            let mut result = vec![0.0; rows * cols];
            for i in 0..rows {
                for j in 0..cols {
                    result[j * rows + i] = self.data[i * cols + j];
                }
            }
            return Tensor::new(result, new_shape);
        }

        // Walk the output in order; each output coordinate maps to the input
        // through the input strides with d1/d2 swapped.
        let new_strides = Self::compute_strides(&new_shape);
        let mut source_strides = self.strides.clone();
        source_strides.swap(d1, d2);

        let result = (0..self.data.len())
            .map(|i| {
                let mut remaining = i;
                let mut old_idx = 0;
                for (&stride, &src_stride) in new_strides.iter().zip(&source_strides) {
                    old_idx += (remaining / stride) * src_stride;
                    remaining %= stride;
                }
                self.data[old_idx]
            })
            .collect();

        Tensor::new(result, new_shape)
    }

    /// Largest absolute element-wise difference to a same-shaped tensor
    pub fn max_abs_diff(&self, other: &Tensor) -> f64 {
        assert_eq!(self.shape, other.shape, "Shapes must match for comparison");
        self.data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strides() {
        let t = Tensor::zeros(vec![2, 3, 4]);
        assert_eq!(t.strides, vec![12, 4, 1]);
    }

    #[test]
    fn test_matmul_keeps_leading_axes() {
        let x = Tensor::new((0..12).map(|v| v as f64).collect(), vec![2, 2, 3]);
        let w = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 0.0, 0.0], vec![3, 2]);
        let y = x.matmul(&w);
        assert_eq!(y.shape, vec![2, 2, 2]);
        assert_eq!(y.data, vec![0.0, 1.0, 3.0, 4.0, 6.0, 7.0, 9.0, 10.0]);
    }

    #[test]
    fn test_blocked_matmul_matches_naive() {
        let m = 13;
        let k = 11;
        let n = 17;
        let a = Tensor::new((0..m * k).map(|v| (v % 7) as f64 - 3.0).collect(), vec![m, k]);
        let b = Tensor::new((0..k * n).map(|v| (v % 5) as f64 * 0.5).collect(), vec![k, n]);
        let fast = a.matmul(&b);

        let mut naive = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                for l in 0..k {
                    naive[i * n + j] += a.data[i * k + l] * b.data[l * n + j];
                }
            }
        }
        assert!(fast.max_abs_diff(&Tensor::new(naive, vec![m, n])) < 1e-12);
    }

    #[test]
    #[should_panic(expected = "Matrix dimensions incompatible")]
    fn test_matmul_inner_mismatch_panics() {
        let a = Tensor::zeros(vec![2, 3]);
        let b = Tensor::zeros(vec![4, 2]);
        a.matmul(&b);
    }

    #[test]
    fn test_add_bias_broadcast_over_rank3() {
        let x = Tensor::zeros(vec![2, 2, 3]);
        let b = Tensor::new(vec![1.0, 2.0, 3.0], vec![3]);
        let y = x.add(&b);
        assert_eq!(&y.data[..6], &[1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    #[should_panic(expected = "Unsupported broadcast")]
    fn test_add_rejects_non_suffix_broadcast() {
        let x = Tensor::zeros(vec![2, 3]);
        let b = Tensor::zeros(vec![2]);
        x.add(&b);
    }

    #[test]
    fn test_sum_leading() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![3, 2]);
        assert_eq!(t.sum_leading().data, vec![9.0, 12.0]);
    }

    #[test]
    fn test_mean_and_var_last_axis() {
        let t = Tensor::new(vec![1.0, 3.0, 2.0, 2.0], vec![2, 2]);
        let mean = t.mean_last(true);
        assert_eq!(mean.shape, vec![2, 1]);
        assert_eq!(mean.data, vec![2.0, 2.0]);
        let var = t.var_last(false);
        assert_eq!(var.shape, vec![2]);
        assert_eq!(var.data, vec![1.0, 0.0]);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0, -1.0, 0.0, 1000.0], vec![2, 3]);
        let s = t.softmax();
        for row in s.data.chunks(3) {
            assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        }
        assert!((s.data[5] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_transpose_rank3() {
        let t = Tensor::new((0..6).map(|v| v as f64).collect(), vec![1, 2, 3]);
        let tt = t.transpose(-2, -1);
        assert_eq!(tt.shape, vec![1, 3, 2]);
        assert_eq!(tt.data, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn test_sgd_step() {
        let mut p = Tensor::new(vec![1.0, 1.0], vec![2]);
        let g = Tensor::new(vec![1.0, -2.0], vec![2]);
        p.sgd_step(&g, 0.5);
        assert_eq!(p.data, vec![0.5, 2.0]);
    }
}
