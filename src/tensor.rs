//! Minimal Tensor for Inference
//!
//! A row-major `Vec<f32>` with a shape, carrying only the operations the
//! checkpoint backend needs for a forward pass over one sequence:
//!
//! - 2D matrix multiplication (parallel, cache-blocked for larger products)
//! - element-wise addition and bias broadcasting over the last dimension
//! - row-wise softmax
//! - 2D transpose and scalar scaling
//!
//! Every activation in the backend is `[seq_len, features]`, so nothing here
//! handles batches or more than two dimensions except construction and
//! storage (embedding tables and checkpoint tensors may carry any shape).

use rayon::prelude::*;

/// A multi-dimensional array of `f32` in row-major order
///
/// For shape `[2, 3]` the data is laid out as
/// `[r0c0, r0c1, r0c2, r1c0, r1c1, r1c2]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl Tensor {
    /// Create a tensor from flat data
    ///
    /// # Panics
    ///
    /// Panics if the product of the shape doesn't equal the data length.
    /// Callers that build tensors from untrusted input (checkpoint files)
    /// check the length first.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected = Self::expected_len(&shape);
        assert_eq!(
            data.len(),
            expected,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected
        );
        Self { data, shape }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let size = Self::expected_len(&shape);
        Self::new(vec![0.0; size], shape)
    }

    /// Number of elements a shape describes
    pub fn expected_len(shape: &[usize]) -> usize {
        shape.iter().product()
    }

    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    pub fn cols(&self) -> usize {
        self.shape[1]
    }

    /// Row `i` of a 2D tensor
    pub fn row(&self, i: usize) -> &[f32] {
        let cols = self.cols();
        &self.data[i * cols..(i + 1) * cols]
    }

    /// Matrix multiplication `[m, k] @ [k, n] -> [m, n]`
    ///
    /// # Arguments
    ///
    /// * `other` - Right-hand operand, `[k, n]`
    ///
    /// # Returns
    ///
    /// A new `[m, n]` tensor; neither operand is modified
    ///
    /// # Performance
    ///
    /// Products of at least 1K multiply-adds go through the parallel blocked
    /// kernel; smaller ones run sequentially to skip the rayon overhead.
    ///
    /// # Panics
    ///
    /// Panics if either operand is not 2D or the inner dimensions differ.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use touchstone::tensor::Tensor;
    /// let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
    /// let id = Tensor::new(vec![1.0, 0.0, 0.0, 1.0], vec![2, 2]);
    /// assert_eq!(a.matmul(&id).data, a.data);
    /// ```
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        assert!(
            self.shape.len() == 2 && other.shape.len() == 2,
            "Unsupported matmul shapes: {:?} @ {:?}",
            self.shape,
            other.shape
        );
        assert_eq!(
            self.shape[1], other.shape[0],
            "Matrix dimensions incompatible: {:?} @ {:?}",
            self.shape, other.shape
        );

        let m = self.shape[0];
        let k = self.shape[1];
        let n = other.shape[1];

        if m * n * k >= 1_000 {
            return self.matmul_blocked(other, m, n, k);
        }

        let mut result = vec![0.0; m * n];
        for i in 0..m {
            for l in 0..k {
                let a = self.data[i * k + l];
                let b_row = &other.data[l * n..(l + 1) * n];
                for (r, &b) in result[i * n..(i + 1) * n].iter_mut().zip(b_row) {
                    *r += a * b;
                }
            }
        }
        Tensor::new(result, vec![m, n])
    }

    /// Parallel cache-blocked kernel
    ///
    /// Output rows are split into blocks of 8 handed to rayon; within a block
    /// the inner loops walk `other` row by row so memory access stays
    /// sequential and the innermost loop auto-vectorizes.
    fn matmul_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        const BLOCK: usize = 8;
        let mut result = vec![0.0; m * n];

        result
            .par_chunks_mut(BLOCK * n)
            .enumerate()
            .for_each(|(block_i, out)| {
                let i_start = block_i * BLOCK;
                let i_end = (i_start + BLOCK).min(m);

                for k_start in (0..k).step_by(BLOCK) {
                    let k_end = (k_start + BLOCK).min(k);
                    for i in i_start..i_end {
                        let out_row = &mut out[(i - i_start) * n..(i - i_start + 1) * n];
                        for l in k_start..k_end {
                            let a = self.data[i * k + l];
                            let b_row = &other.data[l * n..(l + 1) * n];
                            for (r, &b) in out_row.iter_mut().zip(b_row) {
                                *r += a * b;
                            }
                        }
                    }
                }
            });

        Tensor::new(result, vec![m, n])
    }

    /// Element-wise addition of two tensors of the same shape
    pub fn add(&self, other: &Tensor) -> Tensor {
        assert_eq!(self.shape, other.shape, "add requires matching shapes");
        let data = self
            .data
            .par_iter()
            .zip(&other.data)
            .map(|(a, b)| a + b)
            .collect();
        Tensor::new(data, self.shape.clone())
    }

    /// Add a `[n]` vector to every row of a `[m, n]` tensor
    pub fn add_bias(&self, bias: &Tensor) -> Tensor {
        let n = *self.shape.last().unwrap_or(&0);
        assert_eq!(bias.data.len(), n, "bias length must match last dimension");
        let mut data = self.data.clone();
        data.par_chunks_mut(n.max(1)).for_each(|row| {
            for (x, b) in row.iter_mut().zip(&bias.data) {
                *x += b;
            }
        });
        Tensor::new(data, self.shape.clone())
    }

    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        let data = self.data.iter().map(|x| x * scalar).collect();
        Tensor::new(data, self.shape.clone())
    }

    /// Apply `f` to every element
    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f32) -> f32 + Sync + Send,
    {
        let data = self.data.par_iter().map(|&x| f(x)).collect();
        Tensor::new(data, self.shape.clone())
    }

    /// Transpose a 2D tensor
    pub fn transpose(&self) -> Tensor {
        let (rows, cols) = (self.rows(), self.cols());
        let mut data = vec![0.0; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                data[j * rows + i] = self.data[i * cols + j];
            }
        }
        Tensor::new(data, vec![cols, rows])
    }

    /// Softmax over the last dimension of a 2D tensor
    ///
    /// Subtracts the row maximum before exponentiating so large logits can't
    /// overflow. Entries equal to `f32::NEG_INFINITY` come out as exactly 0.
    pub fn softmax_rows(&self) -> Tensor {
        let cols = self.cols();
        let mut data = self.data.clone();
        data.par_chunks_mut(cols.max(1)).for_each(|row| {
            let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            let mut sum = 0.0;
            for x in row.iter_mut() {
                *x = (*x - max).exp();
                sum += *x;
            }
            for x in row.iter_mut() {
                *x /= sum;
            }
        });
        Tensor::new(data, self.shape.clone())
    }
}
