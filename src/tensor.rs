use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::element::Element;
use crate::error::{Error, Result};

// ============================================================================
// TENSOR - dense row-major matrix with a gradient buffer of the same shape
// ============================================================================

/// A 2-D dense matrix with a parallel gradient buffer.
///
/// `w.len() == dw.len() == rows * cols` holds at all times. Gradients are
/// accumulated into `dw`; only [`Tensor::zero_grad`] clears them. Only `w`
/// is persisted: a deserialized tensor always starts with a zero gradient.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "StoredTensor<E>",
    into = "StoredTensor<E>",
    bound = "E: Element"
)]
pub struct Tensor<E: Element> {
    pub rows: usize,
    pub cols: usize,
    pub w: Vec<E>,
    pub dw: Vec<E>,
}

impl<E: Element> Tensor<E> {
    /// Zero-filled tensor.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        let len = rows * cols;
        Tensor { rows, cols, w: vec![E::zero(); len], dw: vec![E::zero(); len] }
    }

    /// Wraps existing values; the gradient starts at zero.
    pub fn from_vec(rows: usize, cols: usize, w: Vec<E>) -> Result<Self> {
        let expected = rows * cols;
        if w.len() != expected {
            return Err(Error::InvalidTensor { rows, cols, expected, got: w.len() });
        }
        Ok(Tensor { rows, cols, dw: vec![E::zero(); expected], w })
    }

    /// Column vector from a slice.
    pub fn column(values: &[E]) -> Self {
        Tensor {
            rows: values.len(),
            cols: 1,
            w: values.to_vec(),
            dw: vec![E::zero(); values.len()],
        }
    }

    /// Uniform values in `[-scale, scale)`.
    pub fn uniform(rows: usize, cols: usize, scale: f64, rng: &mut impl Rng) -> Self {
        let w = (0..rows * cols)
            .map(|_| E::narrow(rng.gen_range(-scale..scale)))
            .collect::<Vec<E>>();
        Tensor { rows, cols, dw: vec![E::zero(); w.len()], w }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.w.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.w.is_empty()
    }

    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn zero_grad(&mut self) {
        self.dw.iter_mut().for_each(|g| *g = E::zero());
    }

    /// Copy of the values with a fresh zero gradient.
    pub fn detached(&self) -> Self {
        Tensor {
            rows: self.rows,
            cols: self.cols,
            w: self.w.clone(),
            dw: vec![E::zero(); self.w.len()],
        }
    }
}

/// Persisted form of a tensor: shape and values, no gradient.
#[derive(Serialize, Deserialize)]
#[serde(bound = "E: Element")]
struct StoredTensor<E: Element> {
    rows: usize,
    cols: usize,
    w: Vec<E>,
}

impl<E: Element> TryFrom<StoredTensor<E>> for Tensor<E> {
    type Error = Error;

    fn try_from(s: StoredTensor<E>) -> Result<Self> {
        Tensor::from_vec(s.rows, s.cols, s.w)
    }
}

impl<E: Element> From<Tensor<E>> for StoredTensor<E> {
    fn from(t: Tensor<E>) -> Self {
        StoredTensor { rows: t.rows, cols: t.cols, w: t.w }
    }
}
