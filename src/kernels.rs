use rand::Rng;

use crate::element::Element;

// ============================================================================
// NUMERIC KERNELS
// Pure functions over row-major slices. Tight loops auto-vectorize with
// opt-level=3 + LTO; matmul goes through matrixmultiply's f64 gemm.
// ============================================================================

#[inline]
pub fn widen<E: Element>(a: &[E]) -> Vec<f64> {
    a.iter().map(|&x| x.widen()).collect()
}

#[inline]
pub fn vec_add<E: Element>(a: &[E], b: &[E]) -> Vec<E> {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(&x, &y)| x + y).collect()
}

#[inline]
pub fn vec_add_inplace<E: Element>(a: &mut [E], b: &[E]) {
    debug_assert_eq!(a.len(), b.len());
    for (x, &y) in a.iter_mut().zip(b.iter()) {
        *x += y;
    }
}

#[inline]
pub fn vec_mul<E: Element>(a: &[E], b: &[E]) -> Vec<E> {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(&x, &y)| x * y).collect()
}

#[inline]
pub fn vec_sigmoid<E: Element>(a: &[E]) -> Vec<E> {
    a.iter().map(|&x| E::one() / (E::one() + (-x).exp())).collect()
}

#[inline]
pub fn vec_tanh<E: Element>(a: &[E]) -> Vec<E> {
    a.iter().map(|&x| x.tanh()).collect()
}

/// `C[m,n] = A[m,k] @ B[k,n]`, all row-major, accumulated in f64.
pub fn gemm(m: usize, k: usize, n: usize, a: &[f64], b: &[f64]) -> Vec<f64> {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    let mut out = vec![0.0f64; m * n];
    if m == 0 || n == 0 || k == 0 {
        return out;
    }
    // SAFETY: every pointer covers the extent described by its dims and
    // strides, and `out` does not alias the inputs.
    unsafe {
        matrixmultiply::dgemm(
            m, k, n,
            1.0,
            a.as_ptr(), k as isize, 1,
            b.as_ptr(), n as isize, 1,
            0.0,
            out.as_mut_ptr(), n as isize, 1,
        );
    }
    out
}

/// `dA[m,k] = dOut[m,n] @ B^T` where `B` is stored row-major as `[k,n]`.
pub fn gemm_grad_left(m: usize, k: usize, n: usize, dout: &[f64], b: &[f64]) -> Vec<f64> {
    let mut da = vec![0.0f64; m * k];
    if m == 0 || n == 0 || k == 0 {
        return da;
    }
    // SAFETY: B^T is read from B[k,n] with swapped strides.
    unsafe {
        matrixmultiply::dgemm(
            m, n, k,
            1.0,
            dout.as_ptr(), n as isize, 1,
            b.as_ptr(), 1, n as isize,
            0.0,
            da.as_mut_ptr(), k as isize, 1,
        );
    }
    da
}

/// `dB[k,n] = A^T @ dOut[m,n]` where `A` is stored row-major as `[m,k]`.
pub fn gemm_grad_right(m: usize, k: usize, n: usize, a: &[f64], dout: &[f64]) -> Vec<f64> {
    let mut db = vec![0.0f64; k * n];
    if m == 0 || n == 0 || k == 0 {
        return db;
    }
    // SAFETY: A^T is read from A[m,k] with swapped strides.
    unsafe {
        matrixmultiply::dgemm(
            k, m, n,
            1.0,
            a.as_ptr(), 1, k as isize,
            dout.as_ptr(), n as isize, 1,
            0.0,
            db.as_mut_ptr(), n as isize, 1,
        );
    }
    db
}

/// Numerically stable softmax over every entry of `logits`.
///
/// Not part of the tape: callers that train through it seed the logits
/// gradient with the closed form `probs - onehot(target)` themselves.
pub fn softmax<E: Element>(logits: &[E]) -> Vec<E> {
    softmax_scaled(logits, 1.0)
}

/// Softmax of `logits / temperature`.
pub fn softmax_scaled<E: Element>(logits: &[E], temperature: f64) -> Vec<E> {
    if logits.is_empty() {
        return Vec::new();
    }
    let scaled: Vec<f64> = logits.iter().map(|&x| x.widen() / temperature).collect();
    let max = scaled.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scaled.iter().map(|&x| (x - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| E::narrow(e / sum)).collect()
}

/// Index of the largest entry; the first one wins ties.
pub fn argmax<E: Element>(w: &[E]) -> usize {
    let mut best = 0;
    for (i, &v) in w.iter().enumerate().skip(1) {
        if v > w[best] {
            best = i;
        }
    }
    best
}

/// Draws an index from a probability vector.
///
/// Falls back to the last index when rounding keeps the running sum from
/// ever exceeding the uniform draw.
pub fn sample_from_distribution<E: Element>(w: &[E], rng: &mut impl Rng) -> usize {
    assert!(!w.is_empty(), "cannot sample from an empty distribution");
    let r: f64 = rng.gen();
    sample_with(w, r)
}

pub(crate) fn sample_with<E: Element>(w: &[E], r: f64) -> usize {
    let mut acc = 0.0f64;
    for (i, &p) in w.iter().enumerate() {
        acc += p.widen();
        if acc > r {
            return i;
        }
    }
    w.len() - 1
}
