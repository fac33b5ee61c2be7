//! Numerical kernels for the forward pass.
//!
//! Plain CPU loops over contiguous slices, generic over [`Scalar`]. Weight
//! matrices are row-major `(d, n)`: row `i` holds the `n` weights producing
//! output `i`.

use crate::numeric::Scalar;

/// Epsilon added to the mean square before the reciprocal root.
pub const RMS_EPS: f64 = 1e-5;

/// Root-mean-square normalize `x` into `out`, scaled by `weight`.
pub fn rmsnorm<T: Scalar>(out: &mut [T], x: &[T], weight: &[T]) {
    debug_assert_eq!(out.len(), x.len());
    debug_assert_eq!(weight.len(), x.len());
    let inv = inv_rms(x);
    for ((o, &xi), &w) in out.iter_mut().zip(x).zip(weight) {
        *o = w * (inv * xi);
    }
}

/// Root-mean-square normalize `x` in place.
pub fn rmsnorm_in_place<T: Scalar>(x: &mut [T], weight: &[T]) {
    debug_assert_eq!(weight.len(), x.len());
    let inv = inv_rms(x);
    for (xi, &w) in x.iter_mut().zip(weight) {
        *xi = w * (inv * *xi);
    }
}

fn inv_rms<T: Scalar>(x: &[T]) -> T {
    if x.is_empty() {
        return T::one();
    }
    let mut ss = T::zero();
    for &v in x {
        ss += v * v;
    }
    ss = ss / T::narrow(x.len() as f64) + T::narrow(RMS_EPS);
    T::one() / ss.sqrt()
}

/// `out = W @ x` where `W` is `(out.len(), x.len())` row-major.
pub fn matmul<T: Scalar>(out: &mut [T], x: &[T], w: &[T]) {
    let n = x.len();
    debug_assert_eq!(w.len(), out.len() * n);
    for (o, row) in out.iter_mut().zip(w.chunks_exact(n)) {
        *o = dot(row, x);
    }
}

/// Dot product of two equal-length slices.
#[inline]
pub fn dot<T: Scalar>(a: &[T], b: &[T]) -> T {
    let mut sum = T::zero();
    for (&x, &y) in a.iter().zip(b) {
        sum += x * y;
    }
    sum
}

/// Numerically stable softmax in place.
///
/// Subtracts the maximum before exponentiating; an empty slice is left as is.
pub fn softmax<T: Scalar>(x: &mut [T]) {
    if x.is_empty() {
        return;
    }

    let max = x.iter().copied().fold(T::neg_infinity(), T::max);
    let mut sum = T::zero();
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }

    if sum > T::zero() && sum.is_finite() {
        for v in x.iter_mut() {
            *v /= sum;
        }
    } else {
        let uniform = T::one() / T::narrow(x.len() as f64);
        x.fill(uniform);
    }
}

/// SiLU activation, `x * sigmoid(x)`.
#[inline]
pub fn silu<T: Scalar>(x: T) -> T {
    x / (T::one() + (-x).exp())
}

/// Index of the largest value; ties resolve to the lowest index.
pub fn argmax<T: Scalar>(x: &[T]) -> Option<usize> {
    let (&first, rest) = x.split_first()?;
    let mut best = (0, first);
    for (i, &v) in rest.iter().enumerate() {
        if v > best.1 {
            best = (i + 1, v);
        }
    }
    Some(best.0)
}

/// Element-wise `a += b`.
#[inline]
pub fn accumulate<T: Scalar>(a: &mut [T], b: &[T]) {
    for (x, &y) in a.iter_mut().zip(b) {
        *x += y;
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_softmax_sums_to_one(mut logits in prop::collection::vec(-50.0f64..50.0, 1..200)) {
            softmax(&mut logits);
            let sum: f64 = logits.iter().sum();
            prop_assert!((sum - 1.0).abs() < 1e-9);
            prop_assert!(logits.iter().all(|&p| p >= 0.0));
        }

        #[test]
        fn prop_argmax_is_maximal(values in prop::collection::vec(-10.0f32..10.0, 1..100)) {
            let idx = argmax(&values).unwrap();
            prop_assert!(values.iter().all(|&v| v <= values[idx]));
            prop_assert!(values[..idx].iter().all(|&v| v < values[idx]));
        }
    }
}
