//! Dense row-major kernels shared by the built-in stages.

use crate::tensor::FloatElement;

/// `c = alpha * op(a) * op(b) + beta * c` for row-major matrices, where `op(a)` is `m x k`
/// and `op(b)` is `k x n`. With `beta == 0` the previous contents of `c` are ignored.
#[allow(clippy::too_many_arguments)]
pub(crate) fn gemm<T: FloatElement>(
    trans_a: bool,
    trans_b: bool,
    m: usize,
    n: usize,
    k: usize,
    alpha: T,
    a: &[T],
    b: &[T],
    beta: T,
    c: &mut [T],
) {
    debug_assert!(a.len() >= m * k && b.len() >= k * n && c.len() >= m * n);
    let c = &mut c[..m * n];
    if beta == T::zero() {
        c.fill(T::zero());
    } else if beta != T::one() {
        for v in c.iter_mut() {
            *v *= beta;
        }
    }
    for i in 0..m {
        for p in 0..k {
            let a_ip = if trans_a { a[p * m + i] } else { a[i * k + p] };
            if a_ip == T::zero() {
                continue;
            }
            let scaled = alpha * a_ip;
            let row = &mut c[i * n..(i + 1) * n];
            if trans_b {
                for (j, out) in row.iter_mut().enumerate() {
                    *out += scaled * b[j * k + p];
                }
            } else {
                let b_row = &b[p * n..(p + 1) * n];
                for (out, &b_pj) in row.iter_mut().zip(b_row) {
                    *out += scaled * b_pj;
                }
            }
        }
    }
}
