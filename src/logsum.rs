//! Log-space arithmetic. Every probability in the DP engine is a natural
//! logarithm; direct multiplication of probabilities is a defect.

/// log(0). All DP cells start here.
pub const LOG_ZERO: f64 = f64::NEG_INFINITY;

/// log(exp(a) + exp(b)) without leaving log space.
/// `log_sum_exp(x, LOG_ZERO) == x` and `log_sum_exp(LOG_ZERO, LOG_ZERO) == LOG_ZERO`.
#[inline]
pub fn log_sum_exp(a: f64, b: f64) -> f64 {
    if a == LOG_ZERO {
        b
    } else if b == LOG_ZERO {
        a
    } else if a < b {
        b + (a - b).exp().ln_1p()
    } else {
        a + (b - a).exp().ln_1p()
    }
}

/// In-place `acc := log_sum_exp(acc, x)`.
#[inline]
pub fn log_accum_exp(acc: &mut f64, x: f64) {
    *acc = log_sum_exp(*acc, x);
}

/// log of the inner product of two distributions given in log space:
/// `log sum_i exp(p[i] + q[i])`.
pub fn log_inner_product(log_p: &[f64], log_q: &[f64]) -> f64 {
    assert_eq!(log_p.len(), log_q.len());
    let mut acc = LOG_ZERO;
    for (&p, &q) in log_p.iter().zip(log_q.iter()) {
        log_accum_exp(&mut acc, p + q);
    }
    acc
}

/// log(sum exp(xs)).
pub fn log_sum_exp_slice(xs: &[f64]) -> f64 {
    let max = xs.iter().cloned().fold(LOG_ZERO, f64::max);
    if max == LOG_ZERO {
        return LOG_ZERO;
    }
    let sum: f64 = xs.iter().map(|x| (x - max).exp()).sum();
    max + sum.ln()
}
