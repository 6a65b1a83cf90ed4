//! Log-domain arithmetic.

/// Log-domain representation of a zero potential, `ln(DBL_MIN)`.
///
/// Scores at or below this value are treated as impossible and skipped when
/// accumulating sums.
pub const LOG_ZERO: f64 = -708.396_418_532_264_1;

/// Stable `log(exp(a) + exp(b))` via max-subtract.
#[inline(always)]
pub fn logsumexp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY && b == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if a <= LOG_ZERO {
        return b;
    }
    if b <= LOG_ZERO {
        return a;
    }
    if a > b {
        a + (b - a).exp().ln_1p()
    } else {
        b + (a - b).exp().ln_1p()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_zero() {
        assert!((LOG_ZERO - f64::MIN_POSITIVE.ln()).abs() < 1e-9);
    }

    #[test]
    fn test_logsumexp_small_1() {
        let a = 0.5f64;
        let b = 2f64;
        let expected = (a.exp() + b.exp()).ln();
        let result = logsumexp(a, b);
        assert!((expected - result).abs() < f64::EPSILON);
    }

    #[test]
    fn test_logsumexp_small_2() {
        let a = 12f64;
        let b = 5f64;
        let expected = (a.exp() + b.exp()).ln();
        let result = logsumexp(a, b);
        assert!((expected - result).abs() < f64::EPSILON);
    }

    #[test]
    fn test_logsumexp_large_1() {
        let a = 1234f64;
        let b = 1232f64;
        // log(exp(1234) + exp(1232))
        // = log(exp(1232) * (exp(2) + exp(0)))
        // = 1232 + log(exp(2) + 1)
        let expected = 1232.0 + (2f64.exp() + 1.0).ln();
        let result = logsumexp(a, b);
        assert!((expected - result).abs() < f64::EPSILON);

        // The following naive calculation fails
        let naive = (a.exp() + b.exp()).ln();
        assert!(naive.is_infinite());
    }

    #[test]
    fn test_logsumexp_large_2() {
        let a = 1230f64;
        let b = 1235f64;
        let expected = 1230.0 + (1.0 + 5f64.exp()).ln();
        let result = logsumexp(a, b);
        assert!((expected - result).abs() < f64::EPSILON);
    }

    #[test]
    fn test_logsumexp_skips_log_zero() {
        let result = logsumexp(LOG_ZERO, 2.0);
        assert!((2.0 - result).abs() < f64::EPSILON);

        let result = logsumexp(2.0, LOG_ZERO);
        assert!((2.0 - result).abs() < f64::EPSILON);
    }

    #[test]
    fn test_logsumexp_neg_inf() {
        let result = logsumexp(f64::NEG_INFINITY, 2.0);
        assert!((2.0 - result).abs() < f64::EPSILON);

        let result = logsumexp(f64::NEG_INFINITY, f64::NEG_INFINITY);
        assert_eq!(f64::NEG_INFINITY, result);
    }
}
