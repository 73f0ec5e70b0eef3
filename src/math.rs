use std::f64::consts::SQRT_2;

use itertools::izip;
use multiversion::multiversion;
use statrs::function::erf::erfc;

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    let n = x.len();
    assert!(y.len() == n);

    y.iter_mut().zip(x).for_each(|(y, x)| {
        *y = x.mul_add(a, *y);
    });
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());

    izip!(a, b).map(|(a, b)| a * b).sum()
}

pub(crate) fn all_finite(values: &[f64]) -> bool {
    values.iter().all(|val| val.is_finite())
}

/// Log density of `N(mean, var)` at `x`.
#[inline]
pub(crate) fn normal_logpdf(x: f64, mean: f64, var: f64) -> f64 {
    let diff = x - mean;
    -0.5 * diff * diff / var - 0.5 * var.ln() - LN_SQRT_2PI
}

/// Standard normal CDF.
#[inline]
pub(crate) fn normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / SQRT_2)
}

/// Log of the mass a `N(center, sigma^2)` puts on `[lower, upper]`.
pub(crate) fn log_normal_mass(center: f64, sigma: f64, lower: f64, upper: f64) -> f64 {
    let a = (lower - center) / sigma;
    let b = (upper - center) / sigma;
    // Subtract upper-tail probabilities when the interval lies right of the
    // center, so neither term is close to one.
    let mass = if a > 0. {
        normal_cdf(-a) - normal_cdf(-b)
    } else {
        normal_cdf(b) - normal_cdf(a)
    };
    mass.max(f64::MIN_POSITIVE).ln()
}
