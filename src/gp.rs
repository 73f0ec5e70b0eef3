//! Gaussian-process conditioning used by the drift sampler.
//!
//! All matrices are small (control points of one unit), so the code favours
//! plain dense factorizations. Numerical settings are passed explicitly.

use faer::{
    linalg::solvers::{Llt, Solve},
    Mat, MatRef, Side,
};

use crate::{
    error::GpError,
    math::{axpy, vector_dot},
    scoring::CovarianceKernel,
};

const LN_2PI: f64 = 1.837_877_066_409_345_3;

/// Diagonal regularization used when factorizing covariance matrices.
#[derive(Debug, Clone, Copy)]
pub struct CholeskySettings {
    /// First jitter, relative to the mean of the diagonal.
    pub jitter: f64,
    /// Factor applied to the jitter after each failed attempt.
    pub jitter_growth: f64,
    pub max_attempts: usize,
}

impl Default for CholeskySettings {
    fn default() -> Self {
        Self {
            jitter: 1e-10,
            jitter_growth: 10.,
            max_attempts: 7,
        }
    }
}

pub fn kernel_matrix(
    kernel: &dyn CovarianceKernel,
    coefficient: usize,
    rows: &[f64],
    cols: &[f64],
) -> Mat<f64> {
    Mat::from_fn(rows.len(), cols.len(), |i, j| {
        kernel.covariance(coefficient, rows[i], cols[j])
    })
}

fn column(values: &[f64]) -> Mat<f64> {
    Mat::from_fn(values.len(), 1, |i, _| values[i])
}

/// Cholesky factorization of a jittered covariance matrix.
#[derive(Debug, Clone)]
pub struct Factor {
    llt: Llt<f64>,
}

impl Factor {
    pub fn new(cov: &Mat<f64>, settings: &CholeskySettings) -> Result<Self, GpError> {
        let n = cov.nrows();
        assert!(cov.ncols() == n);
        let failed = GpError::NotPositiveDefinite {
            size: n,
            attempts: settings.max_attempts,
        };

        let mut finite = true;
        faer::zip!(cov).for_each(|faer::unzip!(val)| finite &= val.is_finite());
        if !finite {
            return Err(failed);
        }

        let scale = (0..n).map(|i| cov[(i, i)].abs()).sum::<f64>() / n.max(1) as f64;
        let scale = if scale > 0. { scale } else { 1. };
        let mut jitter = settings.jitter * scale;
        for _ in 0..settings.max_attempts {
            let mut jittered = cov.clone();
            for i in 0..n {
                jittered[(i, i)] += jitter;
            }
            if let Ok(llt) = jittered.llt(Side::Lower) {
                let lower = llt.L();
                let mut ok = true;
                faer::zip!(lower).for_each(|faer::unzip!(val)| ok &= val.is_finite());
                if ok {
                    return Ok(Self { llt });
                }
            }
            jitter *= settings.jitter_growth;
        }
        Err(failed)
    }

    pub fn dim(&self) -> usize {
        self.llt.L().nrows()
    }

    /// Solve `K x = b` for the factorized `K`.
    pub fn solve(&self, b: &[f64]) -> Vec<f64> {
        assert!(b.len() == self.dim());
        self.llt.solve(&column(b)).col_as_slice(0).to_vec()
    }

    /// Solve `K X = B` column by column.
    pub fn solve_mat(&self, rhs: MatRef<'_, f64>) -> Mat<f64> {
        self.llt.solve(rhs)
    }

    /// `L z`, turning standard normal draws into draws with covariance `K`.
    pub fn mul_lower(&self, z: &[f64]) -> Vec<f64> {
        assert!(z.len() == self.dim());
        (self.llt.L() * &column(z)).col_as_slice(0).to_vec()
    }

    pub fn log_det(&self) -> f64 {
        let lower = self.llt.L();
        2. * (0..self.dim()).map(|i| lower[(i, i)].ln()).sum::<f64>()
    }

    /// Log density of `N(0, K)` at `diff`.
    pub fn log_density(&self, diff: &[f64]) -> f64 {
        let quad = vector_dot(diff, &self.solve(diff));
        -0.5 * (quad + self.log_det() + self.dim() as f64 * LN_2PI)
    }
}

/// Gaussian predictive distribution at a single point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Predictive {
    pub mean: f64,
    pub var: f64,
}

/// Weights that map conditioning values to a predictive mean.
///
/// They only depend on the time axis, so they are reused until the control
/// points change.
#[derive(Debug, Clone)]
pub struct ConditionalWeights {
    pub weights: Vec<f64>,
    pub var: f64,
}

impl ConditionalWeights {
    pub fn new(
        kernel: &dyn CovarianceKernel,
        coefficient: usize,
        given: &[f64],
        target: f64,
        settings: &CholeskySettings,
    ) -> Result<Self, GpError> {
        let cov = kernel_matrix(kernel, coefficient, given, given);
        let factor = Factor::new(&cov, settings)?;
        let cross: Vec<f64> = given
            .iter()
            .map(|&t| kernel.covariance(coefficient, t, target))
            .collect();
        let weights = factor.solve(&cross);
        let prior = kernel.covariance(coefficient, target, target);
        let explained = vector_dot(&weights, &cross);
        Ok(Self {
            weights,
            var: (prior - explained).max(0.),
        })
    }

    pub fn predict(&self, values: &[f64]) -> Predictive {
        let mean = vector_dot(&self.weights, values);
        Predictive {
            mean,
            var: self.var,
        }
    }
}

/// Distribution of the free (non-control) time points given the control values.
#[derive(Debug, Clone)]
pub struct TrajectoryConditional {
    /// `K_fc K_cc^{-1}`, one row per free time point.
    mean_map: Mat<f64>,
    factor: Factor,
}

impl TrajectoryConditional {
    pub fn new(
        kernel: &dyn CovarianceKernel,
        coefficient: usize,
        control_times: &[f64],
        free_times: &[f64],
        settings: &CholeskySettings,
    ) -> Result<Self, GpError> {
        let control_cov = kernel_matrix(kernel, coefficient, control_times, control_times);
        let control_factor = Factor::new(&control_cov, settings)?;
        let cross = kernel_matrix(kernel, coefficient, free_times, control_times);

        let mean_map = control_factor
            .solve_mat(cross.transpose())
            .transpose()
            .to_owned();

        let free_cov = kernel_matrix(kernel, coefficient, free_times, free_times);
        let explained = &mean_map * cross.transpose();
        let cond_cov = &free_cov - &explained;
        // Enforce exact symmetry before factorizing.
        let cond_cov = Mat::from_fn(cond_cov.nrows(), cond_cov.ncols(), |i, j| {
            0.5 * (cond_cov[(i, j)] + cond_cov[(j, i)])
        });
        let factor = Factor::new(&cond_cov, settings)?;
        Ok(Self { mean_map, factor })
    }

    pub fn num_free(&self) -> usize {
        self.mean_map.nrows()
    }

    pub fn mean(&self, control_values: &[f64]) -> Vec<f64> {
        assert!(control_values.len() == self.mean_map.ncols());
        (&self.mean_map * &column(control_values))
            .col_as_slice(0)
            .to_vec()
    }

    /// Turn standard normal draws into a draw of the free points.
    pub fn draw(&self, control_values: &[f64], z: &[f64]) -> Vec<f64> {
        let mut out = self.mean(control_values);
        axpy(&self.factor.mul_lower(z), &mut out, 1.);
        out
    }

    pub fn log_density(&self, control_values: &[f64], free_values: &[f64]) -> f64 {
        let mut diff = free_values.to_vec();
        axpy(&self.mean(control_values), &mut diff, -1.);
        self.factor.log_density(&diff)
    }
}
