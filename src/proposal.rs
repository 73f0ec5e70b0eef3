//! Coordinate-wise Gaussian random-walk proposals.

use rand::Rng;
use rand_distr::StandardNormal;
use tracing::warn;

use crate::{
    error::ProposalError,
    math::log_normal_mass,
    model::{ParamBlock, ParamSubset, UnitModel},
};

/// Settings for the per-coordinate proposal scales.
#[derive(Debug, Clone, Copy)]
pub struct ProposalSettings {
    /// Initial scale of dynamics coefficients.
    pub dynamics_sigma: f64,
    /// Initial scale of the initial-state parameters.
    pub initial_state_sigma: f64,
    /// Initial scale of polynomial terms.
    pub polynomial_sigma: f64,
    /// Blocks this chain perturbs.
    pub subset: ParamSubset,
    /// Rejection-sampling budget for bounded parameters.
    pub max_retries: usize,
}

impl Default for ProposalSettings {
    fn default() -> Self {
        Self {
            dynamics_sigma: 0.1,
            initial_state_sigma: 0.1,
            polynomial_sigma: 0.1,
            subset: ParamSubset::default(),
            max_retries: 1000,
        }
    }
}

impl ProposalSettings {
    pub fn initial_sigma(&self, block: ParamBlock) -> f64 {
        match block {
            ParamBlock::Dynamics => self.dynamics_sigma,
            ParamBlock::InitialState => self.initial_state_sigma,
            ParamBlock::Polynomial => self.polynomial_sigma,
        }
    }
}

/// A proposed value for a single coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// Position of the coordinate within the proposal.
    pub coordinate: usize,
    /// Flat parameter index in the model.
    pub index: usize,
    pub value: f64,
    /// Log density of proposing `value` from the current state.
    pub log_fwd: f64,
    /// Log density of proposing the current state back from `value`.
    pub log_bwd: f64,
}

#[derive(Debug, Clone)]
pub struct Proposal {
    indices: Vec<usize>,
    scales: Vec<f64>,
    sample_index: usize,
    max_retries: usize,
}

impl Proposal {
    pub fn new<U: UnitModel>(model: &U, settings: &ProposalSettings) -> Self {
        let coords = settings.subset.coordinates(model);
        let scales = coords
            .iter()
            .map(|&(_, block)| settings.initial_sigma(block))
            .collect();
        Self {
            indices: coords.into_iter().map(|(idx, _)| idx).collect(),
            scales,
            sample_index: 0,
            max_retries: settings.max_retries,
        }
    }

    /// Reuse scales from an earlier run of the same unit.
    ///
    /// Scales are ignored if their count does not match the coordinates.
    pub fn with_scales(mut self, scales: &[f64]) -> Self {
        if scales.len() == self.scales.len() {
            self.scales.copy_from_slice(scales);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn model_index(&self, coordinate: usize) -> usize {
        self.indices[coordinate]
    }

    pub fn scale(&self, coordinate: usize) -> f64 {
        self.scales[coordinate]
    }

    pub fn set_scale(&mut self, coordinate: usize, scale: f64) {
        self.scales[coordinate] = scale;
    }

    pub fn scales(&self) -> &[f64] {
        &self.scales
    }

    /// The coordinate the next call to `propose` perturbs.
    pub fn sample_index(&self) -> usize {
        self.sample_index
    }

    pub fn set_sample_index(&mut self, coordinate: usize) -> Result<(), ProposalError> {
        if coordinate >= self.len() {
            return Err(ProposalError::OutOfRange {
                coordinate,
                len: self.len(),
            });
        }
        self.sample_index = coordinate;
        Ok(())
    }

    /// Perturb the coordinate at `sample_index` and advance it round-robin.
    pub fn propose<U: UnitModel, R: Rng + ?Sized>(
        &mut self,
        model: &U,
        rng: &mut R,
    ) -> Result<Candidate, ProposalError> {
        if self.is_empty() {
            return Err(ProposalError::NoCoordinates);
        }
        let coordinate = self.sample_index;
        self.sample_index = (self.sample_index + 1) % self.len();

        let index = self.indices[coordinate];
        let sigma = self.scales[coordinate];
        let current = model.param(index);
        let (lower, upper) = model.param_bounds(index);

        if lower == f64::NEG_INFINITY && upper == f64::INFINITY {
            let step: f64 = rng.sample(StandardNormal);
            let value = current + sigma * step;
            if !value.is_finite() {
                return Err(ProposalError::NonFinite { coordinate });
            }
            return Ok(Candidate {
                coordinate,
                index,
                value,
                log_fwd: 0.,
                log_bwd: 0.,
            });
        }

        for _ in 0..self.max_retries {
            let step: f64 = rng.sample(StandardNormal);
            let value = current + sigma * step;
            if !value.is_finite() {
                return Err(ProposalError::NonFinite { coordinate });
            }
            if (lower..=upper).contains(&value) {
                // Truncation makes the kernel asymmetric, the Gaussian parts cancel.
                return Ok(Candidate {
                    coordinate,
                    index,
                    value,
                    log_fwd: -log_normal_mass(current, sigma, lower, upper),
                    log_bwd: -log_normal_mass(value, sigma, lower, upper),
                });
            }
        }

        warn!(
            coordinate,
            index,
            sigma,
            tries = self.max_retries,
            "proposal retries exhausted"
        );
        Err(ProposalError::ExhaustedRetries {
            coordinate,
            tries: self.max_retries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_models::VectorModel;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn round_robin_over_coordinates() {
        let model = VectorModel::new(0, vec![0.; 3]);
        let mut proposal = Proposal::new(&model, &ProposalSettings::default());
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let coords: Vec<usize> = (0..7)
            .map(|_| proposal.propose(&model, &mut rng).unwrap().coordinate)
            .collect();
        assert_eq!(coords, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(proposal.sample_index(), 1);
    }

    #[test]
    fn symmetric_proposal_has_zero_correction() {
        let model = VectorModel::new(0, vec![1.]);
        let mut proposal = Proposal::new(&model, &ProposalSettings::default());
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let candidate = proposal.propose(&model, &mut rng).unwrap();
        assert_eq!((candidate.log_fwd, candidate.log_bwd), (0., 0.));
        assert!(candidate.value != 1.);
    }

    #[test]
    fn bounded_proposal_stays_in_range() {
        let mut model = VectorModel::new(0, vec![0.01]);
        model.bounds = Some((0., 1.));
        let settings = ProposalSettings {
            dynamics_sigma: 0.5,
            ..Default::default()
        };
        let mut proposal = Proposal::new(&model, &settings);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..100 {
            let candidate = proposal.propose(&model, &mut rng).unwrap();
            assert!((0. ..=1.).contains(&candidate.value));
            assert!(candidate.log_fwd > 0.);
        }
    }

    #[test]
    fn exhausted_retries_are_reported() {
        let mut model = VectorModel::new(0, vec![0.]);
        model.bounds = Some((1e3, 1e3 + 1e-9));
        let settings = ProposalSettings {
            dynamics_sigma: 1e-3,
            max_retries: 10,
            ..Default::default()
        };
        let mut proposal = Proposal::new(&model, &settings);
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let err = proposal.propose(&model, &mut rng).unwrap_err();
        assert_eq!(
            err,
            ProposalError::ExhaustedRetries {
                coordinate: 0,
                tries: 10
            }
        );
    }

    #[test]
    fn empty_or_out_of_range_coordinates_are_errors() {
        let model = VectorModel::new(0, vec![0.; 2]);
        let mut proposal = Proposal::new(&model, &ProposalSettings::default());
        assert_eq!(
            proposal.set_sample_index(2),
            Err(ProposalError::OutOfRange {
                coordinate: 2,
                len: 2
            })
        );
        proposal.set_sample_index(1).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        assert_eq!(proposal.propose(&model, &mut rng).unwrap().coordinate, 1);

        let empty = VectorModel::new(0, vec![]);
        let mut proposal = Proposal::new(&empty, &ProposalSettings::default());
        assert_eq!(
            proposal.propose(&empty, &mut rng),
            Err(ProposalError::NoCoordinates)
        );
    }

    #[test]
    fn scales_reused_only_when_shapes_match() {
        let model = VectorModel::new(0, vec![0.; 2]);
        let proposal = Proposal::new(&model, &ProposalSettings::default()).with_scales(&[2., 3.]);
        assert_eq!(proposal.scales(), &[2., 3.]);
        let proposal = Proposal::new(&model, &ProposalSettings::default()).with_scales(&[2.]);
        assert_eq!(proposal.scales(), &[0.1, 0.1]);
    }
}
