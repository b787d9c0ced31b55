//! Module containing the one-dimensional likelihood scanner.
//!
//! Scans evaluate the likelihood components over a grid of values of one
//! parameter, leaving everything else where it was. Eigen-decomposed sets
//! are scanned through their original parameters.

use crate::error::Error;
use crate::likelihood::LikelihoodInterface;
use crate::propagator::Propagator;
use crate::runtime::Runtime;
use log::info;

/// One evaluated scan point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScanPoint {
    /// Parameter value the point was evaluated at.
    pub value: f64,
    /// Total likelihood.
    pub total: f64,
    /// Statistical component.
    pub stat: f64,
    /// Penalty component.
    pub penalty: f64,
}

/// A completed scan of one parameter.
#[derive(Clone, Debug)]
pub struct ScanResult {
    /// Full name of the scanned parameter.
    pub parameter: String,
    /// Evaluated grid, in ascending parameter value.
    pub points: Vec<ScanPoint>,
}

/// Grid scanner over single parameters.
#[derive(Clone, Copy, Debug)]
pub struct ParameterScanner {
    points: usize,
    /// Scan range in prior sigmas when the parameter carries no bounds.
    range_sigmas: f64,
    use_parameter_limits: bool,
}

impl ParameterScanner {
    /// Constructor with the given grid size.
    #[must_use]
    pub const fn new(points: usize) -> Self {
        Self {
            points,
            range_sigmas: 3.0,
            use_parameter_limits: true,
        }
    }

    /// Overrides the sigma range used when a parameter has no bounds.
    #[must_use]
    pub const fn with_range_sigmas(mut self, range_sigmas: f64) -> Self {
        self.range_sigmas = range_sigmas;
        self
    }

    /// Scans parameter `par` of set `set` over its range and restores the
    /// original value afterwards.
    ///
    /// # Errors
    ///
    /// Forwards likelihood evaluation failures. The parameter is restored
    /// on the successful path; a failed evaluation aborts the scan.
    pub fn scan_parameter(
        &self,
        set: usize,
        par: usize,
        likelihood: &mut LikelihoodInterface,
        propagator: &mut Propagator,
        runtime: &Runtime,
    ) -> Result<ScanResult, Error> {
        let (name, saved, low, high) = {
            let parameter_set = &propagator.parameter_sets()[set];
            let parameter = &parameter_set.parameters()[par];
            let (low, high) = if self.use_parameter_limits
                && parameter.min().is_some()
                && parameter.max().is_some()
            {
                (parameter.min().unwrap(), parameter.max().unwrap())
            } else {
                (
                    self.range_sigmas.mul_add(-parameter.sigma(), parameter.prior()),
                    self.range_sigmas.mul_add(parameter.sigma(), parameter.prior()),
                )
            };
            (
                parameter_set.full_name(par),
                parameter.value(),
                low,
                high,
            )
        };

        info!("scanning '{name}' over [{low}, {high}] with {} points", self.points);

        let mut points = Vec::with_capacity(self.points);
        for index in 0..self.points {
            let value = (high - low).mul_add(grid_fraction(index, self.points), low);

            let parameter_set = &mut propagator.parameter_sets_mut()[set];
            parameter_set.parameters_mut()[par].set_value(value);
            parameter_set.propagate_original_to_eigen();

            let total = likelihood.propagate_and_eval(propagator, runtime)?;
            let buffer = likelihood.buffer();
            points.push(ScanPoint {
                value,
                total,
                stat: buffer.stat,
                penalty: buffer.penalty,
            });
        }

        let parameter_set = &mut propagator.parameter_sets_mut()[set];
        parameter_set.parameters_mut()[par].set_value(saved);
        parameter_set.propagate_original_to_eigen();
        likelihood.propagate_and_eval(propagator, runtime)?;

        Ok(ScanResult {
            parameter: name,
            points,
        })
    }
}

// position of grid point `index` within [0, 1]
#[allow(clippy::cast_precision_loss)]
fn grid_fraction(index: usize, points: usize) -> f64 {
    index as f64 / (points.max(2) - 1) as f64
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bin::BinSet;
    use crate::dial::{Dial, DialSet, NormDial};
    use crate::event::{Event, Variable, VariableStore};
    use crate::joint_probability::PoissonLlh;
    use crate::likelihood::DataPreset;
    use crate::parameter::{Parameter, ParameterSet};
    use crate::sample::Sample;
    use float_cmp::assert_approx_eq;
    use nalgebra::DMatrix;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    #[test]
    fn scan_brackets_the_minimum_and_restores_the_value() {
        let mut sample = Sample::new("nue", 0, BinSet::parse("enu:[0.0,1.0)\n").unwrap(), None);
        sample
            .load_events(
                (0..50)
                    .map(|entry| {
                        Event::new(
                            0,
                            entry,
                            1.0,
                            VariableStore::new(
                                vec!["enu".to_owned()].into(),
                                vec![Variable::Float(0.5)],
                            ),
                        )
                    })
                    .collect(),
            )
            .unwrap();

        let mut set = ParameterSet::new(
            "xsec",
            vec![Parameter::new("norm", 1.0, 0.1)
                .with_dial_set(DialSet::new(vec![Dial::new("norm", NormDial.into())]))],
        );
        set.set_covariance(DMatrix::from_row_slice(1, 1, &[0.01])).unwrap();
        set.initialize().unwrap();

        let mut propagator = Propagator::new(vec![sample], vec![set]);
        let runtime = Runtime::new(1).unwrap();
        propagator.build_cache(&runtime).unwrap();

        let mut likelihood = LikelihoodInterface::new(PoissonLlh.into());
        let mut rng = Pcg64::seed_from_u64(11);
        likelihood
            .load_data(DataPreset::Asimov, &mut propagator, &runtime, &mut rng)
            .unwrap();

        let scan = ParameterScanner::new(11)
            .scan_parameter(0, 0, &mut likelihood, &mut propagator, &runtime)
            .unwrap();

        assert_eq!(scan.parameter, "xsec/norm");
        assert_eq!(scan.points.len(), 11);
        // the grid is centered on the prior, where the likelihood vanishes
        let center = &scan.points[5];
        assert_approx_eq!(f64, center.value, 1.0, epsilon = 1e-12);
        assert_approx_eq!(f64, center.total, 0.0, epsilon = 1e-9);
        assert!(scan.points.iter().all(|point| point.total >= center.total));
        // edges cost more than the center on both sides
        assert!(scan.points[0].total > 1.0);
        assert!(scan.points[10].total > 1.0);

        // the scanned parameter was restored
        assert_approx_eq!(
            f64,
            propagator.parameter_sets()[0].parameters()[0].value(),
            1.0
        );
    }
}
