//! Module containing the likelihood interface.
//!
//! The interface combines the statistical term over sample bins with the
//! penalty term over correlated parameter sets, maintains the likelihood
//! buffer read by the minimizer driver, and prepares the data slot for the
//! Asimov, real-data and toy presets.

use crate::error::{Error, MathError};
use crate::joint_probability::JointProbabilityEnum;
use crate::parameter::ParameterSet;
use crate::propagator::Propagator;
use crate::runtime::Runtime;
use crate::sample::Sample;
use log::info;
use rand::Rng;
use std::fmt::Write;

/// Which dataset the statistical term compares the prediction against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DataPreset {
    /// The MC prediction at prior, used as pseudo-data.
    Asimov,
    /// Real data, bound to the samples beforehand.
    Data,
    /// A pseudo-data realization thrown from the prior model.
    Toy,
}

/// Last evaluated likelihood components.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LikelihoodBuffer {
    /// Statistical term summed over enabled samples.
    pub stat: f64,
    /// Penalty term summed over enabled parameter sets.
    pub penalty: f64,
    /// `stat + penalty`.
    pub total: f64,
    /// Whether the buffer reflects a successful evaluation.
    pub valid: bool,
}

/// Combines the statistical and penalty likelihood terms.
#[derive(Clone, Debug)]
pub struct LikelihoodInterface {
    kernel: JointProbabilityEnum,
    buffer: LikelihoodBuffer,
}

impl LikelihoodInterface {
    /// Constructor.
    #[must_use]
    pub fn new(kernel: JointProbabilityEnum) -> Self {
        Self {
            kernel,
            buffer: LikelihoodBuffer::default(),
        }
    }

    /// Prepares the data slot of every sample according to `preset`.
    ///
    /// Asimov copies the prediction at prior into the data slot. Toy moves
    /// the parameters to their prior, throws them through every non-masked
    /// set, snapshots the fluctuated prediction, and returns the
    /// parameters to their prior. Data verifies that a real histogram was
    /// bound beforehand.
    ///
    /// # Errors
    ///
    /// Forwards propagation failures; returns [`MathError::MissingData`]
    /// for the data preset when a sample has no histogram bound.
    pub fn load_data<R: Rng>(
        &mut self,
        preset: DataPreset,
        propagator: &mut Propagator,
        runtime: &Runtime,
        rng: &mut R,
    ) -> Result<(), Error> {
        match preset {
            DataPreset::Asimov => {
                propagator.move_to_prior();
                propagator.propagate_parameters(runtime)?;
                for sample in propagator.samples_mut() {
                    sample.snapshot_as_data();
                }
            }
            DataPreset::Toy => {
                propagator.move_to_prior();
                propagator.propagate_parameters(runtime)?;
                for set in propagator.parameter_sets_mut() {
                    if set.is_masked_for_toys() {
                        info!("parameter set '{}' is masked for the toy generation", set.name());
                        continue;
                    }
                    if set.covariance().is_none() {
                        continue;
                    }
                    set.throw_parameters(rng);
                }
                propagator.propagate_parameters(runtime)?;
                for sample in propagator.samples_mut() {
                    sample.snapshot_as_data();
                }
                // the fit starts from the prior model, not the thrown one
                propagator.move_to_prior();
                propagator.propagate_parameters(runtime)?;
            }
            DataPreset::Data => {
                for sample in propagator.samples() {
                    if sample.is_enabled() && sample.data().is_none() {
                        return Err(MathError::MissingData {
                            sample: sample.name().to_owned(),
                        }
                        .into());
                    }
                }
            }
        }

        Ok(())
    }

    /// Propagates the current parameters and evaluates `stat + penalty`,
    /// updating the buffer.
    ///
    /// # Errors
    ///
    /// Forwards propagation and kernel failures; a non-finite total is a
    /// [`MathError::NonFiniteLikelihood`]. The buffer is invalidated on
    /// any failure.
    pub fn propagate_and_eval(
        &mut self,
        propagator: &mut Propagator,
        runtime: &Runtime,
    ) -> Result<f64, Error> {
        self.buffer.valid = false;
        propagator.propagate_parameters(runtime)?;

        let mut stat = 0.0;
        for sample in propagator.samples() {
            if sample.is_enabled() {
                stat += self.eval_stat(sample)?;
            }
        }

        let penalty: f64 = propagator
            .parameter_sets()
            .iter()
            .map(Self::eval_penalty)
            .sum();

        if !(stat + penalty).is_finite() {
            return Err(MathError::NonFiniteLikelihood { stat, penalty }.into());
        }

        self.buffer = LikelihoodBuffer {
            stat,
            penalty,
            total: stat + penalty,
            valid: true,
        };
        Ok(self.buffer.total)
    }

    /// Statistical term of one sample under the configured kernel.
    ///
    /// # Errors
    ///
    /// Forwards kernel failures.
    pub fn eval_stat(&self, sample: &Sample) -> Result<f64, MathError> {
        self.kernel.eval_sample(sample)
    }

    /// Penalty term of one parameter set. Fixed, free and disabled
    /// parameters contribute zero; eigen-decomposed sets are evaluated in
    /// their eigen basis.
    #[must_use]
    pub fn eval_penalty(set: &ParameterSet) -> f64 {
        set.penalty()
    }

    /// The last evaluated components.
    #[must_use]
    pub const fn buffer(&self) -> &LikelihoodBuffer {
        &self.buffer
    }

    /// The configured kernel.
    #[must_use]
    pub const fn kernel(&self) -> &JointProbabilityEnum {
        &self.kernel
    }

    /// Human-readable breakdown of the last evaluation.
    #[must_use]
    pub fn summary(&self, propagator: &Propagator) -> String {
        let mut out = format!(
            "total likelihood = {}\nstat likelihood = {}\npenalty likelihood = {}",
            self.buffer.total, self.buffer.stat, self.buffer.penalty
        );
        for sample in propagator.samples() {
            if sample.is_enabled() {
                let _ = write!(
                    out,
                    "\n  stat[{}] = {:?}",
                    sample.name(),
                    self.eval_stat(sample).ok()
                );
            }
        }
        for set in propagator.parameter_sets() {
            let _ = write!(out, "\n  penalty[{}] = {}", set.name(), Self::eval_penalty(set));
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bin::BinSet;
    use crate::dial::{Dial, DialSet, NormDial};
    use crate::event::{Event, Variable, VariableStore};
    use crate::joint_probability::PoissonLlh;
    use crate::parameter::{Parameter, ParameterSet};
    use float_cmp::assert_approx_eq;
    use nalgebra::DMatrix;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    fn event(entry: u64, weight: f64) -> Event {
        Event::new(
            0,
            entry,
            weight,
            VariableStore::new(vec!["enu".to_owned()].into(), vec![Variable::Float(0.5)]),
        )
    }

    fn fixture() -> (Propagator, LikelihoodInterface, Runtime) {
        let mut sample = Sample::new("nue", 0, BinSet::parse("enu:[0.0,1.0)\n").unwrap(), None);
        sample
            .load_events((0..100).map(|entry| event(entry, 1.0)).collect())
            .unwrap();

        let mut set = ParameterSet::new(
            "xsec",
            vec![Parameter::new("norm", 1.0, 0.1)
                .with_dial_set(DialSet::new(vec![Dial::new("norm", NormDial.into())]))],
        );
        set.set_covariance(DMatrix::from_row_slice(1, 1, &[0.01])).unwrap();
        set.initialize().unwrap();

        let mut propagator = Propagator::new(vec![sample], vec![set]);
        let runtime = Runtime::new(2).unwrap();
        propagator.build_cache(&runtime).unwrap();

        (propagator, LikelihoodInterface::new(PoissonLlh.into()), runtime)
    }

    #[test]
    fn asimov_is_stationary_at_prior() {
        let (mut propagator, mut likelihood, runtime) = fixture();
        let mut rng = Pcg64::seed_from_u64(1);

        likelihood
            .load_data(DataPreset::Asimov, &mut propagator, &runtime, &mut rng)
            .unwrap();
        let total = likelihood
            .propagate_and_eval(&mut propagator, &runtime)
            .unwrap();

        assert_approx_eq!(f64, total, 0.0, epsilon = 1e-12);
        assert!(likelihood.buffer().valid);
        assert_approx_eq!(f64, likelihood.buffer().stat, 0.0, epsilon = 1e-12);
        assert_approx_eq!(f64, likelihood.buffer().penalty, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn single_norm_dial_matches_the_reference_numbers() {
        let (mut propagator, mut likelihood, runtime) = fixture();
        let mut rng = Pcg64::seed_from_u64(1);

        likelihood
            .load_data(DataPreset::Asimov, &mut propagator, &runtime, &mut rng)
            .unwrap();

        propagator.parameter_sets_mut()[0].parameters_mut()[0].set_value(1.1);
        let total = likelihood
            .propagate_and_eval(&mut propagator, &runtime)
            .unwrap();

        // mu = 110 against n = 100 under Poisson, plus a one-sigma penalty
        assert_approx_eq!(f64, likelihood.buffer().stat, 0.9531017980, epsilon = 1e-9);
        assert_approx_eq!(f64, likelihood.buffer().penalty, 1.0, epsilon = 1e-12);
        assert_approx_eq!(f64, total, 1.9531017980, epsilon = 1e-9);
    }

    #[test]
    fn toy_preset_fluctuates_the_data_and_restores_the_prior() {
        let (mut propagator, mut likelihood, runtime) = fixture();
        let mut rng = Pcg64::seed_from_u64(7);

        likelihood
            .load_data(DataPreset::Toy, &mut propagator, &runtime, &mut rng)
            .unwrap();

        // the thrown data differs from the prior prediction
        let data = propagator.samples()[0].data().unwrap()[0];
        assert!((data - 100.0).abs() > 1e-6);
        // but the parameters are back at prior
        assert_approx_eq!(
            f64,
            propagator.parameter_sets()[0].parameters()[0].value(),
            1.0
        );
    }

    #[test]
    fn masked_sets_are_not_thrown() {
        let (mut propagator, mut likelihood, runtime) = fixture();
        propagator.parameter_sets_mut()[0].set_masked_for_toys(true);
        let mut rng = Pcg64::seed_from_u64(7);

        likelihood
            .load_data(DataPreset::Toy, &mut propagator, &runtime, &mut rng)
            .unwrap();

        assert_approx_eq!(f64, propagator.samples()[0].data().unwrap()[0], 100.0);
    }

    #[test]
    fn data_preset_requires_bound_histograms() {
        let (mut propagator, mut likelihood, runtime) = fixture();
        let mut rng = Pcg64::seed_from_u64(1);

        let result = likelihood.load_data(DataPreset::Data, &mut propagator, &runtime, &mut rng);
        assert!(matches!(
            result,
            Err(Error::Math(MathError::MissingData { .. }))
        ));

        propagator.samples_mut()[0].set_data(ndarray::Array1::from_elem(1, 99.0));
        likelihood
            .load_data(DataPreset::Data, &mut propagator, &runtime, &mut rng)
            .unwrap();
        let total = likelihood
            .propagate_and_eval(&mut propagator, &runtime)
            .unwrap();
        assert!(total > 0.0);
    }
}
