//! Module containing the [`Propagator`].
//!
//! The propagator owns the samples, the parameter sets and the dial cache,
//! and orchestrates the reweighting phases: reset every event weight to its
//! base, multiply the cached dial responses in `(set, parameter)` order,
//! then refill the sample histograms. Phases run on the [`Runtime`] worker
//! pool; events are partitioned so that each weight is written by exactly
//! one worker and no locks are taken in the inner loop.

use crate::dial_cache::DialCache;
use crate::error::{Error, LoadError, MathError};
use crate::parameter::ParameterSet;
use crate::runtime::{PhaseReport, Runtime};
use crate::sample::Sample;
use log::{debug, trace};
use rayon::prelude::*;
use std::time::Instant;

/// Owner of the event model: samples, parameter sets and the dial cache.
#[derive(Debug)]
pub struct Propagator {
    samples: Vec<Sample>,
    parameter_sets: Vec<ParameterSet>,
    cache: Option<DialCache>,
}

impl Propagator {
    /// Constructor.
    #[must_use]
    pub fn new(samples: Vec<Sample>, parameter_sets: Vec<ParameterSet>) -> Self {
        Self {
            samples,
            parameter_sets,
            cache: None,
        }
    }

    /// Builds the dial cache. Must be called after events and parameters
    /// are loaded and before the first propagation.
    ///
    /// # Errors
    ///
    /// Forwards apply-formula failures from the cache build.
    pub fn build_cache(&mut self, runtime: &Runtime) -> Result<(), Error> {
        let start = Instant::now();
        let cache = runtime
            .pool()
            .install(|| DialCache::build(&self.samples, &self.parameter_sets))?;

        debug!(
            "dial cache: {} entries over {} events, built in {:?}",
            cache.cached_dials(),
            self.samples.iter().map(|sample| sample.events().len()).sum::<usize>(),
            start.elapsed()
        );
        runtime.observe_phase(&PhaseReport {
            phase: "buildCache",
            duration: start.elapsed(),
        });
        self.cache = Some(cache);
        Ok(())
    }

    /// Re-weights every MC event and refreshes the per-bin sums.
    ///
    /// # Errors
    ///
    /// Returns a [`MathError`] naming the event and parameter when a dial
    /// response is negative under a strict policy or non-finite.
    pub fn propagate_parameters(&mut self, runtime: &Runtime) -> Result<(), Error> {
        self.reweight_mc_events(runtime)?;

        if runtime.stop_requested() {
            debug!("stop requested, skipping histogram refill");
            return Ok(());
        }

        let start = Instant::now();
        runtime.pool().install(|| {
            self.samples
                .par_iter_mut()
                .for_each(Sample::refill_histogram);
        });
        trace!("histogram refill took {:?}", start.elapsed());
        runtime.observe_phase(&PhaseReport {
            phase: "fillHist",
            duration: start.elapsed(),
        });

        Ok(())
    }

    /// The re-weight pass alone, without the histogram refill.
    ///
    /// Within a single event the dial product is taken in
    /// `(set, parameter)` order, which pins the floating-point rounding
    /// across runs; across events the order is unspecified.
    ///
    /// # Errors
    ///
    /// Returns a [`MathError`] naming the event and parameter when a dial
    /// response is negative under a strict policy or non-finite.
    pub fn reweight_mc_events(&mut self, runtime: &Runtime) -> Result<(), Error> {
        let cache = self
            .cache
            .as_ref()
            .ok_or(Error::Load(LoadError::CacheNotBuilt))?;

        // the eigen basis is authoritative for decomposed sets
        for set in &mut self.parameter_sets {
            set.propagate_eigen_to_original();
        }

        if runtime.stop_requested() {
            debug!("stop requested, skipping reweight");
            return Ok(());
        }

        let start = Instant::now();
        let sets = &self.parameter_sets;
        let samples = &mut self.samples;

        runtime.pool().install(|| {
            samples
                .par_iter_mut()
                .enumerate()
                .try_for_each(|(sample_index, sample)| {
                    let sample_name = sample.name().to_owned();
                    sample
                        .events_mut()
                        .par_iter_mut()
                        .enumerate()
                        .try_for_each(|(event_index, event)| {
                            event.reset_weight();

                            for (column, entry) in
                                cache.row(sample_index, event_index).iter().enumerate()
                            {
                                let Some(dial_ref) = entry else { continue };
                                let (set, par) = cache.columns()[column];
                                if !sets[set].is_enabled() {
                                    continue;
                                }
                                let parameter = &sets[set].parameters()[par];
                                if !parameter.is_enabled() {
                                    continue;
                                }

                                let dial = &parameter.dial_sets()[dial_ref.dial_set as usize]
                                    .dials()[dial_ref.dial as usize];
                                let x = parameter.value();
                                let response = dial.respond(x).map_err(|below| {
                                    MathError::NegativeResponse {
                                        dial: dial.to_string(),
                                        parameter: sets[set].full_name(par),
                                        x: below.x,
                                        response: below.response,
                                        floor: below.floor,
                                    }
                                })?;
                                if !response.is_finite() {
                                    return Err(MathError::InvalidResponse {
                                        entry: event.entry_index(),
                                        sample: sample_name.clone(),
                                        parameter: sets[set].full_name(par),
                                        x,
                                        response,
                                    });
                                }

                                event.multiply_weight(response);
                            }

                            Ok(())
                        })
                })
        })?;

        trace!("reweight took {:?}", start.elapsed());
        runtime.observe_phase(&PhaseReport {
            phase: "reweight",
            duration: start.elapsed(),
        });

        Ok(())
    }

    /// The owned samples.
    #[must_use]
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Mutable access to the samples.
    pub fn samples_mut(&mut self) -> &mut [Sample] {
        &mut self.samples
    }

    /// The owned parameter sets.
    #[must_use]
    pub fn parameter_sets(&self) -> &[ParameterSet] {
        &self.parameter_sets
    }

    /// Mutable access to the parameter sets.
    pub fn parameter_sets_mut(&mut self) -> &mut [ParameterSet] {
        &mut self.parameter_sets
    }

    /// The dial cache, once built.
    #[must_use]
    pub const fn cache(&self) -> Option<&DialCache> {
        self.cache.as_ref()
    }

    /// Moves every parameter set to its prior.
    pub fn move_to_prior(&mut self) {
        for set in &mut self.parameter_sets {
            set.move_to_prior();
        }
    }

    /// Logs the per-sample event breakdown.
    pub fn log_event_breakdown(&self) {
        for sample in &self.samples {
            log::info!("{sample}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bin::BinSet;
    use crate::dial::{Dial, DialSet, GraphDial, NormDial};
    use crate::event::{Event, Variable, VariableStore};
    use crate::parameter::Parameter;
    use float_cmp::assert_approx_eq;

    fn event(entry: u64, enu: f64, weight: f64) -> Event {
        Event::new(
            0,
            entry,
            weight,
            VariableStore::new(vec!["enu".to_owned()].into(), vec![Variable::Float(enu)]),
        )
    }

    fn single_sample_propagator(parameters: Vec<Parameter>) -> Propagator {
        let mut sample = Sample::new("nue", 0, BinSet::parse("enu:[0.0,2.0)\n").unwrap(), None);
        sample
            .load_events(vec![event(0, 0.5, 1.0), event(1, 1.5, 2.0)])
            .unwrap();

        Propagator::new(vec![sample], vec![ParameterSet::new("xsec", parameters)])
    }

    #[test]
    fn propagation_at_prior_restores_base_weights() {
        let runtime = Runtime::new(2).unwrap();
        let norm = Parameter::new("norm", 1.0, 0.1)
            .with_dial_set(DialSet::new(vec![Dial::new("norm", NormDial.into())]));
        let mut propagator = single_sample_propagator(vec![norm]);

        propagator.build_cache(&runtime).unwrap();
        propagator.propagate_parameters(&runtime).unwrap();

        for sample in propagator.samples() {
            for event in sample.events() {
                assert_approx_eq!(f64, event.current_weight(), event.base_weight());
            }
        }
        assert_approx_eq!(f64, propagator.samples()[0].histogram().content()[0], 3.0);
    }

    #[test]
    fn dial_product_scales_the_histogram() {
        let runtime = Runtime::new(2).unwrap();
        let norm = Parameter::new("norm", 1.0, 0.1)
            .with_dial_set(DialSet::new(vec![Dial::new("norm", NormDial.into())]));
        let graph = Parameter::new("shape", 0.0, 1.0).with_dial_set(DialSet::new(vec![Dial::new(
            "shape",
            GraphDial::new(&[(-1.0, 0.5), (0.0, 1.0), (1.0, 1.5)], "shape")
                .unwrap()
                .into(),
        )]));
        let mut propagator = single_sample_propagator(vec![norm, graph]);

        propagator.build_cache(&runtime).unwrap();

        propagator.parameter_sets_mut()[0].parameters_mut()[0].set_value(1.2);
        propagator.parameter_sets_mut()[0].parameters_mut()[1].set_value(0.5);
        propagator.propagate_parameters(&runtime).unwrap();

        // every event carries 1.2 * 1.25
        assert_approx_eq!(
            f64,
            propagator.samples()[0].histogram().content()[0],
            3.0 * 1.2 * 1.25,
            epsilon = 1e-12
        );
    }

    #[test]
    fn negative_strict_response_aborts_with_identities() {
        let runtime = Runtime::new(1).unwrap();
        let norm = Parameter::new("norm", 1.0, 0.1)
            .with_dial_set(DialSet::new(vec![Dial::new("norm", NormDial.into())]));
        let mut propagator = single_sample_propagator(vec![norm]);

        propagator.build_cache(&runtime).unwrap();
        propagator.parameter_sets_mut()[0].parameters_mut()[0].set_value(-0.5);
        let result = propagator.propagate_parameters(&runtime);

        match result {
            Err(Error::Math(MathError::NegativeResponse { parameter, .. })) => {
                assert_eq!(parameter, "xsec/norm");
            }
            other => panic!("expected NegativeResponse, got {other:?}"),
        }
    }

    #[test]
    fn disabled_parameters_do_not_reweight() {
        let runtime = Runtime::new(1).unwrap();
        let norm = Parameter::new("norm", 1.0, 0.1)
            .with_dial_set(DialSet::new(vec![Dial::new("norm", NormDial.into())]));
        let mut propagator = single_sample_propagator(vec![norm]);

        propagator.build_cache(&runtime).unwrap();
        propagator.parameter_sets_mut()[0].parameters_mut()[0].set_value(3.0);
        propagator.parameter_sets_mut()[0].parameters_mut()[0].set_enabled(false);
        propagator.propagate_parameters(&runtime).unwrap();

        assert_approx_eq!(f64, propagator.samples()[0].histogram().content()[0], 3.0);
    }

    #[test]
    fn reweight_is_reproducible() {
        let runtime = Runtime::new(3).unwrap();
        let norm = Parameter::new("norm", 1.0, 0.1)
            .with_dial_set(DialSet::new(vec![Dial::new("norm", NormDial.into())]));
        let mut propagator = single_sample_propagator(vec![norm]);

        propagator.build_cache(&runtime).unwrap();
        propagator.parameter_sets_mut()[0].parameters_mut()[0].set_value(1.07);

        propagator.propagate_parameters(&runtime).unwrap();
        let first = propagator.samples()[0].histogram().content().clone();
        propagator.propagate_parameters(&runtime).unwrap();
        let second = propagator.samples()[0].histogram().content().clone();

        assert_eq!(first, second);
    }
}
