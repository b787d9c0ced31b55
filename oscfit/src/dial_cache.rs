//! Module containing the per-event dial cache.
//!
//! Dial lookup is the hot inner loop of reweighting. The cache moves the
//! `O(events x parameters x dials)` search out of the minimization loop:
//! it is built once, after events and parameters are known, and is
//! immutable afterwards. The table is dense by `(set, parameter)` with
//! empty entries for inapplicable parameters, trading memory for locality.

use crate::error::LoadError;
use crate::parameter::ParameterSet;
use crate::sample::Sample;
use rayon::prelude::*;

/// Location of a dial within its owning parameter: dial-set and dial
/// indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DialRef {
    /// Index into [`crate::parameter::Parameter::dial_sets`].
    pub dial_set: u32,
    /// Index into the dial set's dial list.
    pub dial: u32,
}

/// Dense per-event table of applicable dials.
#[derive(Clone, Debug)]
pub struct DialCache {
    table: Vec<Option<DialRef>>,
    stride: usize,
    sample_offsets: Vec<usize>,
    columns: Vec<(usize, usize)>,
}

impl DialCache {
    /// Builds the cache for `samples` against `parameter_sets`.
    ///
    /// Per event and flat parameter column: the first dial set targeting
    /// the sample is consulted; a false apply-formula leaves the entry
    /// empty; otherwise the first dial whose apply-bin contains the event
    /// wins.
    ///
    /// # Errors
    ///
    /// Forwards apply-formula evaluation failures.
    pub fn build(samples: &[Sample], parameter_sets: &[ParameterSet]) -> Result<Self, LoadError> {
        let columns: Vec<(usize, usize)> = parameter_sets
            .iter()
            .enumerate()
            .flat_map(|(set, parameters)| {
                (0..parameters.parameters().len()).map(move |par| (set, par))
            })
            .collect();
        let stride = columns.len();

        let mut sample_offsets = Vec::with_capacity(samples.len());
        let mut offset = 0;
        for sample in samples {
            sample_offsets.push(offset);
            offset += sample.events().len();
        }

        let mut table = Vec::with_capacity(offset * stride);
        for sample in samples {
            let rows = sample
                .events()
                .par_iter()
                .map(|event| {
                    let mut row = vec![None; stride];
                    for (column, &(set, par)) in columns.iter().enumerate() {
                        let parameter = &parameter_sets[set].parameters()[par];
                        let Some((dial_set_index, dial_set)) = parameter
                            .dial_sets()
                            .iter()
                            .enumerate()
                            .find(|(_, dial_set)| dial_set.targets_sample(sample.name()))
                        else {
                            continue;
                        };
                        if dial_set.dials().is_empty() || !dial_set.accepts(event.variables())? {
                            continue;
                        }
                        row[column] = dial_set
                            .dials()
                            .iter()
                            .position(|dial| dial.applies_to(event.variables()))
                            .map(|dial| DialRef {
                                dial_set: u32::try_from(dial_set_index).unwrap(),
                                dial: u32::try_from(dial).unwrap(),
                            });
                    }
                    Ok(row)
                })
                .collect::<Result<Vec<_>, LoadError>>()?;
            table.extend(rows.into_iter().flatten());
        }

        Ok(Self {
            table,
            stride,
            sample_offsets,
            columns,
        })
    }

    /// The cached row of event `event` of sample `sample`: one entry per
    /// flat parameter column.
    #[must_use]
    pub fn row(&self, sample: usize, event: usize) -> &[Option<DialRef>] {
        let start = (self.sample_offsets[sample] + event) * self.stride;
        &self.table[start..start + self.stride]
    }

    /// The `(set, parameter)` pair of each flat column, in evaluation
    /// order.
    #[must_use]
    pub fn columns(&self) -> &[(usize, usize)] {
        &self.columns
    }

    /// Number of flat parameter columns.
    #[must_use]
    pub const fn stride(&self) -> usize {
        self.stride
    }

    /// Number of cached dial entries (for diagnostics).
    #[must_use]
    pub fn cached_dials(&self) -> usize {
        self.table.iter().filter(|entry| entry.is_some()).count()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bin::{Bin, BinEdges, BinSet};
    use crate::dial::{Dial, DialSet, NormDial};
    use crate::event::{Event, Variable, VariableStore};
    use crate::formula::Formula;
    use crate::parameter::Parameter;

    fn event(entry: u64, enu: f64) -> Event {
        Event::new(
            0,
            entry,
            1.0,
            VariableStore::new(vec!["enu".to_owned()].into(), vec![Variable::Float(enu)]),
        )
    }

    fn edges(low: f64, high: f64) -> Bin {
        Bin::new(vec![BinEdges {
            name: "enu".to_owned(),
            low,
            high,
        }])
    }

    #[test]
    fn first_matching_dial_wins_and_gates_apply() {
        let mut sample = Sample::new(
            "nue",
            0,
            BinSet::parse("enu:[0.0,2.0)\n").unwrap(),
            None,
        );
        sample
            .load_events(vec![event(0, 0.5), event(1, 1.5)])
            .unwrap();

        // dial 0 covers [0, 1), dial 1 covers [1, 2)
        let binned_dials = DialSet::new(vec![
            Dial::new("low", NormDial.into()).with_apply_bin(edges(0.0, 1.0)),
            Dial::new("high", NormDial.into()).with_apply_bin(edges(1.0, 2.0)),
        ]);
        // gated away from low-energy events by a formula
        let gated = DialSet::new(vec![Dial::new("gated", NormDial.into())])
            .with_apply_formula(Formula::parse("enu >= 1.0").unwrap());
        // targets a different sample entirely
        let elsewhere = DialSet::new(vec![Dial::new("other", NormDial.into())])
            .with_samples(vec!["numu".to_owned()]);

        let sets = vec![ParameterSet::new(
            "xsec",
            vec![
                Parameter::new("binned", 1.0, 0.1).with_dial_set(binned_dials),
                Parameter::new("gated", 1.0, 0.1).with_dial_set(gated),
                Parameter::new("other", 1.0, 0.1).with_dial_set(elsewhere),
            ],
        )];

        let cache = DialCache::build(std::slice::from_ref(&sample), &sets).unwrap();

        assert_eq!(cache.stride(), 3);
        assert_eq!(cache.columns(), &[(0, 0), (0, 1), (0, 2)]);

        // event 0 at enu = 0.5: first dial wins, gate is false, other sample
        assert_eq!(
            cache.row(0, 0),
            &[Some(DialRef { dial_set: 0, dial: 0 }), None, None]
        );
        // event 1 at enu = 1.5: second dial wins, gate is true
        assert_eq!(
            cache.row(0, 1),
            &[
                Some(DialRef { dial_set: 0, dial: 1 }),
                Some(DialRef { dial_set: 0, dial: 0 }),
                None
            ]
        );
        assert_eq!(cache.cached_dials(), 3);
    }
}
