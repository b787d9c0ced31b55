//! Module containing [`Sample`] and its histogram.

use crate::bin::BinSet;
use crate::error::LoadError;
use crate::event::Event;
use crate::formula::Formula;
use log::info;
use ndarray::Array1;
use std::fmt::{self, Display, Formatter};

/// Per-bin aggregation of a sample: content, squared-weight sum and the
/// list of events feeding each bin. Storage is allocated once and reused
/// by every refill.
#[derive(Clone, Debug)]
pub struct Histogram {
    content: Array1<f64>,
    error2: Array1<f64>,
    event_lists: Vec<Vec<usize>>,
}

impl Histogram {
    fn new(bins: usize) -> Self {
        Self {
            content: Array1::zeros(bins),
            error2: Array1::zeros(bins),
            event_lists: vec![Vec::new(); bins],
        }
    }

    /// Per-bin weighted event counts.
    #[must_use]
    pub fn content(&self) -> &Array1<f64> {
        &self.content
    }

    /// Per-bin sum of squared weights (the MC statistical variance).
    #[must_use]
    pub fn error2(&self) -> &Array1<f64> {
        &self.error2
    }

    /// Per-bin statistical error, `sqrt(sum w^2)`.
    #[must_use]
    pub fn error(&self) -> Array1<f64> {
        self.error2.mapv(f64::sqrt)
    }

    /// Indices (into the sample's event list) of the events feeding `bin`.
    #[must_use]
    pub fn event_list(&self, bin: usize) -> &[usize] {
        &self.event_lists[bin]
    }
}

/// Counters reported after event loading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Events passing the selection cut and landing in a bin.
    pub selected: usize,
    /// Events rejected by the selection cut.
    pub rejected: usize,
    /// Events passing the cut but failing every bin.
    pub unbinned: usize,
}

/// An event list bound to a selection cut and a binning.
#[derive(Clone, Debug)]
pub struct Sample {
    name: String,
    index: usize,
    selection: Option<Formula>,
    binning: BinSet,
    events: Vec<Event>,
    histogram: Histogram,
    data: Option<Array1<f64>>,
    enabled: bool,
    keep_unbinned: bool,
}

impl Sample {
    /// Constructor.
    #[must_use]
    pub fn new(name: &str, index: usize, binning: BinSet, selection: Option<Formula>) -> Self {
        let bins = binning.len();

        Self {
            name: name.to_owned(),
            index,
            selection,
            binning,
            events: Vec::new(),
            histogram: Histogram::new(bins),
            data: None,
            enabled: true,
            keep_unbinned: false,
        }
    }

    /// Keeps events that fail every bin instead of discarding them. They
    /// stay out of the histogram either way.
    #[must_use]
    pub const fn keep_unbinned_events(mut self) -> Self {
        self.keep_unbinned = true;
        self
    }

    /// Applies the selection cut to `events`, assigns sample and bin
    /// indices, and appends the survivors to this sample.
    ///
    /// # Errors
    ///
    /// Forwards formula evaluation failures, annotated with the event
    /// entry.
    pub fn load_events(&mut self, events: Vec<Event>) -> Result<LoadReport, LoadError> {
        let mut report = LoadReport::default();

        for mut event in events {
            if let Some(selection) = &self.selection {
                if !selection.eval(event.variables())? {
                    report.rejected += 1;
                    continue;
                }
            }

            event.set_sample_index(self.index);
            let bin = self.binning.find_bin(event.variables());
            event.set_bin_index(bin);

            match bin {
                Some(bin) => {
                    report.selected += 1;
                    self.histogram.event_lists[bin].push(self.events.len());
                    self.events.push(event);
                }
                None => {
                    report.unbinned += 1;
                    if self.keep_unbinned {
                        self.events.push(event);
                    }
                }
            }
        }

        info!(
            "sample '{}': {} selected, {} rejected by cut, {} unbinned",
            self.name, report.selected, report.rejected, report.unbinned
        );
        Ok(report)
    }

    /// Refills the histogram from the current event weights into the
    /// preallocated storage.
    pub fn refill_histogram(&mut self) {
        self.histogram.content.fill(0.0);
        self.histogram.error2.fill(0.0);

        for (bin, list) in self.histogram.event_lists.iter().enumerate() {
            let mut content = 0.0;
            let mut error2 = 0.0;
            for &index in list {
                let weight = self.events[index].current_weight();
                content += weight;
                error2 += weight * weight;
            }
            self.histogram.content[bin] = content;
            self.histogram.error2[bin] = error2;
        }
    }

    /// Copies the current MC prediction into the data slot.
    pub fn snapshot_as_data(&mut self) {
        self.data = Some(self.histogram.content.clone());
    }

    /// Binds an externally observed histogram as the data slot.
    ///
    /// # Panics
    ///
    /// Panics if the histogram length does not match the binning.
    pub fn set_data(&mut self, data: Array1<f64>) {
        assert_eq!(data.len(), self.binning.len());
        self.data = Some(data);
    }

    /// Name of the sample.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index of the sample within the propagator.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// The bound binning.
    #[must_use]
    pub const fn binning(&self) -> &BinSet {
        &self.binning
    }

    /// The owned events.
    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Mutable access to the owned events (reweighting).
    pub fn events_mut(&mut self) -> &mut [Event] {
        &mut self.events
    }

    /// The current MC histogram.
    #[must_use]
    pub const fn histogram(&self) -> &Histogram {
        &self.histogram
    }

    /// The data histogram, once a preset bound one.
    #[must_use]
    pub const fn data(&self) -> Option<&Array1<f64>> {
        self.data.as_ref()
    }

    /// Whether the sample participates in the likelihood.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enables or disables the sample.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}

impl Display for Sample {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sample '{}': {} events over {} bins",
            self.name,
            self.events.len(),
            self.binning.len()
        )
    }
}
