//! Module containing the [`Event`] type and its variable store.

use crate::error::LoadError;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

/// A single value stored in an event's variable bag.
///
/// Variables are either scalar or per-event arrays; integral values keep
/// their type until a numeric access is requested.
#[derive(Clone, Debug, PartialEq)]
pub enum Variable {
    /// A scalar floating-point value.
    Float(f64),
    /// A scalar integral value.
    Int(i64),
    /// A per-event array of floating-point values.
    FloatArray(Vec<f64>),
    /// A per-event array of integral values.
    IntArray(Vec<i64>),
}

impl Variable {
    /// Numeric view of this variable at `index`.
    ///
    /// Scalars ignore `index`; arrays return `None` when `index` is out of
    /// range.
    #[must_use]
    pub fn as_f64(&self, index: usize) -> Option<f64> {
        match self {
            Self::Float(value) => Some(*value),
            #[allow(clippy::cast_precision_loss)]
            Self::Int(value) => Some(*value as f64),
            Self::FloatArray(values) => values.get(index).copied(),
            #[allow(clippy::cast_precision_loss)]
            Self::IntArray(values) => values.get(index).map(|value| *value as f64),
        }
    }
}

/// Ordered variable bag shared by the events of one dataset.
///
/// The variable names are interned once per dataset; each event stores only
/// its values. The bag is frozen after load: there is no mutable access.
#[derive(Clone, Debug)]
pub struct VariableStore {
    names: Arc<[String]>,
    values: Vec<Variable>,
}

impl VariableStore {
    /// Constructor.
    ///
    /// # Panics
    ///
    /// Panics if `values` does not have one entry per name.
    #[must_use]
    pub fn new(names: Arc<[String]>, values: Vec<Variable>) -> Self {
        assert_eq!(names.len(), values.len());

        Self { names, values }
    }

    /// Returns the index of variable `name`, if present.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|known| known == name)
    }

    /// Returns the variable called `name`, if present.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.index_of(name).map(|index| &self.values[index])
    }

    /// Returns the variable at `index`.
    #[must_use]
    pub fn value(&self, index: usize) -> &Variable {
        &self.values[index]
    }

    /// Returns the interned variable names.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A simulated or observed event.
///
/// Events carry the indices binding them to their dataset, sample and bin,
/// a `(base, current)` weight pair and a frozen variable bag. The current
/// weight is the only mutable state; it equals the base weight immediately
/// after [`Event::reset_weight`].
#[derive(Clone, Debug)]
pub struct Event {
    dataset_index: usize,
    entry_index: u64,
    sample_index: Option<usize>,
    bin_index: Option<usize>,
    base_weight: f64,
    current_weight: f64,
    variables: VariableStore,
}

impl Event {
    /// Constructor. The event starts unassigned; sample and bin indices are
    /// set during sample loading.
    #[must_use]
    pub fn new(dataset_index: usize, entry_index: u64, base_weight: f64, variables: VariableStore) -> Self {
        Self {
            dataset_index,
            entry_index,
            sample_index: None,
            bin_index: None,
            base_weight,
            current_weight: base_weight,
            variables,
        }
    }

    /// Index of the dataset this event was read from.
    #[must_use]
    pub const fn dataset_index(&self) -> usize {
        self.dataset_index
    }

    /// Source entry id within the dataset.
    #[must_use]
    pub const fn entry_index(&self) -> u64 {
        self.entry_index
    }

    /// Index of the sample this event was assigned to, if any.
    #[must_use]
    pub const fn sample_index(&self) -> Option<usize> {
        self.sample_index
    }

    /// Index of the bin this event falls into; `None` iff the event fails
    /// all bins of its sample's binning.
    #[must_use]
    pub const fn bin_index(&self) -> Option<usize> {
        self.bin_index
    }

    /// The weight assigned at load time.
    #[must_use]
    pub const fn base_weight(&self) -> f64 {
        self.base_weight
    }

    /// The reweighted weight of the current propagation pass.
    #[must_use]
    pub const fn current_weight(&self) -> f64 {
        self.current_weight
    }

    /// The frozen variable bag.
    #[must_use]
    pub const fn variables(&self) -> &VariableStore {
        &self.variables
    }

    /// Numeric value of variable `name`, or an error naming this event.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::UnknownVariable`] when the bag has no variable
    /// called `name`.
    pub fn fetch(&self, name: &str) -> Result<f64, LoadError> {
        self.variables
            .get(name)
            .and_then(|variable| variable.as_f64(0))
            .ok_or_else(|| LoadError::UnknownVariable {
                entry: self.entry_index,
                name: name.to_owned(),
            })
    }

    pub(crate) fn set_sample_index(&mut self, index: usize) {
        self.sample_index = Some(index);
    }

    pub(crate) fn set_bin_index(&mut self, index: Option<usize>) {
        self.bin_index = index;
    }

    /// Sets the current weight back to the base weight.
    pub fn reset_weight(&mut self) {
        self.current_weight = self.base_weight;
    }

    /// Multiplies the current weight by a dial response.
    pub fn multiply_weight(&mut self, response: f64) {
        self.current_weight *= response;
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "event {{ dataset: {}, entry: {}, sample: {:?}, bin: {:?}, weight: {}/{} }}",
            self.dataset_index,
            self.entry_index,
            self.sample_index,
            self.bin_index,
            self.current_weight,
            self.base_weight
        )
    }
}
