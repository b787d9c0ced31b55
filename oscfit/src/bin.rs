//! Module that contains helpers for binning events.
//!
//! A [`BinSet`] is an ordered list of axis-aligned hyperrectangles over
//! named event variables. Bin order is user-defined and determines the
//! histogram index; lookup returns the first matching bin.

use crate::event::VariableStore;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Error type which is returned when a binning definition fails validation.
#[derive(Debug, Error)]
pub enum MalformedBinning {
    /// A line of the binning file could not be parsed.
    #[error("line {line}: could not parse '{text}': expected {expected}")]
    Parse {
        /// One-based line number.
        line: usize,
        /// The offending text.
        text: String,
        /// What the parser expected.
        expected: String,
    },
    /// A bin constrains the same variable twice.
    #[error("line {line}: variable '{name}' is constrained twice")]
    DuplicateVariable {
        /// One-based line number.
        line: usize,
        /// The repeated variable name.
        name: String,
    },
    /// An edge pair is empty or inverted.
    #[error("line {line}: empty edge interval [{low}, {high}) for variable '{name}'")]
    EmptyInterval {
        /// One-based line number.
        line: usize,
        /// The variable name.
        name: String,
        /// Lower (inclusive) edge.
        low: f64,
        /// Upper (exclusive) edge.
        high: f64,
    },
    /// Two bins overlap along their shared variable axes.
    #[error("bins {first} and {second} overlap over their shared axes")]
    Overlap {
        /// Index of the earlier bin.
        first: usize,
        /// Index of the later bin.
        second: usize,
    },
}

/// A `[low, high)` constraint on one named variable.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BinEdges {
    /// Name of the constrained variable.
    pub name: String,
    /// Lower edge, inclusive.
    pub low: f64,
    /// Upper edge, exclusive.
    pub high: f64,
}

impl BinEdges {
    fn accepts(&self, value: f64) -> bool {
        value >= self.low && value < self.high
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.low < other.high && other.low < self.high
    }
}

/// An axis-aligned hyperrectangle over a subset of the event variables.
///
/// A point lies in the bin iff every edge constraint holds.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Bin {
    edges: Vec<BinEdges>,
}

impl Bin {
    /// Constructor.
    #[must_use]
    pub fn new(edges: Vec<BinEdges>) -> Self {
        Self { edges }
    }

    /// Returns the edge constraints of this bin.
    #[must_use]
    pub fn edges(&self) -> &[BinEdges] {
        &self.edges
    }

    /// Returns `true` iff all edge constraints accept `variables`.
    ///
    /// Variables the bin does not constrain are ignored; a constrained
    /// variable missing from the bag rejects the point.
    #[must_use]
    pub fn contains(&self, variables: &VariableStore) -> bool {
        self.edges.iter().all(|edge| {
            variables
                .get(&edge.name)
                .and_then(|variable| variable.as_f64(0))
                .is_some_and(|value| edge.accepts(value))
        })
    }

    /// Two bins can both accept a point unless some shared variable has
    /// disjoint intervals.
    fn conflicts_with(&self, other: &Self) -> bool {
        self.edges.iter().all(|edge| {
            other
                .edges
                .iter()
                .find(|candidate| candidate.name == edge.name)
                .is_none_or(|candidate| edge.overlaps(candidate))
        })
    }
}

impl Display for Bin {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.edges
                .iter()
                .map(|edge| format!("{}:[{},{})", edge.name, edge.low, edge.high))
                .join(" ")
        )
    }
}

/// Ordered sequence of disjoint bins.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BinSet {
    bins: Vec<Bin>,
}

impl BinSet {
    /// Constructor. Verifies that the bins are pairwise disjoint over their
    /// shared variable axes.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedBinning::Overlap`] naming the first offending
    /// pair.
    pub fn new(bins: Vec<Bin>) -> Result<Self, MalformedBinning> {
        for ((first, lhs), (second, rhs)) in bins.iter().enumerate().tuple_combinations() {
            if lhs.conflicts_with(rhs) {
                return Err(MalformedBinning::Overlap { first, second });
            }
        }

        Ok(Self { bins })
    }

    /// Parses a binning definition: one bin per line, whitespace-separated
    /// `name:[low,high)` tokens, `#` starts a comment.
    ///
    /// # Errors
    ///
    /// Returns a [`MalformedBinning`] describing the first parse or
    /// disjointness failure.
    pub fn parse(text: &str) -> Result<Self, MalformedBinning> {
        let mut bins = Vec::new();

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let content = raw.split('#').next().unwrap_or("").trim();
            if content.is_empty() {
                continue;
            }

            let mut edges: Vec<BinEdges> = Vec::new();
            for token in content.split_whitespace() {
                let edge = parse_edge_token(token, line)?;
                if edges.iter().any(|known| known.name == edge.name) {
                    return Err(MalformedBinning::DuplicateVariable {
                        line,
                        name: edge.name,
                    });
                }
                if edge.low >= edge.high {
                    return Err(MalformedBinning::EmptyInterval {
                        line,
                        name: edge.name,
                        low: edge.low,
                        high: edge.high,
                    });
                }
                edges.push(edge);
            }

            bins.push(Bin::new(edges));
        }

        Self::new(bins)
    }

    /// Loads a binning definition from `path`.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::LoadError`] when the file is unreadable or
    /// malformed.
    pub fn load(path: &Path) -> Result<Self, crate::error::LoadError> {
        Ok(Self::parse(&fs::read_to_string(path)?)?)
    }

    /// Returns the index of the first bin containing `variables`, or `None`
    /// when every bin rejects the point.
    ///
    /// Linear scan, `O(bins x dims)`; bin order is significant.
    #[must_use]
    pub fn find_bin(&self, variables: &VariableStore) -> Option<usize> {
        self.bins.iter().position(|bin| bin.contains(variables))
    }

    /// Returns the number of bins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    /// Returns `true` iff the set holds no bins.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// Returns the bins in order.
    #[must_use]
    pub fn bins(&self) -> &[Bin] {
        &self.bins
    }
}

fn parse_edge_token(token: &str, line: usize) -> Result<BinEdges, MalformedBinning> {
    let fail = |expected: &str| MalformedBinning::Parse {
        line,
        text: token.to_owned(),
        expected: expected.to_owned(),
    };

    let (name, interval) = token.split_once(':').ok_or_else(|| fail("'name:[low,high)'"))?;
    let interval = interval
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| fail("an interval of the form '[low,high)'"))?;
    let (low, high) = interval.split_once(',').ok_or_else(|| fail("two comma-separated edges"))?;

    Ok(BinEdges {
        name: name.to_owned(),
        low: low.trim().parse().map_err(|_| fail("a numeric lower edge"))?,
        high: high.trim().parse().map_err(|_| fail("a numeric upper edge"))?,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event::Variable;

    fn point(enu: f64, q2: f64) -> VariableStore {
        VariableStore::new(
            vec!["enu".to_owned(), "q2".to_owned()].into(),
            vec![Variable::Float(enu), Variable::Float(q2)],
        )
    }

    #[test]
    fn parse_and_find() {
        let binning = BinSet::parse(
            "# two-dimensional binning\n\
             enu:[0.0,1.0) q2:[0.0,0.5)\n\
             enu:[0.0,1.0) q2:[0.5,1.0)\n\
             enu:[1.0,3.0)  # inclusive in q2\n",
        )
        .unwrap();

        assert_eq!(binning.len(), 3);
        assert_eq!(binning.find_bin(&point(0.5, 0.2)), Some(0));
        assert_eq!(binning.find_bin(&point(0.5, 0.7)), Some(1));
        assert_eq!(binning.find_bin(&point(2.0, 0.7)), Some(2));
        assert_eq!(binning.find_bin(&point(5.0, 0.2)), None);
        // lower edge is inclusive, upper is exclusive
        assert_eq!(binning.find_bin(&point(1.0, 0.0)), Some(2));
        assert_eq!(binning.find_bin(&point(0.0, 0.5)), Some(1));
    }

    #[test]
    fn overlap_is_rejected() {
        let result = BinSet::parse(
            "enu:[0.0,1.0)\n\
             enu:[0.5,2.0)\n",
        );

        assert!(matches!(
            result,
            Err(MalformedBinning::Overlap { first: 0, second: 1 })
        ));
    }

    #[test]
    fn disjoint_axes_overlap() {
        // no shared variable: any point satisfying both exists
        let result = BinSet::parse(
            "enu:[0.0,1.0)\n\
             q2:[0.0,1.0)\n",
        );

        assert!(matches!(result, Err(MalformedBinning::Overlap { .. })));
    }

    #[test]
    fn parse_failures() {
        assert!(matches!(
            BinSet::parse("enu:0.0,1.0\n"),
            Err(MalformedBinning::Parse { line: 1, .. })
        ));
        assert!(matches!(
            BinSet::parse("enu:[zero,1.0)\n"),
            Err(MalformedBinning::Parse { .. })
        ));
        assert!(matches!(
            BinSet::parse("enu:[1.0,1.0)\n"),
            Err(MalformedBinning::EmptyInterval { .. })
        ));
        assert!(matches!(
            BinSet::parse("enu:[0.0,1.0) enu:[1.0,2.0)\n"),
            Err(MalformedBinning::DuplicateVariable { .. })
        ));
    }

    #[test]
    fn display_round_trip() {
        let binning = BinSet::parse("enu:[0.0,1.0) q2:[0.5,1.0)\n").unwrap();

        assert_eq!(binning.bins()[0].to_string(), "enu:[0,1) q2:[0.5,1)");
    }
}
