//! Module containing the dial variants and their application scope.
//!
//! A dial is a scalar response function of one parameter that multiplies an
//! event weight. The variants are modeled as a tagged enum behind
//! [`DialResponse`], which keeps the per-event inner loop free of vtable
//! chasing after dispatch.

use crate::bin::Bin;
use crate::event::VariableStore;
use crate::formula::{Formula, FormulaError};
use enum_dispatch::enum_dispatch;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Error type returned when a dial definition is invalid.
#[derive(Debug, Error)]
pub enum DialError {
    /// A tabulated dial needs at least two points.
    #[error("dial '{label}' needs at least two points, got {points}")]
    NotEnoughPoints {
        /// Identity of the dial.
        label: String,
        /// Number of points supplied.
        points: usize,
    },
    /// The tabulated abscissae must be strictly increasing.
    #[error("dial '{label}' has non-increasing x values at index {index}")]
    UnsortedPoints {
        /// Identity of the dial.
        label: String,
        /// Index of the first offending point.
        index: usize,
    },
}

/// Outcome of a strict dial dropping below its response floor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BelowFloor {
    /// The parameter value the dial was evaluated at.
    pub x: f64,
    /// The offending response.
    pub response: f64,
    /// The configured floor.
    pub floor: f64,
}

/// Trait each dial response variant must implement.
#[enum_dispatch]
pub trait DialResponse {
    /// Evaluates the raw response at parameter value `x`.
    fn evaluate(&self, x: f64) -> f64;

    /// The `x` range the response is tabulated over, if any.
    fn domain(&self) -> Option<(f64, f64)>;

    /// Short kind tag used in diagnostics.
    fn kind(&self) -> &'static str;
}

/// Enum which lists all possible dial response variants.
#[enum_dispatch(DialResponse)]
#[derive(Clone, Debug)]
pub enum DialEnum {
    /// Constant-gain response, linear in the parameter value.
    NormDial,
    /// Piecewise-linear interpolation of a tabulated curve.
    GraphDial,
    /// Cubic spline with clamped endpoints.
    SplineDial,
}

/// Normalization dial: the parameter value scales the weight linearly.
#[derive(Clone, Copy, Debug, Default)]
pub struct NormDial;

impl DialResponse for NormDial {
    fn evaluate(&self, x: f64) -> f64 {
        x
    }

    fn domain(&self) -> Option<(f64, f64)> {
        None
    }

    fn kind(&self) -> &'static str {
        "norm"
    }
}

/// Piecewise-linear interpolation of a tabulated `(x, y)` curve, clamped to
/// the tabulated range.
#[derive(Clone, Debug)]
pub struct GraphDial {
    x: Vec<f64>,
    y: Vec<f64>,
}

impl GraphDial {
    /// Constructor. The points must be sorted by strictly increasing `x`.
    ///
    /// # Errors
    ///
    /// Returns a [`DialError`] when fewer than two points are given or the
    /// abscissae are not strictly increasing.
    pub fn new(points: &[(f64, f64)], label: &str) -> Result<Self, DialError> {
        validate_abscissae(points, label)?;

        Ok(Self {
            x: points.iter().map(|&(x, _)| x).collect(),
            y: points.iter().map(|&(_, y)| y).collect(),
        })
    }
}

impl DialResponse for GraphDial {
    fn evaluate(&self, x: f64) -> f64 {
        let x = x.clamp(self.x[0], *self.x.last().unwrap());
        // partition_point returns the first index with x[i] > x, so the
        // segment is [index - 1, index]
        let index = self
            .x
            .partition_point(|&known| known <= x)
            .clamp(1, self.x.len() - 1);
        let fraction = (x - self.x[index - 1]) / (self.x[index] - self.x[index - 1]);

        (self.y[index] - self.y[index - 1]).mul_add(fraction, self.y[index - 1])
    }

    fn domain(&self) -> Option<(f64, f64)> {
        Some((self.x[0], *self.x.last().unwrap()))
    }

    fn kind(&self) -> &'static str {
        "graph"
    }
}

/// Natural cubic spline with the boundary policy "clamp at endpoints":
/// outside the tabulated range the endpoint value is returned, never an
/// extrapolation.
#[derive(Clone, Debug)]
pub struct SplineDial {
    x: Vec<f64>,
    y: Vec<f64>,
    // per-segment polynomial coefficients S(t) = y[i] + b t + c t^2 + d t^3
    // with t = x - x[i]
    coeffs: Vec<(f64, f64, f64)>,
    // knot spacing when the knots are equidistant
    step: Option<f64>,
}

impl SplineDial {
    /// Constructor. Computes natural-spline coefficients; when the knots are
    /// equidistant the segment lookup uses the direct-index fast path.
    ///
    /// # Errors
    ///
    /// Returns a [`DialError`] when fewer than two knots are given or the
    /// abscissae are not strictly increasing.
    pub fn new(points: &[(f64, f64)], label: &str) -> Result<Self, DialError> {
        validate_abscissae(points, label)?;

        let x: Vec<f64> = points.iter().map(|&(x, _)| x).collect();
        let y: Vec<f64> = points.iter().map(|&(_, y)| y).collect();
        let second = natural_second_derivatives(&x, &y);

        let coeffs = (0..x.len() - 1)
            .map(|i| {
                let h = x[i + 1] - x[i];
                let b = (y[i + 1] - y[i]) / h - h * (2.0 * second[i] + second[i + 1]) / 6.0;
                let c = second[i] / 2.0;
                let d = (second[i + 1] - second[i]) / (6.0 * h);
                (b, c, d)
            })
            .collect();

        let step = equidistant_step(&x);

        Ok(Self { x, y, coeffs, step })
    }

    // callers guarantee x lies strictly inside the knot range, so the
    // fast-path quotient is non-negative
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn segment(&self, x: f64) -> usize {
        self.step.map_or_else(
            || self.x.partition_point(|&known| known <= x).clamp(1, self.x.len() - 1) - 1,
            |step| (((x - self.x[0]) / step) as usize).min(self.x.len() - 2),
        )
    }
}

impl DialResponse for SplineDial {
    fn evaluate(&self, x: f64) -> f64 {
        // no extrapolation outside the knot range
        if x <= self.x[0] {
            return self.y[0];
        }
        if x >= *self.x.last().unwrap() {
            return *self.y.last().unwrap();
        }

        let index = self.segment(x);
        let (b, c, d) = self.coeffs[index];
        let t = x - self.x[index];

        d.mul_add(t, c).mul_add(t, b).mul_add(t, self.y[index])
    }

    fn domain(&self) -> Option<(f64, f64)> {
        Some((self.x[0], *self.x.last().unwrap()))
    }

    fn kind(&self) -> &'static str {
        "spline"
    }
}

fn validate_abscissae(points: &[(f64, f64)], label: &str) -> Result<(), DialError> {
    if points.len() < 2 {
        return Err(DialError::NotEnoughPoints {
            label: label.to_owned(),
            points: points.len(),
        });
    }

    if let Some(index) = points
        .windows(2)
        .position(|pair| pair[0].0 >= pair[1].0)
    {
        return Err(DialError::UnsortedPoints {
            label: label.to_owned(),
            index,
        });
    }

    Ok(())
}

// Thomas algorithm for the natural-spline tridiagonal system; the boundary
// second derivatives are zero.
fn natural_second_derivatives(x: &[f64], y: &[f64]) -> Vec<f64> {
    let n = x.len();
    let mut second = vec![0.0; n];
    if n < 3 {
        return second;
    }

    let mut diag = vec![0.0; n];
    let mut rhs = vec![0.0; n];

    for i in 1..n - 1 {
        let h0 = x[i] - x[i - 1];
        let h1 = x[i + 1] - x[i];
        let slope0 = (y[i] - y[i - 1]) / h0;
        let slope1 = (y[i + 1] - y[i]) / h1;

        let mut pivot = 2.0 * (h0 + h1);
        let mut target = 6.0 * (slope1 - slope0);
        if i > 1 {
            let factor = h0 / diag[i - 1];
            pivot -= factor * h0;
            target -= factor * rhs[i - 1];
        }
        diag[i] = pivot;
        rhs[i] = target;
    }

    for i in (1..n - 1).rev() {
        let h1 = x[i + 1] - x[i];
        let upper = if i < n - 2 { h1 * second[i + 1] } else { 0.0 };
        second[i] = (rhs[i] - upper) / diag[i];
    }

    second
}

#[allow(clippy::cast_precision_loss)]
fn equidistant_step(x: &[f64]) -> Option<f64> {
    let step = (x[x.len() - 1] - x[0]) / (x.len() - 1) as f64;
    x.windows(2)
        .all(|pair| ((pair[1] - pair[0]) - step).abs() <= 1e-9 * step.abs())
        .then_some(step)
}

/// A dial response together with its application scope and response policy.
#[derive(Clone, Debug)]
pub struct Dial {
    label: String,
    response: DialEnum,
    apply_bin: Option<Bin>,
    floor: f64,
    strict: bool,
}

impl Dial {
    /// Constructor with the default policy: floor `0`, strict.
    #[must_use]
    pub fn new(label: &str, response: DialEnum) -> Self {
        Self {
            label: label.to_owned(),
            response,
            apply_bin: None,
            floor: 0.0,
            strict: true,
        }
    }

    /// Restricts the dial to events inside `bin`.
    #[must_use]
    pub fn with_apply_bin(mut self, bin: Bin) -> Self {
        self.apply_bin = Some(bin);
        self
    }

    /// Overrides the response floor and the strictness of its enforcement.
    ///
    /// Strict dials raise on a response below the floor; lenient dials
    /// clamp to it.
    #[must_use]
    pub const fn with_floor(mut self, floor: f64, strict: bool) -> Self {
        self.floor = floor;
        self.strict = strict;
        self
    }

    /// Returns `true` iff the dial applies to an event with `variables`,
    /// i.e. the event lies inside the apply-bin (when one is set).
    #[must_use]
    pub fn applies_to(&self, variables: &VariableStore) -> bool {
        self.apply_bin
            .as_ref()
            .is_none_or(|bin| bin.contains(variables))
    }

    /// Evaluates the response at `x`, applying the floor policy.
    ///
    /// # Errors
    ///
    /// Returns [`BelowFloor`] when the dial is strict and the response
    /// drops below the floor.
    pub fn respond(&self, x: f64) -> Result<f64, BelowFloor> {
        let response = self.response.evaluate(x);

        if response < self.floor {
            if self.strict {
                return Err(BelowFloor {
                    x,
                    response,
                    floor: self.floor,
                });
            }
            return Ok(self.floor);
        }

        Ok(response)
    }

    /// Identity of the dial as given at construction.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The underlying response variant.
    #[must_use]
    pub const fn response(&self) -> &DialEnum {
        &self.response
    }
}

impl Display for Dial {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label, self.response.kind())
    }
}

/// The dials a parameter applies to one slice of the simulated datasets.
///
/// A parameter may carry several dial sets, each targeting different
/// samples; an optional formula further gates which events the set applies
/// to. Within one set, the first dial whose apply-bin contains the event
/// wins.
#[derive(Clone, Debug)]
pub struct DialSet {
    samples: Option<Vec<String>>,
    apply_formula: Option<Formula>,
    dials: Vec<Dial>,
}

impl DialSet {
    /// Constructor for a set applying to every sample.
    #[must_use]
    pub fn new(dials: Vec<Dial>) -> Self {
        Self {
            samples: None,
            apply_formula: None,
            dials,
        }
    }

    /// Restricts the set to the named samples.
    #[must_use]
    pub fn with_samples(mut self, samples: Vec<String>) -> Self {
        self.samples = Some(samples);
        self
    }

    /// Gates the set behind a formula over event variables.
    #[must_use]
    pub fn with_apply_formula(mut self, formula: Formula) -> Self {
        self.apply_formula = Some(formula);
        self
    }

    /// Returns `true` iff the set targets the sample called `name`.
    #[must_use]
    pub fn targets_sample(&self, name: &str) -> bool {
        self.samples
            .as_ref()
            .is_none_or(|samples| samples.iter().any(|sample| sample == name))
    }

    /// Evaluates the apply-formula against an event, `true` when none is
    /// set.
    ///
    /// # Errors
    ///
    /// Forwards formula evaluation errors.
    pub fn accepts(&self, variables: &VariableStore) -> Result<bool, FormulaError> {
        self.apply_formula
            .as_ref()
            .map_or(Ok(true), |formula| formula.eval(variables))
    }

    /// The dials of this set, in application order.
    #[must_use]
    pub fn dials(&self) -> &[Dial] {
        &self.dials
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bin::{BinEdges, Bin};
    use crate::event::Variable;
    use float_cmp::assert_approx_eq;

    #[test]
    fn norm_dial_is_the_identity() {
        let dial = NormDial;

        assert_approx_eq!(f64, dial.evaluate(0.37), 0.37);
        assert_approx_eq!(f64, dial.evaluate(-2.0), -2.0);
    }

    #[test]
    fn graph_dial_interpolates_and_clamps() {
        let dial = GraphDial::new(&[(-1.0, 0.5), (0.0, 1.0), (1.0, 2.0)], "g").unwrap();

        assert_approx_eq!(f64, dial.evaluate(-0.5), 0.75);
        assert_approx_eq!(f64, dial.evaluate(0.5), 1.5);
        assert_approx_eq!(f64, dial.evaluate(0.0), 1.0);
        // clamped to the tabulated range
        assert_approx_eq!(f64, dial.evaluate(-10.0), 0.5);
        assert_approx_eq!(f64, dial.evaluate(10.0), 2.0);
    }

    #[test]
    fn spline_dial_reproduces_linear_curves() {
        // a natural spline through collinear points stays linear
        let points: Vec<_> = (0..5).map(|i| (f64::from(i), 2.0 * f64::from(i) + 1.0)).collect();
        let dial = SplineDial::new(&points, "s").unwrap();

        assert_approx_eq!(f64, dial.evaluate(0.5), 2.0, epsilon = 1e-12);
        assert_approx_eq!(f64, dial.evaluate(2.25), 5.5, epsilon = 1e-12);
        assert_approx_eq!(f64, dial.evaluate(3.9), 8.8, epsilon = 1e-12);
    }

    #[test]
    fn spline_dial_clamps_at_endpoints() {
        let dial = SplineDial::new(&[(-3.0, 0.4), (0.0, 1.0), (3.0, 1.8)], "s").unwrap();

        assert_approx_eq!(f64, dial.evaluate(5.0), dial.evaluate(3.0));
        assert_approx_eq!(f64, dial.evaluate(-10.0), dial.evaluate(-3.0));
        assert_approx_eq!(f64, dial.evaluate(5.0), 1.8);
        assert_approx_eq!(f64, dial.evaluate(-10.0), 0.4);
    }

    #[test]
    fn spline_fast_path_matches_search_path() {
        let points: Vec<_> = (0..7)
            .map(|i| (f64::from(i) * 0.5 - 1.5, (f64::from(i) * 0.8).sin() + 2.0))
            .collect();
        let fast = SplineDial::new(&points, "fast").unwrap();
        assert!(fast.step.is_some());

        // same knots with the fast path disabled
        let mut slow = fast.clone();
        slow.step = None;

        for i in 0..100 {
            let x = -1.6 + f64::from(i) * 0.032;
            assert_approx_eq!(f64, fast.evaluate(x), slow.evaluate(x), epsilon = 1e-12);
        }
    }

    #[test]
    fn strict_floor_raises_lenient_clamps() {
        let points = [(0.0, -0.5), (1.0, 1.0)];

        let strict = Dial::new("d", GraphDial::new(&points, "d").unwrap().into());
        let below = strict.respond(0.0).unwrap_err();
        assert_approx_eq!(f64, below.response, -0.5);
        assert_approx_eq!(f64, below.floor, 0.0);

        let lenient =
            Dial::new("d", GraphDial::new(&points, "d").unwrap().into()).with_floor(0.0, false);
        assert_approx_eq!(f64, lenient.respond(0.0).unwrap(), 0.0);
        assert_approx_eq!(f64, lenient.respond(1.0).unwrap(), 1.0);
    }

    #[test]
    fn apply_bin_gates_the_dial() {
        let bin = Bin::new(vec![BinEdges {
            name: "enu".to_owned(),
            low: 0.0,
            high: 1.0,
        }]);
        let dial = Dial::new("d", NormDial.into()).with_apply_bin(bin);

        let inside = crate::event::VariableStore::new(
            vec!["enu".to_owned()].into(),
            vec![Variable::Float(0.5)],
        );
        let outside = crate::event::VariableStore::new(
            vec!["enu".to_owned()].into(),
            vec![Variable::Float(1.5)],
        );

        assert!(dial.applies_to(&inside));
        assert!(!dial.applies_to(&outside));
    }

    #[test]
    fn invalid_tabulations_are_rejected() {
        assert!(matches!(
            GraphDial::new(&[(0.0, 1.0)], "g"),
            Err(DialError::NotEnoughPoints { .. })
        ));
        assert!(matches!(
            SplineDial::new(&[(0.0, 1.0), (0.0, 2.0)], "s"),
            Err(DialError::UnsortedPoints { .. })
        ));
    }
}
