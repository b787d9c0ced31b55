//! Module containing the minimizer driver.
//!
//! The driver exposes the fit parameters to a self-contained minimizer
//! pair (a Nelder-Mead simplex pre-pass and a variable-metric main
//! algorithm), optionally in the normalized fit space
//! `u = (x - prior) / sigma`, and extracts a validated post-fit covariance
//! from a finite-difference Hesse pass.

use crate::error::{CovarianceWarning, Error, MinimizerError};
use crate::likelihood::LikelihoodInterface;
use crate::propagator::Propagator;
use crate::runtime::Runtime;
use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Driver life cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MinimizerState {
    /// Nothing configured yet.
    Uninit,
    /// Fit parameters collected, ready to minimize.
    Configured,
    /// Minimization in progress.
    Minimizing,
    /// The EDM target was reached.
    Converged,
    /// The minimizer gave up before the EDM target.
    Failed,
    /// Post-fit errors were evaluated.
    ErrorsEvaluated,
    /// The driver was torn down.
    Finished,
}

/// Status of the underlying algorithm, preserved verbatim with a
/// human-readable translation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MinimizerStatus {
    /// The EDM dropped below the target.
    Success,
    /// The function-call budget was exhausted.
    CallLimit,
    /// The iteration budget was exhausted above the EDM target.
    AboveEdmTarget,
    /// The search direction collapsed (singular curvature estimate).
    Degenerate,
}

impl MinimizerStatus {
    /// Numeric status code of the underlying algorithm.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::CallLimit => 1,
            Self::AboveEdmTarget => 2,
            Self::Degenerate => 3,
        }
    }
}

impl Display for MinimizerStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Success => "status 0: converged",
            Self::CallLimit => "status 1: function-call limit reached",
            Self::AboveEdmTarget => "status 2: iteration limit reached above the EDM target",
            Self::Degenerate => "status 3: degenerate curvature estimate",
        };
        f.write_str(text)
    }
}

/// Post-fit uncertainty algorithm.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorsAlgo {
    /// Covariance from second derivatives.
    #[default]
    Hesse,
    /// Profile-likelihood errors (not implemented, falls back to Hesse).
    Minos,
}

/// `UP` convention of the fit function, fixing the one-sigma contour.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum LikelihoodConvention {
    /// Chi-square-like function, `UP = 1`.
    #[default]
    Chi2,
    /// Negative log-likelihood, `UP = 0.5`.
    NegativeLogLikelihood,
}

impl LikelihoodConvention {
    const fn up(self) -> f64 {
        match self {
            Self::Chi2 => 1.0,
            Self::NegativeLogLikelihood => 0.5,
        }
    }
}

/// Configuration surface of the driver.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MinimizerConfig {
    /// Expose parameters to the minimizer as `(value - prior) / sigma`.
    pub use_normalized_fit_space: bool,
    /// Run a loose-tolerance simplex pass before the main algorithm.
    pub enable_simplex_before_minimize: bool,
    /// Post-fit uncertainty method.
    pub errors_algo: ErrorsAlgo,
    /// Multiplier on all parameter step sizes.
    pub step_size_scaling: f64,
    /// Minimizer tolerance; the EDM target is `0.001 * tolerance * UP`.
    pub tolerance: f64,
    /// Tolerance loosening factor of the simplex pre-pass.
    pub simplex_tolerance_factor: f64,
    /// Iteration budget of the main algorithm.
    pub max_iterations: usize,
    /// Likelihood-call budget across all passes.
    pub max_function_calls: usize,
    /// Abort on a non-finite likelihood instead of steering away from it.
    pub throw_on_bad_llh: bool,
    /// Promote an indefinite post-fit covariance to a hard error.
    pub strict_covariance: bool,
    /// `UP` convention of the fit function.
    pub convention: LikelihoodConvention,
}

impl Default for MinimizerConfig {
    fn default() -> Self {
        Self {
            use_normalized_fit_space: true,
            enable_simplex_before_minimize: false,
            errors_algo: ErrorsAlgo::Hesse,
            step_size_scaling: 1.0,
            tolerance: 1e-4,
            simplex_tolerance_factor: 1000.0,
            max_iterations: 500,
            max_function_calls: 1_000_000,
            throw_on_bad_llh: false,
            strict_covariance: false,
            convention: LikelihoodConvention::Chi2,
        }
    }
}

/// Degrees of freedom exposed to the minimizer: either an original-basis
/// parameter or an eigen coefficient of a decomposed set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FitIndex {
    Original(usize),
    Eigen(usize),
}

#[derive(Clone, Copy, Debug)]
struct FitHandle {
    set: usize,
    index: FitIndex,
}

/// Result of a minimization pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FitMinimum {
    /// Best-fit point in fit-space coordinates.
    pub parameters: Vec<f64>,
    /// Fit function value at the minimum.
    pub total: f64,
    /// Estimated vertical distance to the minimum.
    pub edm: f64,
    /// Status of the underlying algorithm.
    pub status: MinimizerStatus,
    /// Likelihood calls spent so far.
    pub calls: usize,
}

/// Post-fit covariance in both bases, with its spectral diagnostics.
#[derive(Clone, Debug)]
pub struct PostFitCovariance {
    /// Covariance over the minimized degrees of freedom, de-normalized.
    pub fit_space: DMatrix<f64>,
    /// Covariance rotated into original parameter coordinates.
    pub original: DMatrix<f64>,
    /// Row labels of `original`, `"set/parameter"`.
    pub labels: Vec<String>,
    /// Eigenvalues of `original`, descending.
    pub eigenvalues: DVector<f64>,
    /// Condition number, `lambda_min / lambda_max`.
    pub condition: f64,
    /// Non-fatal diagnostics collected during the extraction.
    pub warnings: Vec<CovarianceWarning>,
}

// Borrows everything a likelihood call needs; also carries the call
// counter so every pass shares one budget.
struct FitObjective<'a> {
    handles: &'a [FitHandle],
    normalized: bool,
    likelihood: &'a mut LikelihoodInterface,
    propagator: &'a mut Propagator,
    runtime: &'a Runtime,
    calls: usize,
    max_calls: usize,
    throw_on_bad_llh: bool,
}

impl FitObjective<'_> {
    fn apply(&mut self, x: &[f64]) {
        for (handle, &value) in self.handles.iter().zip(x) {
            let set = &mut self.propagator.parameter_sets_mut()[handle.set];
            match handle.index {
                FitIndex::Original(par) => {
                    let value = if self.normalized {
                        set.parameters()[par].denormalize(value)
                    } else {
                        value
                    };
                    set.parameters_mut()[par].set_value(value);
                }
                FitIndex::Eigen(coeff) => {
                    let value = if self.normalized {
                        value * set.eigen_sigma(coeff)
                    } else {
                        value
                    };
                    set.set_eigen_coefficient(coeff, value);
                }
            }
        }
    }

    fn read(&self) -> Vec<f64> {
        self.handles
            .iter()
            .map(|handle| {
                let set = &self.propagator.parameter_sets()[handle.set];
                match handle.index {
                    FitIndex::Original(par) => {
                        let parameter = &set.parameters()[par];
                        if self.normalized {
                            parameter.normalize(parameter.value())
                        } else {
                            parameter.value()
                        }
                    }
                    FitIndex::Eigen(coeff) => {
                        let value = set.eigen_coefficient(coeff);
                        if self.normalized {
                            value / set.eigen_sigma(coeff)
                        } else {
                            value
                        }
                    }
                }
            })
            .collect()
    }

    fn eval(&mut self, x: &[f64]) -> Result<f64, Error> {
        if self.calls >= self.max_calls {
            // budget exhaustion is handled by the outer loops; steer the
            // line searches out with an infinite value
            return Ok(f64::INFINITY);
        }
        self.calls += 1;

        self.apply(x);
        match self
            .likelihood
            .propagate_and_eval(self.propagator, self.runtime)
        {
            Ok(total) => Ok(total),
            Err(Error::Math(err)) => {
                if self.throw_on_bad_llh {
                    warn!("aborting on bad likelihood: {err}");
                    Err(MinimizerError::BadLikelihood {
                        value: f64::NAN,
                        call: self.calls,
                    }
                    .into())
                } else {
                    warn!("bad likelihood at call {}: {err}", self.calls);
                    Ok(f64::INFINITY)
                }
            }
            Err(err) => Err(err),
        }
    }

    fn step_sizes(&self, scaling: f64) -> Vec<f64> {
        self.handles
            .iter()
            .map(|handle| {
                let set = &self.propagator.parameter_sets()[handle.set];
                match handle.index {
                    FitIndex::Original(par) => {
                        let parameter = &set.parameters()[par];
                        if self.normalized {
                            scaling * parameter.step() / parameter.sigma()
                        } else {
                            scaling * parameter.step()
                        }
                    }
                    // unit prior width in normalized space
                    FitIndex::Eigen(coeff) => {
                        if self.normalized {
                            scaling * 0.1
                        } else {
                            scaling * 0.1 * set.eigen_sigma(coeff)
                        }
                    }
                }
            })
            .collect()
    }

    fn bounds(&self) -> Vec<(Option<f64>, Option<f64>)> {
        self.handles
            .iter()
            .map(|handle| {
                let set = &self.propagator.parameter_sets()[handle.set];
                match handle.index {
                    FitIndex::Original(par) => {
                        let parameter = &set.parameters()[par];
                        let map = |value: f64| {
                            if self.normalized {
                                parameter.normalize(value)
                            } else {
                                value
                            }
                        };
                        (parameter.min().map(map), parameter.max().map(map))
                    }
                    FitIndex::Eigen(_) => (None, None),
                }
            })
            .collect()
    }
}

fn clamp_into(x: &mut [f64], bounds: &[(Option<f64>, Option<f64>)]) {
    for (value, (min, max)) in x.iter_mut().zip(bounds) {
        if let Some(min) = min {
            *value = value.max(*min);
        }
        if let Some(max) = max {
            *value = value.min(*max);
        }
    }
}

fn gradient(
    objective: &mut FitObjective<'_>,
    x: &[f64],
    steps: &[f64],
) -> Result<DVector<f64>, Error> {
    let mut grad = DVector::zeros(x.len());
    let mut probe = x.to_vec();

    for index in 0..x.len() {
        let h = (steps[index].abs() * 0.01).max(1e-7);
        probe[index] = x[index] + h;
        let up = objective.eval(&probe)?;
        probe[index] = x[index] - h;
        let down = objective.eval(&probe)?;
        probe[index] = x[index];
        grad[index] = (up - down) / (2.0 * h);
    }

    Ok(grad)
}

fn hessian(
    objective: &mut FitObjective<'_>,
    x: &[f64],
    steps: &[f64],
) -> Result<DMatrix<f64>, Error> {
    let n = x.len();
    let center = objective.eval(x)?;
    let mut matrix = DMatrix::zeros(n, n);
    let h: Vec<f64> = steps.iter().map(|step| (step.abs() * 0.1).max(1e-5)).collect();
    let mut probe = x.to_vec();

    for i in 0..n {
        probe[i] = x[i] + h[i];
        let up = objective.eval(&probe)?;
        probe[i] = x[i] - h[i];
        let down = objective.eval(&probe)?;
        probe[i] = x[i];
        matrix[(i, i)] = (up - 2.0 * center + down) / (h[i] * h[i]);
    }

    for i in 0..n {
        for j in i + 1..n {
            probe[i] = x[i] + h[i];
            probe[j] = x[j] + h[j];
            let pp = objective.eval(&probe)?;
            probe[j] = x[j] - h[j];
            let pm = objective.eval(&probe)?;
            probe[i] = x[i] - h[i];
            let mm = objective.eval(&probe)?;
            probe[j] = x[j] + h[j];
            let mp = objective.eval(&probe)?;
            probe[i] = x[i];
            probe[j] = x[j];

            let value = (pp - pm - mp + mm) / (4.0 * h[i] * h[j]);
            matrix[(i, j)] = value;
            matrix[(j, i)] = value;
        }
    }

    Ok(matrix)
}

// Variable-metric descent with a BFGS curvature estimate; the stopping
// criterion is the Minuit-style EDM `g^T V g / 2`.
fn variable_metric(
    objective: &mut FitObjective<'_>,
    start: &[f64],
    steps: &[f64],
    bounds: &[(Option<f64>, Option<f64>)],
    edm_target: f64,
    max_iterations: usize,
) -> Result<FitMinimum, Error> {
    let n = start.len();
    let mut x = start.to_vec();
    clamp_into(&mut x, bounds);
    let mut fx = objective.eval(&x)?;
    let mut metric = DMatrix::from_diagonal(&DVector::from_iterator(
        n,
        steps.iter().map(|step| step * step),
    ));
    let mut grad = gradient(objective, &x, steps)?;
    let mut status = MinimizerStatus::AboveEdmTarget;
    let mut edm = f64::INFINITY;

    for _ in 0..max_iterations {
        edm = 0.5 * (&metric * &grad).dot(&grad);
        if edm.abs() < edm_target {
            status = MinimizerStatus::Success;
            break;
        }
        if objective.calls >= objective.max_calls {
            status = MinimizerStatus::CallLimit;
            break;
        }

        let direction = -(&metric * &grad);
        if !direction.iter().all(|component| component.is_finite()) {
            status = MinimizerStatus::Degenerate;
            break;
        }

        // backtracking line search with an Armijo condition
        let slope = direction.dot(&grad);
        let mut lambda: f64 = 1.0;
        let mut accepted = None;
        for _ in 0..40 {
            let mut candidate: Vec<f64> = x
                .iter()
                .zip(direction.iter())
                .map(|(value, step)| lambda.mul_add(*step, *value))
                .collect();
            clamp_into(&mut candidate, bounds);
            let fc = objective.eval(&candidate)?;
            if fc <= slope.mul_add(1e-4 * lambda, fx) {
                accepted = Some((candidate, fc));
                break;
            }
            lambda *= 0.5;
        }
        let Some((x_new, f_new)) = accepted else {
            // the metric no longer produces a descent direction; restart
            // from the raw step sizes once, then give up
            status = MinimizerStatus::Degenerate;
            break;
        };

        let grad_new = gradient(objective, &x_new, steps)?;
        let s = DVector::from_iterator(n, x_new.iter().zip(&x).map(|(new, old)| new - old));
        let y = &grad_new - &grad;
        let sy = s.dot(&y);
        if sy > 1e-12 {
            // BFGS update of the inverse Hessian estimate
            let vy = &metric * &y;
            let yvy = y.dot(&vy);
            metric += (&s * s.transpose()) * ((sy + yvy) / (sy * sy))
                - (&vy * s.transpose() + &s * vy.transpose()) / sy;
        }

        x = x_new;
        fx = f_new;
        grad = grad_new;
    }

    Ok(FitMinimum {
        parameters: x,
        total: fx,
        edm,
        status,
        calls: objective.calls,
    })
}

// Nelder-Mead simplex, used as the loose pre-pass.
#[allow(clippy::cast_precision_loss)]
fn simplex(
    objective: &mut FitObjective<'_>,
    start: &[f64],
    steps: &[f64],
    bounds: &[(Option<f64>, Option<f64>)],
    tolerance: f64,
    max_iterations: usize,
) -> Result<FitMinimum, Error> {
    let n = start.len();
    let mut points: Vec<Vec<f64>> = Vec::with_capacity(n + 1);
    let mut start = start.to_vec();
    clamp_into(&mut start, bounds);
    points.push(start.clone());
    for index in 0..n {
        let mut vertex = start.clone();
        vertex[index] += steps[index];
        clamp_into(&mut vertex, bounds);
        points.push(vertex);
    }
    let mut values = points
        .iter()
        .map(|point| objective.eval(point))
        .collect::<Result<Vec<f64>, Error>>()?;

    let mut status = MinimizerStatus::AboveEdmTarget;
    for _ in 0..max_iterations {
        let mut order: Vec<usize> = (0..=n).collect();
        order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
        let best = order[0];
        let worst = order[n];
        let second_worst = order[n - 1];

        if (values[worst] - values[best]).abs()
            <= tolerance * (values[best].abs() + tolerance)
        {
            status = MinimizerStatus::Success;
            break;
        }
        if objective.calls >= objective.max_calls {
            status = MinimizerStatus::CallLimit;
            break;
        }

        // centroid of all but the worst vertex
        let mut centroid = vec![0.0; n];
        for (index, point) in points.iter().enumerate() {
            if index != worst {
                for (c, value) in centroid.iter_mut().zip(point) {
                    *c += value / n as f64;
                }
            }
        }

        let shifted = |factor: f64| -> Vec<f64> {
            let mut point: Vec<f64> = centroid
                .iter()
                .zip(&points[worst])
                .map(|(c, w)| factor.mul_add(c - w, *c))
                .collect();
            clamp_into(&mut point, bounds);
            point
        };

        let reflected = shifted(1.0);
        let f_reflected = objective.eval(&reflected)?;

        if f_reflected < values[best] {
            let expanded = shifted(2.0);
            let f_expanded = objective.eval(&expanded)?;
            if f_expanded < f_reflected {
                points[worst] = expanded;
                values[worst] = f_expanded;
            } else {
                points[worst] = reflected;
                values[worst] = f_reflected;
            }
        } else if f_reflected < values[second_worst] {
            points[worst] = reflected;
            values[worst] = f_reflected;
        } else {
            let contracted = shifted(-0.5);
            let f_contracted = objective.eval(&contracted)?;
            if f_contracted < values[worst] {
                points[worst] = contracted;
                values[worst] = f_contracted;
            } else {
                // shrink towards the best vertex
                let anchor = points[best].clone();
                for index in 0..=n {
                    if index == best {
                        continue;
                    }
                    for (value, best_value) in points[index].iter_mut().zip(&anchor) {
                        *value = 0.5 * (*value + best_value);
                    }
                    values[index] = objective.eval(&points[index].clone())?;
                }
            }
        }
    }

    let best = (0..=n)
        .min_by(|&a, &b| values[a].total_cmp(&values[b]))
        .unwrap();
    Ok(FitMinimum {
        parameters: points[best].clone(),
        total: values[best],
        edm: f64::NAN,
        status,
        calls: objective.calls,
    })
}

/// Wraps the minimizer pair, manages the fit space and extracts the
/// post-fit covariance.
#[derive(Debug)]
pub struct MinimizerDriver {
    config: MinimizerConfig,
    state: MinimizerState,
    handles: Vec<FitHandle>,
    calls: usize,
    minimum: Option<FitMinimum>,
}

impl MinimizerDriver {
    /// Constructor.
    #[must_use]
    pub fn new(config: MinimizerConfig) -> Self {
        Self {
            config,
            state: MinimizerState::Uninit,
            handles: Vec::new(),
            calls: 0,
            minimum: None,
        }
    }

    /// Current state of the driver.
    #[must_use]
    pub const fn state(&self) -> MinimizerState {
        self.state
    }

    /// The best minimum found so far.
    #[must_use]
    pub const fn minimum(&self) -> Option<&FitMinimum> {
        self.minimum.as_ref()
    }

    /// EDM target, `0.001 * tolerance * UP`.
    #[must_use]
    pub fn edm_target(&self) -> f64 {
        0.001 * self.config.tolerance * self.config.convention.up()
    }

    /// Collects the fit degrees of freedom from `propagator`: non-fixed
    /// enabled parameters, or floating eigen coefficients for decomposed
    /// sets.
    ///
    /// # Errors
    ///
    /// Returns an error when called twice or when no degree of freedom is
    /// left.
    pub fn configure(&mut self, propagator: &Propagator) -> Result<(), Error> {
        self.expect_state(MinimizerState::Uninit)?;

        for (set_index, set) in propagator.parameter_sets().iter().enumerate() {
            if !set.is_enabled() {
                continue;
            }
            if set.is_eigen_decomposed() {
                for coeff in 0..set.eigen_len() {
                    // null directions of a degenerate covariance stay out
                    if !set.eigen_fixed(coeff) && set.eigen_sigma(coeff) > 0.0 {
                        self.handles.push(FitHandle {
                            set: set_index,
                            index: FitIndex::Eigen(coeff),
                        });
                    }
                }
            } else {
                for (par_index, parameter) in set.parameters().iter().enumerate() {
                    if parameter.is_enabled() && !parameter.is_fixed() {
                        self.handles.push(FitHandle {
                            set: set_index,
                            index: FitIndex::Original(par_index),
                        });
                    }
                }
            }
        }

        if self.handles.is_empty() {
            return Err(Error::Config(crate::error::ConfigError::InvalidValue {
                key: "parameterSets".to_owned(),
                reason: "no free parameter to fit".to_owned(),
            }));
        }

        info!(
            "minimizer configured with {} degrees of freedom (normalized fit space: {})",
            self.handles.len(),
            self.config.use_normalized_fit_space
        );
        self.state = MinimizerState::Configured;
        Ok(())
    }

    /// Runs the optional simplex pre-pass and the main minimization.
    ///
    /// A convergence failure is recorded as the `Failed` state, not an
    /// error; callers decide whether to continue to the error evaluation.
    ///
    /// # Errors
    ///
    /// Forwards likelihood failures.
    pub fn minimize(
        &mut self,
        likelihood: &mut LikelihoodInterface,
        propagator: &mut Propagator,
        runtime: &Runtime,
    ) -> Result<&FitMinimum, Error> {
        self.expect_state(MinimizerState::Configured)?;
        self.state = MinimizerState::Minimizing;

        let mut objective = FitObjective {
            handles: &self.handles,
            normalized: self.config.use_normalized_fit_space,
            likelihood,
            propagator,
            runtime,
            calls: self.calls,
            max_calls: self.config.max_function_calls,
            throw_on_bad_llh: self.config.throw_on_bad_llh,
        };
        let steps = objective.step_sizes(self.config.step_size_scaling);
        let bounds = objective.bounds();
        let mut start = objective.read();

        if self.config.enable_simplex_before_minimize {
            // strategy 0: loose tolerance, half the iteration budget
            let pre_pass = simplex(
                &mut objective,
                &start,
                &steps,
                &bounds,
                self.config.tolerance * self.config.simplex_tolerance_factor,
                self.config.max_iterations / 2,
            )?;
            info!(
                "simplex pre-pass ended after {} calls at {}",
                pre_pass.calls, pre_pass.total
            );
            start = pre_pass.parameters;
        }

        let minimum = variable_metric(
            &mut objective,
            &start,
            &steps,
            &bounds,
            self.edm_target(),
            self.config.max_iterations,
        )?;

        objective.apply(&minimum.parameters);
        self.calls = objective.calls;
        self.state = if minimum.status == MinimizerStatus::Success {
            info!(
                "minimum found: {} after {} calls, edm = {:e}",
                minimum.total, minimum.calls, minimum.edm
            );
            MinimizerState::Converged
        } else {
            warn!("minimizer did not converge: {}", minimum.status);
            MinimizerState::Failed
        };
        self.minimum = Some(minimum);
        Ok(self.minimum.as_ref().unwrap())
    }

    /// Evaluates the post-fit covariance at the best-fit point.
    ///
    /// The Hesse matrix is taken by symmetric finite differences in fit
    /// space; the covariance is `2 UP H^-1`, de-normalized, rotated
    /// through the global passage matrix, stripped of fixed and disabled
    /// coordinates and spectrally decomposed. A non-positive eigenvalue is
    /// a recoverable warning unless strict mode is enabled.
    ///
    /// # Errors
    ///
    /// Forwards likelihood failures; returns a [`MinimizerError`] when the
    /// Hesse matrix cannot be inverted, or the promoted warning under
    /// strict mode.
    pub fn evaluate_errors(
        &mut self,
        likelihood: &mut LikelihoodInterface,
        propagator: &mut Propagator,
        runtime: &Runtime,
    ) -> Result<PostFitCovariance, Error> {
        if self.state != MinimizerState::Converged && self.state != MinimizerState::Failed {
            return Err(MinimizerError::InvalidState {
                state: self.state,
                expected: MinimizerState::Converged,
            }
            .into());
        }
        if self.config.errors_algo == ErrorsAlgo::Minos {
            warn!("Minos errors are not implemented, falling back to Hesse");
        }

        let minimum = self.minimum.clone().ok_or(MinimizerError::HesseFailed {
            reason: "no minimum recorded".to_owned(),
        })?;

        let mut objective = FitObjective {
            handles: &self.handles,
            normalized: self.config.use_normalized_fit_space,
            likelihood,
            propagator,
            runtime,
            calls: self.calls,
            max_calls: usize::MAX,
            throw_on_bad_llh: self.config.throw_on_bad_llh,
        };
        let steps = objective.step_sizes(self.config.step_size_scaling);

        let hesse = hessian(&mut objective, &minimum.parameters, &steps)?;
        self.calls = objective.calls;

        let fit_cov = (hesse / (2.0 * self.config.convention.up()))
            .try_inverse()
            .ok_or(MinimizerError::HesseFailed {
                reason: "the Hesse matrix is singular".to_owned(),
            })?;

        // back to physical units before any rotation
        let scales: Vec<f64> = if self.config.use_normalized_fit_space {
            self.handles
                .iter()
                .map(|handle| {
                    let set = &objective.propagator.parameter_sets()[handle.set];
                    match handle.index {
                        FitIndex::Original(par) => set.parameters()[par].sigma(),
                        FitIndex::Eigen(coeff) => set.eigen_sigma(coeff),
                    }
                })
                .collect()
        } else {
            vec![1.0; self.handles.len()]
        };
        let fit_space = DMatrix::from_fn(self.handles.len(), self.handles.len(), |row, col| {
            fit_cov[(row, col)] * scales[row] * scales[col]
        });

        let covariance = self.rotate_to_original(&fit_space, objective.propagator)?;

        // leave the model re-evaluated at the minimum, not at the last probe
        objective.eval(&minimum.parameters)?;
        self.calls = objective.calls;
        self.state = MinimizerState::ErrorsEvaluated;

        if self.config.strict_covariance {
            if let Some(&indefinite) = covariance
                .warnings
                .iter()
                .find(|warning| matches!(warning, CovarianceWarning::Indefinite { .. }))
            {
                return Err(Error::Covariance(indefinite));
            }
        }

        Ok(covariance)
    }

    // Builds the stripped full-space covariance, applies the global passage
    // matrix and decomposes the result.
    fn rotate_to_original(
        &self,
        fit_space: &DMatrix<f64>,
        propagator: &Propagator,
    ) -> Result<PostFitCovariance, Error> {
        // retained coordinates: every parameter of an enabled set except
        // individually disabled ones and parameters fixed in a
        // non-decomposed set; eigen-frozen coefficients are retained and
        // keep their prior variance on the diagonal
        let mut labels = Vec::new();
        let mut coordinates = Vec::new();
        for (set_index, set) in propagator.parameter_sets().iter().enumerate() {
            if !set.is_enabled() {
                continue;
            }
            if set.is_eigen_decomposed() {
                for coeff in 0..set.eigen_len() {
                    coordinates.push((set_index, FitIndex::Eigen(coeff)));
                }
            } else {
                for (par_index, parameter) in set.parameters().iter().enumerate() {
                    if parameter.is_enabled() && !parameter.is_fixed() {
                        coordinates.push((set_index, FitIndex::Original(par_index)));
                    }
                }
            }
            for (par_index, parameter) in set.parameters().iter().enumerate() {
                let retained = if set.is_eigen_decomposed() {
                    true
                } else {
                    parameter.is_enabled() && !parameter.is_fixed()
                };
                if retained {
                    labels.push(set.full_name(par_index));
                }
            }
        }

        let n = coordinates.len();
        let mut full = DMatrix::zeros(n, n);
        // minimized block from the fit covariance
        for (row_fit, row_handle) in self.handles.iter().enumerate() {
            let Some(row) = coordinates
                .iter()
                .position(|&(set, index)| set == row_handle.set && index == row_handle.index)
            else {
                continue;
            };
            for (col_fit, col_handle) in self.handles.iter().enumerate() {
                let Some(col) = coordinates.iter().position(|&(set, index)| {
                    set == col_handle.set && index == col_handle.index
                }) else {
                    continue;
                };
                full[(row, col)] = fit_space[(row_fit, col_fit)];
            }
        }
        // frozen coordinates keep their prior variance
        for (position, &(set_index, index)) in coordinates.iter().enumerate() {
            let in_fit = self
                .handles
                .iter()
                .any(|handle| handle.set == set_index && handle.index == index);
            if !in_fit {
                let set = &propagator.parameter_sets()[set_index];
                full[(position, position)] = match index {
                    FitIndex::Eigen(coeff) => set.eigen_sigma(coeff).powi(2),
                    FitIndex::Original(par) => set.parameters()[par].sigma().powi(2),
                };
            }
        }

        // global passage matrix: identity block per plain set, eigenvector
        // block per decomposed set
        let mut passage = DMatrix::zeros(n, n);
        for (row, &(row_set, row_index)) in coordinates.iter().enumerate() {
            for (col, &(col_set, col_index)) in coordinates.iter().enumerate() {
                if row_set != col_set {
                    continue;
                }
                let set = &propagator.parameter_sets()[row_set];
                passage[(row, col)] = match (row_index, col_index) {
                    (FitIndex::Original(row_par), FitIndex::Original(col_par)) => {
                        f64::from(u8::from(row_par == col_par))
                    }
                    (FitIndex::Original(row_par), FitIndex::Eigen(coeff)) => {
                        set.eigen_vectors()[(row_par, coeff)]
                    }
                    _ => 0.0,
                };
            }
        }
        let original = &passage * &full * passage.transpose();

        let decomposition = original.clone().symmetric_eigen();
        let mut eigenvalues: Vec<f64> = decomposition.eigenvalues.iter().copied().collect();
        eigenvalues.sort_by(|a, b| b.total_cmp(a));
        let eigenvalues = DVector::from_vec(eigenvalues);

        let largest = eigenvalues[0];
        let smallest = eigenvalues[eigenvalues.len() - 1];
        let condition = smallest / largest;
        info!("post-fit covariance condition number: {condition:e}");

        let mut warnings = Vec::new();
        if smallest <= 0.0 {
            warn!("post-fit covariance is indefinite: smallest eigenvalue {smallest:e}");
            warnings.push(CovarianceWarning::Indefinite {
                eigenvalue: smallest,
            });
        } else if condition < 1e-12 {
            warn!("post-fit covariance is ill-conditioned: {condition:e}");
            warnings.push(CovarianceWarning::IllConditioned { condition });
        }

        Ok(PostFitCovariance {
            fit_space: fit_space.clone(),
            original,
            labels,
            eigenvalues,
            condition,
            warnings,
        })
    }

    /// Returns the recorded convergence failure as an error, for callers
    /// that treat a failed fit as fatal.
    ///
    /// # Errors
    ///
    /// Returns [`MinimizerError::DidNotConverge`] with the preserved status
    /// when the last minimization fell short of the EDM target.
    pub fn require_converged(&self) -> Result<(), Error> {
        let minimum = self.minimum.as_ref().ok_or(MinimizerError::InvalidState {
            state: self.state,
            expected: MinimizerState::Converged,
        })?;

        if minimum.status == MinimizerStatus::Success {
            Ok(())
        } else {
            Err(MinimizerError::DidNotConverge {
                status: minimum.status,
            }
            .into())
        }
    }

    /// Tears the driver down.
    pub fn finish(&mut self) {
        self.state = MinimizerState::Finished;
    }

    fn expect_state(&self, expected: MinimizerState) -> Result<(), Error> {
        if self.state == expected {
            Ok(())
        } else {
            Err(MinimizerError::InvalidState {
                state: self.state,
                expected,
            }
            .into())
        }
    }
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

    fn event(entry: u64) -> Event {
        Event::new(
            0,
            entry,
            1.0,
            VariableStore::new(vec!["enu".to_owned()].into(), vec![Variable::Float(0.5)]),
        )
    }

    fn fixture(parameters: Vec<Parameter>, covariance: DMatrix<f64>) -> (Propagator, Runtime) {
        let mut sample = Sample::new("nue", 0, BinSet::parse("enu:[0.0,1.0)\n").unwrap(), None);
        sample
            .load_events((0..100).map(event).collect())
            .unwrap();

        let mut set = ParameterSet::new("xsec", parameters);
        set.set_covariance(covariance).unwrap();
        set.initialize().unwrap();

        let mut propagator = Propagator::new(vec![sample], vec![set]);
        let runtime = Runtime::new(2).unwrap();
        propagator.build_cache(&runtime).unwrap();
        (propagator, runtime)
    }

    #[test]
    fn asimov_fit_returns_to_the_prior() {
        let norm = Parameter::new("norm", 1.0, 0.1)
            .with_dial_set(DialSet::new(vec![Dial::new("norm", NormDial.into())]));
        let (mut propagator, runtime) = fixture(vec![norm], DMatrix::from_row_slice(1, 1, &[0.01]));
        let mut likelihood = LikelihoodInterface::new(PoissonLlh.into());
        let mut rng = Pcg64::seed_from_u64(3);

        likelihood
            .load_data(DataPreset::Asimov, &mut propagator, &runtime, &mut rng)
            .unwrap();

        // start away from the prior
        propagator.parameter_sets_mut()[0].parameters_mut()[0].set_value(1.08);

        let mut driver = MinimizerDriver::new(MinimizerConfig::default());
        driver.configure(&propagator).unwrap();
        let minimum = driver
            .minimize(&mut likelihood, &mut propagator, &runtime)
            .unwrap();

        assert_eq!(minimum.status, MinimizerStatus::Success);
        assert_eq!(driver.state(), MinimizerState::Converged);
        driver.require_converged().unwrap();
        assert_approx_eq!(
            f64,
            propagator.parameter_sets()[0].parameters()[0].value(),
            1.0,
            epsilon = 1e-4
        );
    }

    #[test]
    fn hesse_recovers_the_prior_variance_of_a_flat_direction() {
        // a parameter with no dial: the likelihood only sees the penalty,
        // so the post-fit variance equals the prior variance
        let lonely = Parameter::new("pull", 0.0, 0.5);
        let (mut propagator, runtime) =
            fixture(vec![lonely], DMatrix::from_row_slice(1, 1, &[0.25]));
        let mut likelihood = LikelihoodInterface::new(PoissonLlh.into());
        let mut rng = Pcg64::seed_from_u64(3);

        likelihood
            .load_data(DataPreset::Asimov, &mut propagator, &runtime, &mut rng)
            .unwrap();

        let mut driver = MinimizerDriver::new(MinimizerConfig::default());
        driver.configure(&propagator).unwrap();
        driver
            .minimize(&mut likelihood, &mut propagator, &runtime)
            .unwrap();
        let covariance = driver
            .evaluate_errors(&mut likelihood, &mut propagator, &runtime)
            .unwrap();

        assert_eq!(driver.state(), MinimizerState::ErrorsEvaluated);
        assert_approx_eq!(f64, covariance.original[(0, 0)], 0.25, epsilon = 1e-4);
        assert!(covariance.eigenvalues.iter().all(|&value| value > 0.0));
        assert!(covariance.warnings.is_empty());
    }

    #[test]
    fn simplex_pre_pass_still_converges() {
        let norm = Parameter::new("norm", 1.0, 0.1)
            .with_dial_set(DialSet::new(vec![Dial::new("norm", NormDial.into())]));
        let (mut propagator, runtime) = fixture(vec![norm], DMatrix::from_row_slice(1, 1, &[0.01]));
        let mut likelihood = LikelihoodInterface::new(PoissonLlh.into());
        let mut rng = Pcg64::seed_from_u64(3);

        likelihood
            .load_data(DataPreset::Asimov, &mut propagator, &runtime, &mut rng)
            .unwrap();
        propagator.parameter_sets_mut()[0].parameters_mut()[0].set_value(0.9);

        let config = MinimizerConfig {
            enable_simplex_before_minimize: true,
            ..Default::default()
        };
        let mut driver = MinimizerDriver::new(config);
        driver.configure(&propagator).unwrap();
        let minimum = driver
            .minimize(&mut likelihood, &mut propagator, &runtime)
            .unwrap();

        assert_eq!(minimum.status, MinimizerStatus::Success);
        assert_approx_eq!(
            f64,
            propagator.parameter_sets()[0].parameters()[0].value(),
            1.0,
            epsilon = 1e-4
        );
    }

    #[test]
    fn state_machine_rejects_out_of_order_calls() {
        let mut driver = MinimizerDriver::new(MinimizerConfig::default());
        let norm = Parameter::new("norm", 1.0, 0.1)
            .with_dial_set(DialSet::new(vec![Dial::new("norm", NormDial.into())]));
        let (mut propagator, runtime) = fixture(vec![norm], DMatrix::from_row_slice(1, 1, &[0.01]));
        let mut likelihood = LikelihoodInterface::new(PoissonLlh.into());

        // minimize before configure
        let result = driver.minimize(&mut likelihood, &mut propagator, &runtime);
        assert!(matches!(
            result,
            Err(Error::Minimizer(MinimizerError::InvalidState { .. }))
        ));

        // errors before minimize
        driver.configure(&propagator).unwrap();
        let result = driver.evaluate_errors(&mut likelihood, &mut propagator, &runtime);
        assert!(matches!(
            result,
            Err(Error::Minimizer(MinimizerError::InvalidState { .. }))
        ));
    }

    #[test]
    fn eigen_degrees_of_freedom_are_exposed() {
        let parameters = vec![
            Parameter::new("a", 0.0, 1.0),
            Parameter::new("b", 0.0, 1.0),
        ];
        let mut set = ParameterSet::new("osc", parameters);
        set.set_covariance(DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.5, 1.0]))
            .unwrap();
        set.use_eigen_decomposition(None);
        set.initialize().unwrap();

        let mut sample = Sample::new("nue", 0, BinSet::parse("enu:[0.0,1.0)\n").unwrap(), None);
        sample.load_events(vec![event(0)]).unwrap();
        let propagator = Propagator::new(vec![sample], vec![set]);

        let mut driver = MinimizerDriver::new(MinimizerConfig::default());
        driver.configure(&propagator).unwrap();

        assert_eq!(driver.handles.len(), 2);
        assert!(driver
            .handles
            .iter()
            .all(|handle| matches!(handle.index, FitIndex::Eigen(_))));
    }
}
