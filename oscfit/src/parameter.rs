//! Module containing [`Parameter`] and [`ParameterSet`].
//!
//! A parameter set is a correlated block of scalar parameters sharing one
//! prior covariance. Degenerate covariances (or an explicit request) switch
//! the set to an eigen reparameterization with a diagonal prior.

use crate::dial::DialSet;
use crate::error::{Error, LoadError};
use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;
use std::fmt::{self, Display, Formatter};

/// Relative tolerance of the covariance symmetry check.
const SYMMETRY_TOLERANCE: f64 = 1e-9;
/// Relative size of the diagonal jitter applied before the PSD check.
const PSD_JITTER: f64 = 1e-12;
/// Retry budget of a bounded parameter throw before clamping.
const THROW_RETRIES: usize = 100;

/// A scalar fit parameter.
#[derive(Clone, Debug)]
pub struct Parameter {
    name: String,
    value: f64,
    prior: f64,
    sigma: f64,
    min: Option<f64>,
    max: Option<f64>,
    step: f64,
    enabled: bool,
    fixed: bool,
    free: bool,
    dial_sets: Vec<DialSet>,
}

impl Parameter {
    /// Constructor. The parameter starts at its prior with a step size of
    /// `sigma / 10`.
    ///
    /// # Panics
    ///
    /// Panics if `sigma` is not strictly positive.
    #[must_use]
    pub fn new(name: &str, prior: f64, sigma: f64) -> Self {
        assert!(sigma > 0.0);

        Self {
            name: name.to_owned(),
            value: prior,
            prior,
            sigma,
            min: None,
            max: None,
            step: sigma / 10.0,
            enabled: true,
            fixed: false,
            free: false,
            dial_sets: Vec::new(),
        }
    }

    /// Boxes the parameter into `[min, max]`.
    #[must_use]
    pub const fn with_bounds(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Overrides the minimizer step size.
    #[must_use]
    pub const fn with_step(mut self, step: f64) -> Self {
        self.step = step;
        self
    }

    /// Marks the parameter as free: no prior constraint, excluded from the
    /// penalty.
    #[must_use]
    pub const fn free(mut self) -> Self {
        self.free = true;
        self
    }

    /// Attaches a dial set.
    #[must_use]
    pub fn with_dial_set(mut self, dial_set: DialSet) -> Self {
        self.dial_sets.push(dial_set);
        self
    }

    /// Name of the parameter.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value.
    #[must_use]
    pub const fn value(&self) -> f64 {
        self.value
    }

    /// Sets the current value.
    pub fn set_value(&mut self, value: f64) {
        self.value = value;
    }

    /// Prior value.
    #[must_use]
    pub const fn prior(&self) -> f64 {
        self.prior
    }

    /// Prior sigma.
    #[must_use]
    pub const fn sigma(&self) -> f64 {
        self.sigma
    }

    /// Lower bound, if any.
    #[must_use]
    pub const fn min(&self) -> Option<f64> {
        self.min
    }

    /// Upper bound, if any.
    #[must_use]
    pub const fn max(&self) -> Option<f64> {
        self.max
    }

    /// Minimizer step size.
    #[must_use]
    pub const fn step(&self) -> f64 {
        self.step
    }

    /// Whether the parameter participates in the fit at all.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enables or disables the parameter.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Whether the parameter is excluded from the minimizer's degrees of
    /// freedom.
    #[must_use]
    pub const fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// Fixes or releases the parameter.
    pub fn set_fixed(&mut self, fixed: bool) {
        self.fixed = fixed;
    }

    /// Whether the parameter has no prior constraint.
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.free
    }

    /// The dial sets attached to this parameter.
    #[must_use]
    pub fn dial_sets(&self) -> &[DialSet] {
        &self.dial_sets
    }

    /// Affine map into the normalized fit space, `(value - prior) / sigma`.
    #[must_use]
    pub fn normalize(&self, value: f64) -> f64 {
        (value - self.prior) / self.sigma
    }

    /// Inverse of [`Parameter::normalize`].
    #[must_use]
    pub fn denormalize(&self, normalized: f64) -> f64 {
        normalized.mul_add(self.sigma, self.prior)
    }
}

/// Eigen reparameterization of a parameter set.
///
/// The covariance is diagonal in this basis; conversions to and from the
/// original basis are the pure linear maps `x = prior + V e` and
/// `e = V^T (x - prior)`.
#[derive(Clone, Debug)]
struct EigenBasis {
    /// Eigenvectors as columns.
    vectors: DMatrix<f64>,
    /// Eigenvalues, i.e. the prior variances of the coefficients.
    values: DVector<f64>,
    /// Current eigen coefficients.
    coefficients: DVector<f64>,
    /// Components frozen by the eigen-fraction cut.
    fixed: Vec<bool>,
}

/// Outcome of [`ParameterSet::throw_parameters`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThrowOutcome {
    /// Number of rejected draws before the accepted one.
    pub retries: usize,
    /// Whether the final draw had to be clamped into the parameter boxes.
    pub clamped: bool,
}

/// An ordered list of parameters plus their shared prior covariance.
#[derive(Clone, Debug)]
pub struct ParameterSet {
    name: String,
    parameters: Vec<Parameter>,
    covariance: Option<DMatrix<f64>>,
    /// Pseudo-inverse of the covariance restricted to the penalized block.
    penalty_inverse: Option<(Vec<usize>, DMatrix<f64>)>,
    /// `V sqrt(Lambda)` factor used by the multivariate throws.
    throw_factor: Option<DMatrix<f64>>,
    eigen: Option<EigenBasis>,
    use_eigen: bool,
    max_eigen_fraction: Option<f64>,
    enabled: bool,
    masked_for_toys: bool,
    initialized: bool,
}

impl ParameterSet {
    /// Constructor.
    #[must_use]
    pub fn new(name: &str, parameters: Vec<Parameter>) -> Self {
        Self {
            name: name.to_owned(),
            parameters,
            covariance: None,
            penalty_inverse: None,
            throw_factor: None,
            eigen: None,
            use_eigen: false,
            max_eigen_fraction: None,
            enabled: true,
            masked_for_toys: false,
            initialized: false,
        }
    }

    /// Attaches the prior covariance. Must be called before
    /// [`ParameterSet::initialize`].
    ///
    /// # Errors
    ///
    /// Returns a [`LoadError`] when the matrix dimension does not match the
    /// parameter count or the matrix is not symmetric within
    /// `1e-9 * |C|`.
    pub fn set_covariance(&mut self, covariance: DMatrix<f64>) -> Result<(), LoadError> {
        let n = self.parameters.len();
        if covariance.nrows() != n || covariance.ncols() != n {
            return Err(LoadError::CovarianceShape {
                set: self.name.clone(),
                rows: covariance.nrows(),
                cols: covariance.ncols(),
                parameters: n,
            });
        }

        let deviation = (&covariance - covariance.transpose()).amax();
        let tolerance = SYMMETRY_TOLERANCE * covariance.norm();
        if deviation > tolerance {
            return Err(LoadError::AsymmetricCovariance {
                set: self.name.clone(),
                deviation,
                tolerance,
            });
        }

        self.covariance = Some(covariance);
        Ok(())
    }

    /// Attaches a covariance whose rows are keyed by parameter name rather
    /// than ordered like the set. The matrix is permuted into parameter
    /// order before the usual validation.
    ///
    /// # Errors
    ///
    /// Returns a [`LoadError`] when a parameter has no entry in `names`,
    /// or when the permuted matrix fails [`ParameterSet::set_covariance`].
    pub fn set_covariance_named(
        &mut self,
        covariance: &DMatrix<f64>,
        names: &[String],
    ) -> Result<(), LoadError> {
        let permutation = self
            .parameters
            .iter()
            .map(|parameter| {
                names
                    .iter()
                    .position(|name| name == parameter.name())
                    .ok_or_else(|| LoadError::MissingCovarianceEntry {
                        set: self.name.clone(),
                        name: parameter.name().to_owned(),
                    })
            })
            .collect::<Result<Vec<usize>, LoadError>>()?;

        let permuted = DMatrix::from_fn(permutation.len(), permutation.len(), |row, col| {
            covariance[(permutation[row], permutation[col])]
        });
        self.set_covariance(permuted)
    }

    /// Requests the eigen reparameterization, keeping components until their
    /// cumulative eigenvalue fraction reaches `max_fraction` (all of them
    /// when `None`).
    pub fn use_eigen_decomposition(&mut self, max_fraction: Option<f64>) {
        self.use_eigen = true;
        self.max_eigen_fraction = max_fraction;
    }

    /// Masks this set from toy-generation throws.
    pub fn set_masked_for_toys(&mut self, masked: bool) {
        self.masked_for_toys = masked;
    }

    /// Whether this set is masked from toy-generation throws.
    #[must_use]
    pub const fn is_masked_for_toys(&self) -> bool {
        self.masked_for_toys
    }

    /// Whether [`ParameterSet::initialize`] already ran.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Whether this set participates in the fit.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enables or disables the whole set.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Validates the covariance (PSD after jitter `1e-12 * tr`), prepares
    /// the penalty pseudo-inverse and throw factor, and decomposes the
    /// eigen basis when requested.
    ///
    /// # Errors
    ///
    /// Returns a [`LoadError`] when the covariance is not positive
    /// semi-definite, or a config error when eigen decomposition is
    /// requested with individually fixed parameters.
    pub fn initialize(&mut self) -> Result<(), Error> {
        if let Some(covariance) = self.covariance.clone() {
            let n = covariance.nrows();
            let jitter = PSD_JITTER * covariance.trace();
            let jittered = &covariance + DMatrix::identity(n, n) * jitter;

            let decomposition = jittered.clone().symmetric_eigen();
            let smallest = decomposition.eigenvalues.min();
            if smallest < -jitter.max(f64::EPSILON) {
                return Err(LoadError::NotPositiveSemiDefinite {
                    set: self.name.clone(),
                    eigenvalue: smallest,
                }
                .into());
            }

            // V sqrt(max(lambda, 0)) reproduces C for semi-definite inputs
            // where a plain Cholesky would fail
            let mut factor = decomposition.eigenvectors.clone();
            for (mut column, &value) in
                factor.column_iter_mut().zip(decomposition.eigenvalues.iter())
            {
                column *= value.max(0.0).sqrt();
            }
            self.throw_factor = Some(factor);

            self.rebuild_penalty_inverse();

            if self.use_eigen {
                if self.parameters.iter().any(Parameter::is_fixed) {
                    return Err(Error::Config(crate::error::ConfigError::InvalidValue {
                        key: format!("parameterSets/{}/useEigenDecomposition", self.name),
                        reason: "eigen decomposition cannot be combined with individually fixed parameters".to_owned(),
                    }));
                }
                self.decompose(&decomposition.eigenvectors, &decomposition.eigenvalues);
            }
        } else if self.use_eigen {
            return Err(Error::Config(crate::error::ConfigError::InvalidValue {
                key: format!("parameterSets/{}/useEigenDecomposition", self.name),
                reason: "eigen decomposition requires a prior covariance".to_owned(),
            }));
        }

        self.check_dial_domains();
        self.initialized = true;
        info!("{self}");
        Ok(())
    }

    fn decompose(&mut self, vectors: &DMatrix<f64>, values: &DVector<f64>) {
        let total: f64 = values.iter().sum();
        let mut kept = values.len();
        if let Some(fraction) = self.max_eigen_fraction {
            // eigenvalues come out unsorted; rank them descending and keep
            // the leading components up to the requested fraction
            let mut order: Vec<usize> = (0..values.len()).collect();
            order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));
            let mut cumulative = 0.0;
            kept = 0;
            let mut fixed = vec![true; values.len()];
            for &index in &order {
                if cumulative >= fraction * total {
                    break;
                }
                cumulative += values[index];
                fixed[index] = false;
                kept += 1;
            }
            self.eigen = Some(EigenBasis {
                vectors: vectors.clone(),
                values: values.clone(),
                coefficients: DVector::zeros(values.len()),
                fixed,
            });
        } else {
            self.eigen = Some(EigenBasis {
                vectors: vectors.clone(),
                values: values.clone(),
                coefficients: DVector::zeros(values.len()),
                fixed: vec![false; values.len()],
            });
        }

        info!(
            "parameter set '{}': eigen basis with {kept}/{} floating components",
            self.name,
            values.len()
        );
        self.propagate_original_to_eigen();
    }

    fn rebuild_penalty_inverse(&mut self) {
        let Some(covariance) = &self.covariance else {
            self.penalty_inverse = None;
            return;
        };

        let indices: Vec<usize> = self
            .parameters
            .iter()
            .enumerate()
            .filter(|(_, par)| par.is_enabled() && !par.is_fixed() && !par.is_free())
            .map(|(index, _)| index)
            .collect();

        let block = DMatrix::from_fn(indices.len(), indices.len(), |row, col| {
            covariance[(indices[row], indices[col])]
        });

        match block.pseudo_inverse(f64::EPSILON * covariance.norm()) {
            Ok(inverse) => self.penalty_inverse = Some((indices, inverse)),
            Err(reason) => {
                warn!(
                    "parameter set '{}': penalty pseudo-inverse failed ({reason}); penalty disabled",
                    self.name
                );
                self.penalty_inverse = None;
            }
        }
    }

    fn check_dial_domains(&self) {
        for par in &self.parameters {
            for dial_set in par.dial_sets() {
                for dial in dial_set.dials() {
                    if let Some((min, max)) = crate::dial::DialResponse::domain(dial.response()) {
                        if par.prior() < min || par.prior() > max {
                            warn!(
                                "prior of '{}/{}' = {} is outside the range [{min}, {max}] of dial {dial}",
                                self.name,
                                par.name(),
                                par.prior()
                            );
                        }
                    }
                }
            }
        }
    }

    /// Name of the set.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The parameters in order.
    #[must_use]
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Mutable access to the parameters.
    pub fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.parameters
    }

    /// Full identifier of parameter `index`, `"set/parameter"`.
    #[must_use]
    pub fn full_name(&self, index: usize) -> String {
        format!("{}/{}", self.name, self.parameters[index].name())
    }

    /// The prior covariance, if one was attached.
    #[must_use]
    pub const fn covariance(&self) -> Option<&DMatrix<f64>> {
        self.covariance.as_ref()
    }

    /// Whether the set is in its eigen reparameterization.
    #[must_use]
    pub const fn is_eigen_decomposed(&self) -> bool {
        self.eigen.is_some()
    }

    /// Number of eigen coefficients (equals the parameter count).
    #[must_use]
    pub fn eigen_len(&self) -> usize {
        self.eigen.as_ref().map_or(0, |eigen| eigen.values.len())
    }

    /// Current value of eigen coefficient `index`.
    ///
    /// # Panics
    ///
    /// Panics if the set is not eigen-decomposed.
    #[must_use]
    pub fn eigen_coefficient(&self, index: usize) -> f64 {
        self.eigen.as_ref().unwrap().coefficients[index]
    }

    /// Prior sigma of eigen coefficient `index`, `sqrt(lambda)`.
    ///
    /// # Panics
    ///
    /// Panics if the set is not eigen-decomposed.
    #[must_use]
    pub fn eigen_sigma(&self, index: usize) -> f64 {
        self.eigen.as_ref().unwrap().values[index].max(0.0).sqrt()
    }

    /// Whether eigen coefficient `index` is frozen by the eigen-fraction
    /// cut.
    ///
    /// # Panics
    ///
    /// Panics if the set is not eigen-decomposed.
    #[must_use]
    pub fn eigen_fixed(&self, index: usize) -> bool {
        self.eigen.as_ref().unwrap().fixed[index]
    }

    /// Writes eigen coefficient `index`. The original-basis view must be
    /// re-synchronized with [`ParameterSet::propagate_eigen_to_original`]
    /// before the next reweight.
    ///
    /// # Panics
    ///
    /// Panics if the set is not eigen-decomposed.
    pub fn set_eigen_coefficient(&mut self, index: usize, value: f64) {
        self.eigen.as_mut().unwrap().coefficients[index] = value;
    }

    /// Eigenvectors of the prior covariance, columns in coefficient order.
    ///
    /// # Panics
    ///
    /// Panics if the set is not eigen-decomposed.
    #[must_use]
    pub fn eigen_vectors(&self) -> &DMatrix<f64> {
        &self.eigen.as_ref().unwrap().vectors
    }

    /// Recomputes the original-basis values from the eigen coefficients,
    /// `x = prior + V e`.
    pub fn propagate_eigen_to_original(&mut self) {
        let Some(eigen) = &self.eigen else { return };

        let shift = &eigen.vectors * &eigen.coefficients;
        for (index, parameter) in self.parameters.iter_mut().enumerate() {
            parameter.set_value(parameter.prior() + shift[index]);
        }
    }

    /// Recomputes the eigen coefficients from the original-basis values,
    /// `e = V^T (x - prior)`.
    pub fn propagate_original_to_eigen(&mut self) {
        let Some(eigen) = &mut self.eigen else { return };

        let delta = DVector::from_iterator(
            self.parameters.len(),
            self.parameters.iter().map(|par| par.value() - par.prior()),
        );
        eigen.coefficients = eigen.vectors.transpose() * delta;
    }

    /// Sets every parameter to its prior (and zeroes the eigen
    /// coefficients).
    pub fn move_to_prior(&mut self) {
        for parameter in &mut self.parameters {
            let prior = parameter.prior();
            parameter.set_value(prior);
        }
        if let Some(eigen) = &mut self.eigen {
            eigen.coefficients.fill(0.0);
        }
    }

    /// Draws a multivariate-Gaussian throw around the priors using the
    /// decomposed covariance factor. Parameter boxes are respected via
    /// rejection with a bounded retry budget; an exhausted budget clamps
    /// and flags the draw. Fixed and disabled parameters stay at their
    /// prior.
    ///
    /// # Panics
    ///
    /// Panics if the set was not initialized with a covariance.
    pub fn throw_parameters<R: Rng>(&mut self, rng: &mut R) -> ThrowOutcome {
        let factor = self
            .throw_factor
            .as_ref()
            .expect("throw_parameters requires an initialized covariance");
        let n = self.parameters.len();

        let mut outcome = ThrowOutcome::default();
        let mut draw = vec![0.0; n];

        loop {
            let z = DVector::from_iterator(n, (0..n).map(|_| rng.sample::<f64, _>(StandardNormal)));
            let shift = factor * z;
            for (index, parameter) in self.parameters.iter().enumerate() {
                draw[index] = parameter.prior() + shift[index];
            }

            let in_bounds = self.parameters.iter().zip(&draw).all(|(par, &value)| {
                par.min().is_none_or(|min| value >= min) && par.max().is_none_or(|max| value <= max)
            });

            if in_bounds {
                break;
            }
            if outcome.retries == THROW_RETRIES {
                warn!(
                    "parameter set '{}': throw rejected {THROW_RETRIES} times, clamping into bounds",
                    self.name
                );
                for (parameter, value) in self.parameters.iter().zip(&mut draw) {
                    if let Some(min) = parameter.min() {
                        *value = value.max(min);
                    }
                    if let Some(max) = parameter.max() {
                        *value = value.min(max);
                    }
                }
                outcome.clamped = true;
                break;
            }
            outcome.retries += 1;
        }

        for (parameter, &value) in self.parameters.iter_mut().zip(&draw) {
            if parameter.is_fixed() || !parameter.is_enabled() {
                let prior = parameter.prior();
                parameter.set_value(prior);
            } else {
                parameter.set_value(value);
            }
        }
        self.propagate_original_to_eigen();

        outcome
    }

    /// Penalty term of this set.
    ///
    /// In the original basis this is `delta^T C^-1 delta` over the
    /// penalized block; in the eigen basis it is the diagonal sum
    /// `sum_i (e_i - mu_i)^2 / lambda_i` over the floating coefficients.
    /// Free, fixed and disabled parameters contribute zero.
    #[must_use]
    pub fn penalty(&self) -> f64 {
        if !self.enabled {
            return 0.0;
        }

        if let Some(eigen) = &self.eigen {
            // null directions of a degenerate covariance carry no prior
            return eigen
                .coefficients
                .iter()
                .zip(eigen.values.iter())
                .zip(&eigen.fixed)
                .filter(|((_, &lambda), &fixed)| !fixed && lambda > 0.0)
                .map(|((&e, &lambda), _)| e * e / lambda)
                .sum();
        }

        self.penalty_inverse
            .as_ref()
            .map_or(0.0, |(indices, inverse)| {
                let delta = DVector::from_iterator(
                    indices.len(),
                    indices
                        .iter()
                        .map(|&index| self.parameters[index].value() - self.parameters[index].prior()),
                );
                (inverse * &delta).dot(&delta)
            })
    }
}

impl Display for ParameterSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parameter set '{}': {} parameters ({} fixed, {} free{})",
            self.name,
            self.parameters.len(),
            self.parameters.iter().filter(|par| par.is_fixed()).count(),
            self.parameters.iter().filter(|par| par.is_free()).count(),
            if self.is_eigen_decomposed() {
                ", eigen basis"
            } else {
                ""
            }
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use float_cmp::assert_approx_eq;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    fn correlated_set() -> ParameterSet {
        let mut set = ParameterSet::new(
            "osc",
            vec![Parameter::new("a", 0.0, 1.0), Parameter::new("b", 0.0, 1.0)],
        );
        set.set_covariance(DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.5, 1.0]))
            .unwrap();
        set
    }

    #[test]
    fn penalty_is_zero_at_prior_and_positive_elsewhere() {
        let mut set = correlated_set();
        set.initialize().unwrap();

        assert_approx_eq!(f64, set.penalty(), 0.0);

        set.parameters_mut()[0].set_value(0.3);
        set.parameters_mut()[1].set_value(-0.2);
        assert!(set.penalty() > 0.0);

        set.move_to_prior();
        assert_approx_eq!(f64, set.penalty(), 0.0);
    }

    #[test]
    fn penalty_matches_the_quadratic_form() {
        let mut set = correlated_set();
        set.initialize().unwrap();

        set.parameters_mut()[0].set_value(0.3);
        set.parameters_mut()[1].set_value(-0.2);

        // delta^T C^-1 delta with C^-1 = [[4/3, -2/3], [-2/3, 4/3]]
        let expected = 4.0 / 3.0 * (0.09 + 0.04) + 2.0 * (-2.0 / 3.0) * 0.3 * (-0.2);
        assert_approx_eq!(f64, set.penalty(), expected, epsilon = 1e-12);
    }

    #[test]
    fn eigen_round_trip_preserves_values_and_penalty() {
        let mut plain = correlated_set();
        plain.initialize().unwrap();
        plain.parameters_mut()[0].set_value(0.3);
        plain.parameters_mut()[1].set_value(-0.2);
        let expected = plain.penalty();

        let mut set = correlated_set();
        set.use_eigen_decomposition(None);
        set.initialize().unwrap();
        set.parameters_mut()[0].set_value(0.3);
        set.parameters_mut()[1].set_value(-0.2);

        set.propagate_original_to_eigen();
        set.propagate_eigen_to_original();

        assert_approx_eq!(f64, set.parameters()[0].value(), 0.3, epsilon = 1e-10);
        assert_approx_eq!(f64, set.parameters()[1].value(), -0.2, epsilon = 1e-10);
        // the diagonal eigen penalty equals the original quadratic form
        assert_approx_eq!(f64, set.penalty(), expected, epsilon = 1e-10);
    }

    #[test]
    fn fixed_parameters_do_not_contribute_to_the_penalty() {
        let mut set = correlated_set();
        set.parameters_mut()[1].set_fixed(true);
        set.initialize().unwrap();

        set.parameters_mut()[0].set_value(1.0);
        set.parameters_mut()[1].set_value(5.0);

        // only the diagonal element of parameter 'a' remains
        assert_approx_eq!(f64, set.penalty(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn throws_respect_bounds_and_fixed_parameters() {
        let mut set = ParameterSet::new(
            "xsec",
            vec![
                Parameter::new("norm", 1.0, 0.3).with_bounds(0.0, 2.0),
                Parameter::new("shape", 0.0, 1.0),
            ],
        );
        set.parameters_mut()[1].set_fixed(true);
        set.set_covariance(DMatrix::from_row_slice(2, 2, &[0.09, 0.0, 0.0, 1.0]))
            .unwrap();
        set.initialize().unwrap();

        let mut rng = Pcg64::seed_from_u64(42);
        for _ in 0..200 {
            set.throw_parameters(&mut rng);
            let norm = set.parameters()[0].value();
            assert!((0.0..=2.0).contains(&norm));
            assert_approx_eq!(f64, set.parameters()[1].value(), 0.0);
        }
    }

    #[test]
    fn named_covariance_is_permuted_into_parameter_order() {
        let mut set = ParameterSet::new(
            "osc",
            vec![Parameter::new("a", 0.0, 1.0), Parameter::new("b", 0.0, 2.0)],
        );
        // rows keyed (b, a)
        let input = DMatrix::from_row_slice(2, 2, &[4.0, 0.5, 0.5, 1.0]);
        set.set_covariance_named(&input, &["b".to_owned(), "a".to_owned()])
            .unwrap();

        let covariance = set.covariance().unwrap();
        assert_approx_eq!(f64, covariance[(0, 0)], 1.0);
        assert_approx_eq!(f64, covariance[(1, 1)], 4.0);
        assert_approx_eq!(f64, covariance[(0, 1)], 0.5);

        let missing = set.set_covariance_named(&input, &["b".to_owned(), "c".to_owned()]);
        assert!(matches!(
            missing,
            Err(LoadError::MissingCovarianceEntry { .. })
        ));
    }

    #[test]
    fn asymmetric_covariance_is_rejected() {
        let mut set = ParameterSet::new(
            "bad",
            vec![Parameter::new("a", 0.0, 1.0), Parameter::new("b", 0.0, 1.0)],
        );
        let result = set.set_covariance(DMatrix::from_row_slice(2, 2, &[1.0, 0.5, -0.5, 1.0]));

        assert!(matches!(result, Err(LoadError::AsymmetricCovariance { .. })));
    }

    #[test]
    fn indefinite_covariance_is_rejected() {
        let mut set = ParameterSet::new(
            "bad",
            vec![Parameter::new("a", 0.0, 1.0), Parameter::new("b", 0.0, 1.0)],
        );
        set.set_covariance(DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]))
            .unwrap();

        assert!(matches!(
            set.initialize(),
            Err(Error::Load(LoadError::NotPositiveSemiDefinite { .. }))
        ));
    }

    #[test]
    fn normalized_space_round_trip() {
        let par = Parameter::new("a", 1.5, 0.25);

        assert_approx_eq!(f64, par.normalize(1.5), 0.0);
        assert_approx_eq!(f64, par.normalize(2.0), 2.0);
        assert_approx_eq!(f64, par.denormalize(par.normalize(1.83)), 1.83, epsilon = 1e-12);
    }

    #[test]
    fn eigen_fraction_freezes_trailing_components() {
        let mut set = correlated_set();
        // eigenvalues are 1.5 and 0.5; 60% keeps only the leading component
        set.use_eigen_decomposition(Some(0.6));
        set.initialize().unwrap();

        let frozen: Vec<bool> = (0..set.eigen_len()).map(|i| set.eigen_fixed(i)).collect();
        assert_eq!(frozen.iter().filter(|&&fixed| fixed).count(), 1);

        // the frozen component has the smaller eigenvalue
        let frozen_index = frozen.iter().position(|&fixed| fixed).unwrap();
        assert_approx_eq!(f64, set.eigen_sigma(frozen_index), 0.5_f64.sqrt(), epsilon = 1e-9);
    }
}
