//! Error taxonomy of the fitter.
//!
//! Every error carries the identifiers of the offending entity (parameter
//! set, parameter, sample, bin, event entry), so that a failure can be
//! reproduced from the log alone.

use thiserror::Error;

/// Configuration errors, raised before anything is loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required configuration key is absent.
    #[error("missing configuration key: '{key}'")]
    MissingKey {
        /// Dotted path of the missing key.
        key: String,
    },
    /// A configuration key holds a value the engine cannot use.
    #[error("invalid value for '{key}': {reason}")]
    InvalidValue {
        /// Dotted path of the key.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
    /// The configuration requires a newer engine.
    #[error("config requires engine >= {required}, this engine is {current}")]
    UnsupportedEngineVersion {
        /// Version demanded by `minEngineVersion`.
        required: String,
        /// Version of the running engine.
        current: String,
    },
    /// The configuration could not be parsed at all.
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Errors raised while loading inputs (binning files, covariances, events).
#[derive(Debug, Error)]
pub enum LoadError {
    /// An input could not be read.
    #[error("could not read input: {0}")]
    Io(#[from] std::io::Error),
    /// A binning definition failed validation.
    #[error("malformed binning: {0}")]
    MalformedBinning(#[from] crate::bin::MalformedBinning),
    /// A selection cut or apply-condition did not parse or evaluate.
    #[error("formula error: {0}")]
    Formula(#[from] crate::formula::FormulaError),
    /// A dial definition failed validation.
    #[error("invalid dial: {0}")]
    Dial(#[from] crate::dial::DialError),
    /// A propagation was requested before the dial cache was built.
    #[error("the dial cache has not been built")]
    CacheNotBuilt,
    /// The prior covariance of a parameter set is not symmetric.
    #[error("covariance of parameter set '{set}' is not symmetric: |C - C^T| = {deviation:e} exceeds {tolerance:e}")]
    AsymmetricCovariance {
        /// Name of the parameter set.
        set: String,
        /// Largest absolute asymmetry found.
        deviation: f64,
        /// Allowed asymmetry, `1e-9 * |C|`.
        tolerance: f64,
    },
    /// The prior covariance is not positive semi-definite even after jitter.
    #[error("covariance of parameter set '{set}' is not positive semi-definite: smallest eigenvalue {eigenvalue:e}")]
    NotPositiveSemiDefinite {
        /// Name of the parameter set.
        set: String,
        /// The offending eigenvalue.
        eigenvalue: f64,
    },
    /// A named covariance input does not cover one of the parameters.
    #[error("covariance input for parameter set '{set}' has no entry for parameter '{name}'")]
    MissingCovarianceEntry {
        /// Name of the parameter set.
        set: String,
        /// The uncovered parameter.
        name: String,
    },
    /// The covariance dimension does not match the parameter count.
    #[error("covariance of parameter set '{set}' is {rows}x{cols}, but the set has {parameters} parameters")]
    CovarianceShape {
        /// Name of the parameter set.
        set: String,
        /// Rows found.
        rows: usize,
        /// Columns found.
        cols: usize,
        /// Number of parameters in the set.
        parameters: usize,
    },
    /// An event referenced a variable that its store does not carry.
    #[error("event entry {entry} has no variable '{name}'")]
    UnknownVariable {
        /// Source entry id of the event.
        entry: u64,
        /// The missing variable name.
        name: String,
    },
}

/// Numerical errors surfaced by the propagation and likelihood machinery.
///
/// These are never recovered internally; the Propagator and the likelihood
/// interface surface them to the caller.
#[derive(Debug, Error)]
pub enum MathError {
    /// A strict dial produced a response below its floor.
    #[error("negative dial response: {dial} evaluated at {x} gave {response} (floor {floor}) for parameter '{parameter}'")]
    NegativeResponse {
        /// Identity of the dial.
        dial: String,
        /// Full name of the parameter driving the dial.
        parameter: String,
        /// The parameter value the dial was evaluated at.
        x: f64,
        /// The offending response.
        response: f64,
        /// The configured response floor.
        floor: f64,
    },
    /// A dial produced a non-finite response during a reweight pass.
    #[error("non-finite response {response} for event entry {entry} of sample '{sample}', parameter '{parameter}' at value {x}")]
    InvalidResponse {
        /// Source entry id of the event.
        entry: u64,
        /// Name of the sample owning the event.
        sample: String,
        /// Full name of the parameter.
        parameter: String,
        /// The parameter value.
        x: f64,
        /// The offending response.
        response: f64,
    },
    /// A likelihood evaluation was requested before data was loaded.
    #[error("sample '{sample}' has no data histogram loaded")]
    MissingData {
        /// Name of the sample.
        sample: String,
    },
    /// A statistical kernel hit an impossible bin configuration.
    #[error("invalid likelihood in sample '{sample}' bin {bin}: prediction {mc}, data {data}")]
    InvalidLikelihood {
        /// Name of the sample.
        sample: String,
        /// Index of the bin.
        bin: usize,
        /// Model prediction in the bin.
        mc: f64,
        /// Observed count in the bin.
        data: f64,
    },
    /// The total likelihood came out non-finite.
    #[error("non-finite total likelihood: stat = {stat}, penalty = {penalty}")]
    NonFiniteLikelihood {
        /// Statistical component.
        stat: f64,
        /// Penalty component.
        penalty: f64,
    },
}

/// Errors reported by the minimizer driver.
#[derive(Debug, Error)]
pub enum MinimizerError {
    /// The minimization did not reach the EDM target.
    #[error("minimizer did not converge: {status}")]
    DidNotConverge {
        /// Status of the underlying algorithm, translated.
        status: crate::minimizer::MinimizerStatus,
    },
    /// The error evaluation (Hesse) failed.
    #[error("Hesse failed: {reason}")]
    HesseFailed {
        /// Why the covariance could not be extracted.
        reason: String,
    },
    /// The fit function returned a non-finite value and `throwOnBadLlh` is set.
    #[error("likelihood evaluation returned {value} at minimizer call {call}")]
    BadLikelihood {
        /// The offending value.
        value: f64,
        /// Index of the likelihood call.
        call: usize,
    },
    /// A driver operation was requested in the wrong state.
    #[error("minimizer is in state {state:?}, expected {expected:?}")]
    InvalidState {
        /// Current state of the driver.
        state: crate::minimizer::MinimizerState,
        /// State the operation requires.
        expected: crate::minimizer::MinimizerState,
    },
}

/// Post-fit covariance diagnostics.
///
/// These are warnings: results are persisted best-effort. Strict mode
/// promotes them to hard errors.
#[derive(Clone, Copy, Debug, Error)]
pub enum CovarianceWarning {
    /// The post-fit covariance has at least one non-positive eigenvalue.
    #[error("post-fit covariance is indefinite: smallest eigenvalue {eigenvalue:e}")]
    Indefinite {
        /// The smallest eigenvalue of the decomposition.
        eigenvalue: f64,
    },
    /// The post-fit covariance is numerically ill-conditioned.
    #[error("post-fit covariance is ill-conditioned: lambda_min/lambda_max = {condition:e}")]
    IllConditioned {
        /// Condition number `lambda_min / lambda_max`.
        condition: f64,
    },
}

/// Catch-all error for this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration or validation failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Input loading failure.
    #[error(transparent)]
    Load(#[from] LoadError),
    /// Numerical failure in propagation or likelihood evaluation.
    #[error(transparent)]
    Math(#[from] MathError),
    /// Failure reported by the minimizer driver.
    #[error(transparent)]
    Minimizer(#[from] MinimizerError),
    /// Covariance warning promoted to an error by strict mode.
    #[error(transparent)]
    Covariance(#[from] CovarianceWarning),
    /// Error that does not originate from this crate.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Process exit code for this error.
    ///
    /// `0` is success, `1` a config/validation failure, `2` a load failure,
    /// `3` a fit that did not converge and `4` an indefinite post-fit
    /// covariance under strict mode.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Math(_) | Self::Other(_) => 1,
            Self::Load(_) => 2,
            Self::Minimizer(_) => 3,
            Self::Covariance(_) => 4,
        }
    }
}

/// Catch-all result for this crate.
pub type Result<T> = std::result::Result<T, Error>;
