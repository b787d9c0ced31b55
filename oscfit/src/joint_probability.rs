//! Module containing the statistical likelihood kernels.
//!
//! Kernels are pure functions of the current MC histogram, the data
//! histogram and the per-bin MC statistical variance; they share no state.
//! All of them follow the `-2 ln L` convention, so a perfect prediction
//! scores zero for the kernels that vanish at `mu = n`.

use crate::error::MathError;
use crate::sample::Sample;
use enum_dispatch::enum_dispatch;

/// Trait each statistical kernel must implement.
#[enum_dispatch]
pub trait JointProbability {
    /// Contribution of one bin given the prediction `mc`, the observation
    /// `data` and the MC statistical variance `mc_var`.
    ///
    /// # Errors
    ///
    /// Returns [`MathError::InvalidLikelihood`] for impossible bin
    /// configurations (e.g. a vanishing prediction against observed
    /// events).
    fn eval_bin(
        &self,
        mc: f64,
        data: f64,
        mc_var: f64,
        sample: &str,
        bin: usize,
    ) -> Result<f64, MathError>;
}

/// Enum which lists all statistical kernels.
#[enum_dispatch(JointProbability)]
#[derive(Clone, Debug)]
pub enum JointProbabilityEnum {
    /// Binned Poisson likelihood.
    PoissonLlh,
    /// Approximate Neyman chi-square.
    Chi2,
    /// Plain least squares, for debugging.
    LeastSquares,
    /// Barlow-Beeston likelihood with per-bin MC statistical nuisances.
    BarlowLlh,
    /// Barlow-Beeston in the BANFF OA2020 convention.
    BarlowLlhBanff2020,
    /// Barlow-Beeston in the BANFF OA2021 convention.
    BarlowLlhBanff2021,
}

impl JointProbabilityEnum {
    /// Sums the kernel over the bins of `sample`.
    ///
    /// # Errors
    ///
    /// Returns [`MathError::MissingData`] when no data histogram is bound,
    /// or the first bin error.
    pub fn eval_sample(&self, sample: &Sample) -> Result<f64, MathError> {
        let data = sample.data().ok_or_else(|| MathError::MissingData {
            sample: sample.name().to_owned(),
        })?;
        let mc = sample.histogram().content();
        let mc_var = sample.histogram().error2();

        let mut total = 0.0;
        for bin in 0..sample.binning().len() {
            total += self.eval_bin(mc[bin], data[bin], mc_var[bin], sample.name(), bin)?;
        }
        Ok(total)
    }
}

fn invalid(sample: &str, bin: usize, mc: f64, data: f64) -> MathError {
    MathError::InvalidLikelihood {
        sample: sample.to_owned(),
        bin,
        mc,
        data,
    }
}

// 2 * [mu - n + n ln(n / mu)], with n ln(n / mu) = 0 at n = 0
fn poisson_term(mc: f64, data: f64, sample: &str, bin: usize) -> Result<f64, MathError> {
    if data == 0.0 {
        return Ok(2.0 * mc);
    }
    if mc <= 0.0 {
        return Err(invalid(sample, bin, mc, data));
    }
    Ok(2.0 * (data.mul_add((data / mc).ln(), mc - data)))
}

/// Binned Poisson likelihood, `2 sum_b [mu_b - n_b + n_b ln(n_b / mu_b)]`.
#[derive(Clone, Copy, Debug, Default)]
pub struct PoissonLlh;

impl JointProbability for PoissonLlh {
    fn eval_bin(
        &self,
        mc: f64,
        data: f64,
        _mc_var: f64,
        sample: &str,
        bin: usize,
    ) -> Result<f64, MathError> {
        poisson_term(mc, data, sample, bin)
    }
}

/// Approximate chi-square, `sum_b (n_b - mu_b)^2 / mu_b`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Chi2;

impl JointProbability for Chi2 {
    fn eval_bin(
        &self,
        mc: f64,
        data: f64,
        _mc_var: f64,
        sample: &str,
        bin: usize,
    ) -> Result<f64, MathError> {
        if mc <= 0.0 {
            if data == 0.0 {
                return Ok(0.0);
            }
            return Err(invalid(sample, bin, mc, data));
        }
        Ok((data - mc).powi(2) / mc)
    }
}

/// Least squares, `sum_b (n_b - mu_b)^2`.
///
/// Not a real likelihood, but numerically tame, which makes it useful for
/// debugging. The Poissonian approximation divides by the observed count.
#[derive(Clone, Copy, Debug, Default)]
pub struct LeastSquares {
    /// Use the observed count as the bin variance.
    pub poissonian_approximation: bool,
}

impl JointProbability for LeastSquares {
    fn eval_bin(
        &self,
        mc: f64,
        data: f64,
        _mc_var: f64,
        _sample: &str,
        _bin: usize,
    ) -> Result<f64, MathError> {
        let squared = (data - mc).powi(2);
        if self.poissonian_approximation && data > 0.0 {
            return Ok(squared / data);
        }
        Ok(squared)
    }
}

// Scaling nuisance absorbing the MC statistical uncertainty of one bin:
// the positive root of beta^2 + (mu rel_var - 1) beta - n rel_var = 0.
fn barlow_beta(mc: f64, data: f64, rel_var: f64) -> f64 {
    let b = mc.mul_add(rel_var, -1.0);
    let discriminant = b.mul_add(b, 4.0 * data * rel_var);
    0.5 * (discriminant.sqrt() - b)
}

/// Barlow-Beeston likelihood: a per-bin nuisance `beta_b` absorbs the MC
/// statistical uncertainty, profiled analytically from the per-bin
/// quadratic.
#[derive(Clone, Copy, Debug, Default)]
pub struct BarlowLlh;

impl JointProbability for BarlowLlh {
    fn eval_bin(
        &self,
        mc: f64,
        data: f64,
        mc_var: f64,
        sample: &str,
        bin: usize,
    ) -> Result<f64, MathError> {
        if mc <= 0.0 || mc_var <= 0.0 {
            return poisson_term(mc, data, sample, bin);
        }

        let rel_var = mc_var / (mc * mc);
        let beta = barlow_beta(mc, data, rel_var);
        let scaled = mc * beta;

        Ok(poisson_term(scaled, data, sample, bin)? + (beta - 1.0).powi(2) / rel_var)
    }
}

/// Barlow-Beeston in the BANFF OA2020 convention.
#[derive(Clone, Copy, Debug, Default)]
pub struct BarlowLlhBanff2020;

impl JointProbability for BarlowLlhBanff2020 {
    fn eval_bin(
        &self,
        mc: f64,
        data: f64,
        mc_var: f64,
        sample: &str,
        bin: usize,
    ) -> Result<f64, MathError> {
        if mc <= 0.0 || mc_var <= 0.0 {
            return poisson_term(mc, data, sample, bin);
        }

        // fractional^2 is the relative variance of the prediction
        let fractional2 = mc_var / (mc * mc);
        let beta = barlow_beta(mc, data, fractional2);
        let scaled = mc * beta;

        Ok(poisson_term(scaled, data, sample, bin)? + (beta - 1.0).powi(2) / fractional2)
    }
}

/// Barlow-Beeston in the BANFF OA2021 convention, with its switchable
/// edge-case handling.
#[derive(Clone, Copy, Debug, Default)]
pub struct BarlowLlhBanff2021 {
    /// Accept bins with a vanishing prediction when the data also
    /// vanishes.
    pub allow_zero_mc_when_zero_data: bool,
    /// Skip the Barlow-Beeston scaling and use the plain Poisson
    /// likelihood.
    pub use_poisson_likelihood: bool,
    /// Keep the prediction unscaled in the statistical term; the nuisance
    /// only enters through its penalty.
    pub bb_no_update_weights: bool,
}

impl JointProbability for BarlowLlhBanff2021 {
    fn eval_bin(
        &self,
        mc: f64,
        data: f64,
        mc_var: f64,
        sample: &str,
        bin: usize,
    ) -> Result<f64, MathError> {
        if mc <= 0.0 {
            if data == 0.0 && self.allow_zero_mc_when_zero_data {
                return Ok(0.0);
            }
            return Err(invalid(sample, bin, mc, data));
        }

        if self.use_poisson_likelihood || mc_var <= 0.0 {
            return poisson_term(mc, data, sample, bin);
        }

        let fractional2 = mc_var / (mc * mc);
        let beta = barlow_beta(mc, data, fractional2);
        let scaled = if self.bb_no_update_weights { mc } else { mc * beta };

        Ok(poisson_term(scaled, data, sample, bin)? + (beta - 1.0).powi(2) / fractional2)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn poisson_vanishes_at_the_data() {
        let kernel = PoissonLlh;

        assert_approx_eq!(f64, kernel.eval_bin(100.0, 100.0, 0.0, "s", 0).unwrap(), 0.0);
        assert_approx_eq!(f64, kernel.eval_bin(5.0, 0.0, 0.0, "s", 0).unwrap(), 10.0);
    }

    #[test]
    fn poisson_matches_the_reference_point() {
        // 2 * (110 - 100 + 100 ln(100/110))
        let value = PoissonLlh.eval_bin(110.0, 100.0, 0.0, "s", 0).unwrap();

        assert_approx_eq!(f64, value, 0.9531017980, epsilon = 1e-9);
    }

    #[test]
    fn poisson_rejects_zero_prediction_with_data() {
        let result = PoissonLlh.eval_bin(0.0, 3.0, 0.0, "nue", 7);

        assert!(matches!(
            result,
            Err(MathError::InvalidLikelihood { bin: 7, .. })
        ));
    }

    #[test]
    fn chi2_is_the_scaled_residual() {
        assert_approx_eq!(f64, Chi2.eval_bin(100.0, 110.0, 0.0, "s", 0).unwrap(), 1.0);
        assert_approx_eq!(f64, Chi2.eval_bin(0.0, 0.0, 0.0, "s", 0).unwrap(), 0.0);
    }

    #[test]
    fn least_squares_with_poisson_variance() {
        let plain = LeastSquares {
            poissonian_approximation: false,
        };
        let poissonian = LeastSquares {
            poissonian_approximation: true,
        };

        assert_approx_eq!(f64, plain.eval_bin(90.0, 100.0, 0.0, "s", 0).unwrap(), 100.0);
        assert_approx_eq!(
            f64,
            poissonian.eval_bin(90.0, 100.0, 0.0, "s", 0).unwrap(),
            1.0
        );
    }

    #[test]
    fn barlow_beeston_reduces_to_poisson_without_mc_variance() {
        let poisson = PoissonLlh.eval_bin(95.0, 100.0, 0.0, "s", 0).unwrap();
        let banff = BarlowLlhBanff2021 {
            allow_zero_mc_when_zero_data: true,
            ..Default::default()
        };

        assert_approx_eq!(
            f64,
            BarlowLlh.eval_bin(95.0, 100.0, 0.0, "s", 0).unwrap(),
            poisson,
            epsilon = 1e-12
        );
        assert_approx_eq!(
            f64,
            banff.eval_bin(95.0, 100.0, 0.0, "s", 0).unwrap(),
            poisson,
            epsilon = 1e-12
        );
    }

    #[test]
    fn barlow_beeston_relaxes_the_poisson_tension() {
        // with MC statistical uncertainty the same deficit costs less
        let poisson = PoissonLlh.eval_bin(90.0, 100.0, 0.0, "s", 0).unwrap();
        let barlow = BarlowLlh.eval_bin(90.0, 100.0, 25.0, "s", 0).unwrap();

        assert!(barlow < poisson);
        assert!(barlow > 0.0);
    }

    #[test]
    fn banff_2021_zero_mc_handling() {
        let strict = BarlowLlhBanff2021::default();
        let lenient = BarlowLlhBanff2021 {
            allow_zero_mc_when_zero_data: true,
            ..Default::default()
        };

        assert!(strict.eval_bin(0.0, 0.0, 0.0, "s", 0).is_err());
        assert_approx_eq!(f64, lenient.eval_bin(0.0, 0.0, 0.0, "s", 0).unwrap(), 0.0);
        assert!(lenient.eval_bin(0.0, 5.0, 0.0, "s", 0).is_err());
    }

    #[test]
    fn banff_2021_flags_change_the_scaling() {
        let default = BarlowLlhBanff2021::default();
        let poisson_mode = BarlowLlhBanff2021 {
            use_poisson_likelihood: true,
            ..Default::default()
        };
        let no_update = BarlowLlhBanff2021 {
            bb_no_update_weights: true,
            ..Default::default()
        };

        let with_update = default.eval_bin(90.0, 100.0, 25.0, "s", 0).unwrap();
        let plain = poisson_mode.eval_bin(90.0, 100.0, 25.0, "s", 0).unwrap();
        let frozen = no_update.eval_bin(90.0, 100.0, 25.0, "s", 0).unwrap();

        assert_approx_eq!(
            f64,
            plain,
            PoissonLlh.eval_bin(90.0, 100.0, 0.0, "s", 0).unwrap(),
            epsilon = 1e-12
        );
        assert!(with_update < frozen);
    }
}
