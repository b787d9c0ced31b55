//! Module containing the configuration surface.
//!
//! Configurations are YAML documents deserialized into plain structs with
//! engine defaults. A `minEngineVersion` key refuses to run a config
//! written for a newer engine.

use crate::error::ConfigError;
use crate::joint_probability::{
    BarlowLlh, BarlowLlhBanff2020, BarlowLlhBanff2021, Chi2, JointProbabilityEnum, LeastSquares,
    PoissonLlh,
};
use crate::likelihood::DataPreset;
use crate::minimizer::MinimizerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Statistical kernel selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelType {
    /// Binned Poisson likelihood.
    #[default]
    PoissonLLH,
    /// Approximate Neyman chi-square.
    Chi2,
    /// Plain least squares.
    LeastSquares,
    /// Barlow-Beeston.
    BarlowLLH,
    /// Barlow-Beeston, BANFF OA2020 convention.
    #[serde(rename = "BarlowLLH_BANFF_OA2020")]
    BarlowLlhBanff2020,
    /// Barlow-Beeston, BANFF OA2021 convention.
    #[serde(rename = "BarlowLLH_BANFF_OA2021")]
    BarlowLlhBanff2021,
}

/// Kernel selection with its variant flags.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JointProbabilityConfig {
    /// Which kernel to use.
    pub r#type: KernelType,
    /// Least squares: use the observed count as the bin variance.
    pub lsq_poissonian_approximation: bool,
    /// OA2021: accept zero-prediction bins when the data also vanishes.
    pub allow_zero_mc_when_zero_data: bool,
    /// OA2021: skip the Barlow-Beeston scaling.
    pub use_poisson_likelihood: bool,
    /// OA2021: keep the prediction unscaled in the statistical term.
    pub bb_no_update_weights: bool,
}

impl JointProbabilityConfig {
    /// Builds the configured kernel.
    #[must_use]
    pub fn build(&self) -> JointProbabilityEnum {
        match self.r#type {
            KernelType::PoissonLLH => PoissonLlh.into(),
            KernelType::Chi2 => Chi2.into(),
            KernelType::LeastSquares => LeastSquares {
                poissonian_approximation: self.lsq_poissonian_approximation,
            }
            .into(),
            KernelType::BarlowLLH => BarlowLlh.into(),
            KernelType::BarlowLlhBanff2020 => BarlowLlhBanff2020.into(),
            KernelType::BarlowLlhBanff2021 => BarlowLlhBanff2021 {
                allow_zero_mc_when_zero_data: self.allow_zero_mc_when_zero_data,
                use_poisson_likelihood: self.use_poisson_likelihood,
                bb_no_update_weights: self.bb_no_update_weights,
            }
            .into(),
        }
    }
}

fn default_threads() -> usize {
    1
}

/// Top-level configuration of a fit.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FitConfig {
    /// Oldest engine version this config is written for.
    pub min_engine_version: Option<String>,
    /// Print the per-sample event counts after load.
    pub show_event_breakdown: bool,
    /// Worker threads of the runtime.
    #[serde(default = "default_threads")]
    pub num_threads: usize,
    /// Which dataset the fit compares against.
    pub data_preset: DataPreset,
    /// Statistical kernel selection.
    pub joint_probability_config: JointProbabilityConfig,
    /// Minimizer driver configuration.
    pub minimizer_config: MinimizerConfig,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            min_engine_version: None,
            show_event_breakdown: false,
            num_threads: default_threads(),
            data_preset: DataPreset::Asimov,
            joint_probability_config: JointProbabilityConfig::default(),
            minimizer_config: MinimizerConfig::default(),
        }
    }
}

impl FitConfig {
    /// Parses a YAML configuration and checks the engine version gate.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] on malformed YAML or when the config
    /// requires a newer engine.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.check_version(env!("CARGO_PKG_VERSION"))?;
        Ok(config)
    }

    /// Loads a YAML configuration from `path`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the file is unreadable or invalid.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|err| ConfigError::InvalidValue {
            key: path.display().to_string(),
            reason: err.to_string(),
        })?;
        Self::from_yaml(&text)
    }

    fn check_version(&self, current: &str) -> Result<(), ConfigError> {
        let Some(required) = &self.min_engine_version else {
            return Ok(());
        };

        let parse = |text: &str| -> Result<[u64; 3], ConfigError> {
            let mut parts = [0; 3];
            let mut fields = text.trim().split('.');
            for part in &mut parts {
                *part = fields
                    .next()
                    .and_then(|field| field.parse().ok())
                    .ok_or_else(|| ConfigError::InvalidValue {
                        key: "minEngineVersion".to_owned(),
                        reason: format!("'{text}' is not a semantic version"),
                    })?;
            }
            Ok(parts)
        };

        if parse(required)? > parse(current)? {
            return Err(ConfigError::UnsupportedEngineVersion {
                required: required.clone(),
                current: current.to_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::minimizer::ErrorsAlgo;

    #[test]
    fn defaults_survive_an_empty_config() {
        let config = FitConfig::from_yaml("{}").unwrap();

        assert_eq!(config.data_preset, DataPreset::Asimov);
        assert_eq!(config.joint_probability_config.r#type, KernelType::PoissonLLH);
        assert_eq!(config.num_threads, 1);
        assert!(config.minimizer_config.use_normalized_fit_space);
    }

    #[test]
    fn the_documented_keys_deserialize() {
        let config = FitConfig::from_yaml(
            "dataPreset: Toy\n\
             showEventBreakdown: true\n\
             numThreads: 4\n\
             jointProbabilityConfig:\n\
             \x20 type: BarlowLLH_BANFF_OA2021\n\
             \x20 allowZeroMcWhenZeroData: true\n\
             minimizerConfig:\n\
             \x20 useNormalizedFitSpace: false\n\
             \x20 enableSimplexBeforeMinimize: true\n\
             \x20 errorsAlgo: Minos\n\
             \x20 stepSizeScaling: 0.5\n",
        )
        .unwrap();

        assert_eq!(config.data_preset, DataPreset::Toy);
        assert!(config.show_event_breakdown);
        assert_eq!(config.num_threads, 4);
        assert_eq!(
            config.joint_probability_config.r#type,
            KernelType::BarlowLlhBanff2021
        );
        assert!(config.joint_probability_config.allow_zero_mc_when_zero_data);
        assert!(!config.minimizer_config.use_normalized_fit_space);
        assert!(config.minimizer_config.enable_simplex_before_minimize);
        assert_eq!(config.minimizer_config.errors_algo, ErrorsAlgo::Minos);
        assert!((config.minimizer_config.step_size_scaling - 0.5).abs() < 1e-12);
    }

    #[test]
    fn kernel_selection_builds_the_right_variant() {
        let config = JointProbabilityConfig {
            r#type: KernelType::LeastSquares,
            lsq_poissonian_approximation: true,
            ..Default::default()
        };

        assert!(matches!(
            config.build(),
            JointProbabilityEnum::LeastSquares(LeastSquares {
                poissonian_approximation: true
            })
        ));
    }

    #[test]
    fn version_gate_refuses_newer_configs() {
        let config = FitConfig {
            min_engine_version: Some("99.0.0".to_owned()),
            ..Default::default()
        };

        assert!(matches!(
            config.check_version("0.2.0"),
            Err(ConfigError::UnsupportedEngineVersion { .. })
        ));
        config.check_version("99.0.0").unwrap();
        config.check_version("99.0.1").unwrap();
    }

    #[test]
    fn malformed_versions_are_rejected() {
        let config = FitConfig {
            min_engine_version: Some("not-a-version".to_owned()),
            ..Default::default()
        };

        assert!(matches!(
            config.check_version("0.2.0"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
