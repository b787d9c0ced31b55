#![warn(clippy::all, clippy::cargo, clippy::nursery, clippy::pedantic)]
#![warn(missing_docs)]

//! `oscfit` is a binned maximum-likelihood fitter for cross-section and
//! oscillation analyses: simulated events are reweighted through
//! per-parameter response dials, compared to data in user-defined
//! multi-dimensional bins, and a minimizer extracts the best-fit
//! parameters with their post-fit covariance.

pub mod archive;
pub mod bin;
pub mod config;
pub mod dial;
pub mod dial_cache;
pub mod error;
pub mod event;
pub mod formula;
pub mod joint_probability;
pub mod likelihood;
pub mod minimizer;
pub mod parameter;
pub mod propagator;
pub mod runtime;
pub mod sample;
pub mod scan;
