//! Module containing the output archive.
//!
//! Every run persists a single tar archive whose entries are
//! lz4-compressed bincode records, laid out as directories: engine
//! metadata, post-fit samples/events/histograms, per-throw bin tables and
//! the per-set post-fit error matrices in both the normalized and the
//! original basis.

use crate::error::{Error, LoadError};
use crate::minimizer::{FitMinimum, PostFitCovariance};
use crate::propagator::Propagator;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use nalgebra::DMatrix;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Snapshot of one event, as persisted.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Index of the dataset the event was read from.
    pub dataset: usize,
    /// Source entry id.
    pub entry: u64,
    /// Assigned sample index.
    pub sample: Option<usize>,
    /// Assigned bin index.
    pub bin: Option<usize>,
    /// Weight at load time.
    pub base_weight: f64,
    /// Weight after the last propagation.
    pub current_weight: f64,
}

/// Snapshot of one histogram, as persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistogramRecord {
    /// Per-bin content.
    pub content: Vec<f64>,
    /// Per-bin statistical error.
    pub error: Vec<f64>,
    /// Per-bin data content, when a data slot was bound.
    pub data: Option<Vec<f64>>,
}

/// Snapshot of one parameter, as persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterRecord {
    /// Full name, `"set/parameter"`.
    pub name: String,
    /// Post-fit value.
    pub value: f64,
    /// Prior value.
    pub prior: f64,
    /// Prior sigma.
    pub sigma: f64,
    /// Whether the parameter was a fit degree of freedom.
    pub fixed: bool,
}

/// A dense matrix, as persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatrixRecord {
    /// Row count.
    pub rows: usize,
    /// Column count.
    pub cols: usize,
    /// Row-major values.
    pub values: Vec<f64>,
}

impl MatrixRecord {
    fn from_matrix(matrix: &DMatrix<f64>) -> Self {
        Self {
            rows: matrix.nrows(),
            cols: matrix.ncols(),
            values: (0..matrix.nrows())
                .flat_map(|row| (0..matrix.ncols()).map(move |col| matrix[(row, col)]))
                .collect(),
        }
    }
}

/// Writer for the single-file output archive.
pub struct FitArchive {
    builder: tar::Builder<File>,
}

impl FitArchive {
    /// Creates the archive at `path`, truncating any previous one, and
    /// writes the engine metadata entries.
    ///
    /// # Errors
    ///
    /// Returns a [`LoadError`] when the file cannot be created.
    pub fn create(path: &Path, command_line: &str) -> Result<Self, Error> {
        let file = File::create(path).map_err(LoadError::Io)?;
        let mut archive = Self {
            builder: tar::Builder::new(file),
        };

        archive.write_entry("calcXsec/version", &env!("CARGO_PKG_VERSION").to_owned())?;
        archive.write_entry("calcXsec/commandLine", &command_line.to_owned())?;
        Ok(archive)
    }

    /// Serializes `value` into the archive entry `path`.
    ///
    /// # Errors
    ///
    /// Returns a [`LoadError`] on serialization or I/O failure.
    pub fn write_entry<T: Serialize>(&mut self, path: &str, value: &T) -> Result<(), Error> {
        let encoded = bincode::serialize(value)
            .map_err(|err| Error::Other(anyhow::Error::new(err).context(path.to_owned())))?;
        let mut encoder = FrameEncoder::new(Vec::new());
        encoder.write_all(&encoded).map_err(LoadError::Io)?;
        let compressed = encoder.finish().map_err(|err| Error::Other(err.into()))?;

        let mut header = tar::Header::new_gnu();
        header.set_size(compressed.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        self.builder
            .append_data(&mut header, path, compressed.as_slice())
            .map_err(LoadError::Io)?;
        Ok(())
    }

    /// Persists the post-fit state: per-sample summaries, events and
    /// histograms under `XsecExtractor/postFit/`, and per-set values and
    /// error matrices under `postFit/Hesse/errors/`.
    ///
    /// # Errors
    ///
    /// Forwards entry-writing failures.
    pub fn write_post_fit(
        &mut self,
        propagator: &Propagator,
        minimum: &FitMinimum,
        covariance: &PostFitCovariance,
    ) -> Result<(), Error> {
        self.write_entry("postFit/bestFit", minimum)?;

        for sample in propagator.samples() {
            let events: Vec<EventRecord> = sample
                .events()
                .iter()
                .map(|event| EventRecord {
                    dataset: event.dataset_index(),
                    entry: event.entry_index(),
                    sample: event.sample_index(),
                    bin: event.bin_index(),
                    base_weight: event.base_weight(),
                    current_weight: event.current_weight(),
                })
                .collect();
            let histogram = HistogramRecord {
                content: sample.histogram().content().to_vec(),
                error: sample.histogram().error().to_vec(),
                data: sample.data().map(|data| data.to_vec()),
            };

            self.write_entry(
                &format!("XsecExtractor/postFit/samples/{}", sample.name()),
                &format!("{sample}"),
            )?;
            self.write_entry(
                &format!("XsecExtractor/postFit/events/{}", sample.name()),
                &events,
            )?;
            self.write_entry(
                &format!("XsecExtractor/postFit/histograms/{}", sample.name()),
                &histogram,
            )?;
        }

        for set in propagator.parameter_sets() {
            let values: Vec<ParameterRecord> = set
                .parameters()
                .iter()
                .enumerate()
                .map(|(index, parameter)| ParameterRecord {
                    name: set.full_name(index),
                    value: parameter.value(),
                    prior: parameter.prior(),
                    sigma: parameter.sigma(),
                    fixed: parameter.is_fixed(),
                })
                .collect();
            self.write_entry(&format!("postFit/Hesse/errors/{}/values", set.name()), &values)?;

            let prefix = format!("{}/", set.name());
            let indices: Vec<usize> = covariance
                .labels
                .iter()
                .enumerate()
                .filter(|(_, label)| label.starts_with(&prefix))
                .map(|(index, _)| index)
                .collect();
            if indices.is_empty() {
                continue;
            }

            let block = DMatrix::from_fn(indices.len(), indices.len(), |row, col| {
                covariance.original[(indices[row], indices[col])]
            });
            let sigmas: Vec<f64> = indices
                .iter()
                .map(|&index| {
                    let name = covariance.labels[index]
                        .strip_prefix(&prefix)
                        .unwrap()
                        .to_owned();
                    set.parameters()
                        .iter()
                        .find(|parameter| parameter.name() == name)
                        .map_or(1.0, crate::parameter::Parameter::sigma)
                })
                .collect();
            let normalized = DMatrix::from_fn(indices.len(), indices.len(), |row, col| {
                block[(row, col)] / (sigmas[row] * sigmas[col])
            });
            let correlation = DMatrix::from_fn(indices.len(), indices.len(), |row, col| {
                let denominator = (block[(row, row)] * block[(col, col)]).sqrt();
                if denominator > 0.0 {
                    block[(row, col)] / denominator
                } else {
                    0.0
                }
            });

            let base = format!("postFit/Hesse/errors/{}/matrices", set.name());
            self.write_entry(&format!("{base}/covariance"), &MatrixRecord::from_matrix(&block))?;
            self.write_entry(
                &format!("{base}/covarianceNormalized"),
                &MatrixRecord::from_matrix(&normalized),
            )?;
            self.write_entry(
                &format!("{base}/correlation"),
                &MatrixRecord::from_matrix(&correlation),
            )?;
            self.write_entry(
                &format!("{base}/correlationNormalized"),
                &MatrixRecord::from_matrix(&correlation),
            )?;
        }

        Ok(())
    }

    /// Persists per-throw bin values as one table: row `i` holds the
    /// concatenated bin contents of throw `i`.
    ///
    /// # Errors
    ///
    /// Forwards entry-writing failures.
    pub fn write_throws(&mut self, throws: &[Vec<f64>]) -> Result<(), Error> {
        self.write_entry("XsecExtractor/throws/binValues", &throws.to_vec())
    }

    /// Flushes and closes the archive.
    ///
    /// # Errors
    ///
    /// Returns a [`LoadError`] on I/O failure.
    pub fn finish(mut self) -> Result<(), Error> {
        self.builder.finish().map_err(LoadError::Io)?;
        Ok(())
    }

    /// Reads entry `entry` back from the archive at `path`.
    ///
    /// # Errors
    ///
    /// Returns a [`LoadError`] when the entry is absent or undecodable.
    pub fn read_entry<T: DeserializeOwned>(path: &Path, entry: &str) -> Result<T, Error> {
        let file = File::open(path).map_err(LoadError::Io)?;
        let mut archive = tar::Archive::new(file);

        for candidate in archive.entries().map_err(LoadError::Io)? {
            let candidate = candidate.map_err(LoadError::Io)?;
            if candidate.path().map_err(LoadError::Io)?.to_string_lossy() == entry {
                let mut decoder = FrameDecoder::new(candidate);
                let mut decoded = Vec::new();
                decoder.read_to_end(&mut decoded).map_err(LoadError::Io)?;
                return bincode::deserialize(&decoded)
                    .map_err(|err| Error::Other(anyhow::Error::new(err).context(entry.to_owned())));
            }
        }

        Err(Error::Other(anyhow::anyhow!(
            "archive entry '{entry}' not found"
        )))
    }
}
