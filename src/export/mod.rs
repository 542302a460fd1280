//! Writes the samples of a [`Cifar10`] split out as PNG files.
//!
//! Train exports go to `<output>/<label>/<name>.png`, test exports to
//! `<output>/<name>.png`.

pub mod filename;
pub mod selection;
pub mod writer;

use std::{
    collections::BTreeMap,
    io::{self, Write},
    path::{Path, PathBuf},
};

use rand::RngCore;
use thiserror::Error;

use crate::datasets::{Cifar10, DatasetSplit};
use filename::FilenameGenerator;
use selection::{Cap, Decision, LabelCount, Selection, SelectionError};
use writer::{write_image, ColorMode};

/// A progress line is logged every this many samples.
pub const DISPLAY_STEP: usize = 1000;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error("failed to create {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to report filename {name}: {source}")]
    Report {
        name: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub output_dir: PathBuf,
    pub selection: Selection,
    pub color: ColorMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub seen: usize,
    pub written: usize,
    pub per_label: BTreeMap<usize, usize>,
    /// Samples of each listed class, including those over the cap.
    pub counted: BTreeMap<usize, usize>,
}

/// Whether the sample at `index` gets a progress line: the second sample
/// and every `DISPLAY_STEP`th.
pub fn should_report(index: usize) -> bool {
    index == 1 || index % DISPLAY_STEP == 0
}

/// Directory the images of `label` go to.
pub fn target_dir(output_dir: &Path, split: DatasetSplit, label: usize) -> PathBuf {
    match split {
        DatasetSplit::Train => output_dir.join(label.to_string()),
        DatasetSplit::Test => output_dir.to_path_buf(),
    }
}

/// Exports `dataset` with random filenames, reporting test filenames of
/// classes capped at 1 on stdout.
pub fn export(dataset: &Cifar10, config: &ExportConfig) -> Result<ExportSummary, ExportError> {
    let stdout = io::stdout();
    let mut report = stdout.lock();
    export_with(dataset, config, &mut FilenameGenerator::new(), &mut report)
}

pub fn export_with<R: RngCore, W: Write>(
    dataset: &Cifar10,
    config: &ExportConfig,
    names: &mut FilenameGenerator<R>,
    report: &mut W,
) -> Result<ExportSummary, ExportError> {
    let split = dataset.split;
    let selection = &config.selection;

    if split == DatasetSplit::Train {
        for &label in selection.classes() {
            let path = target_dir(&config.output_dir, split, label);
            std::fs::create_dir_all(&path).map_err(|source| ExportError::CreateDir {
                path: path.clone(),
                source,
            })?;
        }
    }

    let mut counts = LabelCount::new(dataset.num_classes());
    let mut summary = ExportSummary::default();
    for (i, (img, label)) in dataset.iter().enumerate() {
        let label = *label;
        summary.seen += 1;
        let count = match selection.decide(label, &mut counts)? {
            Decision::Accept { count } => count,
            Decision::NotListed => continue,
            Decision::OverCap { count } => {
                tracing::debug!("Skipping sample #{i}: class {label} is over its cap ({count})");
                continue;
            }
        };

        let dir = target_dir(&config.output_dir, split, label);
        let name = names.next_in(&dir);
        if split == DatasetSplit::Test && selection.cap(label)? == Cap::AtMost(1) {
            writeln!(report, "{name}").map_err(|source| ExportError::Report {
                name: name.clone(),
                source,
            })?;
        }

        let path = dir.join(&name);
        write_image(img, &path, config.color).map_err(|source| ExportError::Write {
            path: path.clone(),
            source,
        })?;
        summary.written += 1;
        *summary.per_label.entry(label).or_insert(0) += 1;

        if should_report(i) {
            tracing::info!("Step #{i}: saved {name} (class {label}, #{count})");
        }
    }
    summary.counted = counts.iter().filter(|&(_, n)| n > 0).collect();
    Ok(summary)
}
