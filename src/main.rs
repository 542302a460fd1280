use std::{path::PathBuf, process::ExitCode};

use anyhow::{bail, Context, Result};
use cifar_images::{
    datasets::{Cifar10, DatasetSplit},
    export::{
        self,
        selection::{Cap, Selection},
        writer::ColorMode,
        ExportConfig,
    },
};
use clap::Parser;
use tracing::Level;

#[derive(Parser, Debug)]
#[command(name = "cifar-images")]
#[command(about = "Export pickled CIFAR-10 batches as PNG files")]
struct Args {
    /// The type of dataset (train|test)
    #[arg(long)]
    dataset: String,

    /// Path to the folder containing the pickled batch files
    #[arg(long = "input_folder")]
    input_path: PathBuf,

    /// Path to the folder for saving generated images
    #[arg(long = "output_path")]
    output_path: PathBuf,

    /// List of classes to be selected
    #[arg(long = "class_list", default_value = "[0,1,2,3,4,5,6,7,8,9]")]
    class_list: String,

    /// List of maximum number of elements per class to be selected, -1 for no limit
    #[arg(long = "nb_class", default_value = "[-1,-1,-1,-1,-1,-1,-1,-1,-1,-1]")]
    nb_class: String,

    /// Convert images to grayscale
    #[arg(long)]
    grayscale: bool,

    /// Logging level: debug, info, warning, error, critical
    #[arg(long, default_value = "warning")]
    logging: String,

    /// Download the dataset archive into the input folder if batches are missing
    #[cfg(feature = "download")]
    #[arg(long)]
    download: bool,
}

struct Settings {
    split: DatasetSplit,
    input_path: PathBuf,
    export: ExportConfig,
    #[cfg(feature = "download")]
    download: bool,
}

impl Args {
    fn validate(self) -> Result<Settings> {
        if !self.input_path.exists() {
            bail!("The input path is not valid: {}", self.input_path.display());
        }
        if !self.output_path.is_dir() {
            bail!("The output path is not valid: {}", self.output_path.display());
        }
        let split: DatasetSplit = self.dataset.parse()?;

        let classes = parse_int_list(&self.class_list)
            .context("invalid --class_list")?
            .into_iter()
            .filter_map(|c| match usize::try_from(c) {
                Ok(class) => Some(class),
                Err(_) => {
                    tracing::warn!("Ignoring class {c}: no sample has a negative label");
                    None
                }
            })
            .collect();
        let caps = parse_int_list(&self.nb_class)
            .context("invalid --nb_class")?
            .into_iter()
            .map(Cap::from)
            .collect();

        Ok(Settings {
            split,
            input_path: self.input_path,
            export: ExportConfig {
                output_dir: self.output_path,
                selection: Selection::new(classes, caps),
                color: if self.grayscale {
                    ColorMode::Grayscale
                } else {
                    ColorMode::Rgb
                },
            },
            #[cfg(feature = "download")]
            download: self.download,
        })
    }
}

/// Parses `"[0,1,2]"`. Brackets are optional.
fn parse_int_list(s: &str) -> Result<Vec<i64>> {
    s.replace(['[', ']'], "")
        .split(',')
        .map(|item| {
            let item = item.trim();
            item.parse::<i64>()
                .with_context(|| format!("{item:?} is not an integer"))
        })
        .collect()
}

/// Unknown names fall back to `warning`.
fn log_level(name: &str) -> Level {
    match name.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" | "critical" => Level::ERROR,
        _ => Level::WARN,
    }
}

#[cfg(feature = "download")]
fn batch_root(settings: &Settings) -> Result<PathBuf> {
    if settings.download {
        let root = cifar_images::datasets::cifar10::fetch(&settings.input_path, settings.split)?;
        Ok(root)
    } else {
        Ok(settings.input_path.clone())
    }
}

#[cfg(not(feature = "download"))]
fn batch_root(settings: &Settings) -> Result<PathBuf> {
    Ok(settings.input_path.clone())
}

fn load(settings: &Settings) -> Result<Cifar10> {
    let input = batch_root(settings)?;
    Cifar10::new(&input, settings.split)
        .with_context(|| format!("Failed to load input files from: {}", input.display()))
}

fn run(args: Args) -> Result<()> {
    let settings = args.validate()?;
    let dataset = load(&settings)?;
    if dataset.is_empty() {
        tracing::warn!("No images found in {}", settings.input_path.display());
    }
    tracing::info!(
        "Loaded {} {} images with {} classes",
        dataset.len(),
        settings.split,
        dataset.num_classes()
    );

    let summary = export::export(&dataset, &settings.export)?;
    for (label, counted) in &summary.counted {
        let name = Cifar10::label_name(*label).unwrap_or("?");
        let written = summary.per_label.get(label).copied().unwrap_or(0);
        tracing::info!("Class {label} ({name}): saved {written} of {counted} images");
    }
    tracing::info!(
        "Saved {} of {} images to {}",
        summary.written,
        summary.seen,
        settings.export.output_dir.display()
    );
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(log_level(&args.logging))
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn args(input: &Path, output: &Path) -> Args {
        Args::parse_from([
            "cifar-images",
            "--dataset",
            "train",
            "--input_folder",
            input.to_str().unwrap(),
            "--output_path",
            output.to_str().unwrap(),
        ])
    }

    #[test]
    fn parses_bracketed_lists() {
        assert_eq!(parse_int_list("[0,1,2]").unwrap(), vec![0, 1, 2]);
        assert_eq!(parse_int_list("[-1, 5]").unwrap(), vec![-1, 5]);
        assert_eq!(parse_int_list("3").unwrap(), vec![3]);
        assert!(parse_int_list("[]").is_err());
        assert!(parse_int_list("[1,a]").is_err());
    }

    #[test]
    fn log_levels_fall_back_to_warning() {
        assert_eq!(log_level("DEBUG"), Level::DEBUG);
        assert_eq!(log_level("info"), Level::INFO);
        assert_eq!(log_level("critical"), Level::ERROR);
        assert_eq!(log_level("verbose"), Level::WARN);
    }

    #[test]
    fn defaults_select_all_classes_unbounded() {
        let dir = tempfile::tempdir().unwrap();
        let settings = args(dir.path(), dir.path()).validate().unwrap();
        assert_eq!(settings.split, DatasetSplit::Train);
        assert_eq!(settings.export.selection, Selection::all(10));
        assert_eq!(settings.export.color, ColorMode::Rgb);
    }

    #[test]
    fn invalid_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(args(&missing, dir.path()).validate().is_err());

        let file = dir.path().join("file");
        std::fs::write(&file, b"").unwrap();
        assert!(args(dir.path(), &file).validate().is_err());
    }

    #[test]
    fn negative_classes_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = args(dir.path(), dir.path());
        a.class_list = "[-1,0,-5,3]".into();
        let settings = a.validate().unwrap();
        assert_eq!(settings.export.selection.classes(), &[0, 3]);
    }

    #[test]
    fn unsupported_dataset_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = args(dir.path(), dir.path());
        a.dataset = "valid".into();
        assert!(a.validate().is_err());
    }
}
