use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use clonewatch::Opts;
use clonewatch::model::{BoostingParams, ForestParams, SvmParams};
use clonewatch::train::{Dataset, Family, TrainOpts, train};

#[derive(Parser, Debug)]
#[command(name = "clonewatch-train")]
#[command(about = "Train the voice clone detection ensemble", long_about = None)]
struct Params {
    /// Directory with `real/` and `fake/` sub-directories of audio files.
    #[arg(long, required_unless_present = "synthetic")]
    data: Option<PathBuf>,

    /// Train on this many synthetic voices per class instead of a data directory.
    #[arg(long, conflicts_with = "data")]
    synthetic: Option<usize>,

    /// Where to write the artifact directory.
    #[arg(long, default_value = "./models")]
    out: PathBuf,

    /// Optional JSON file with preprocessing options.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Model families to fit (default: all).
    #[arg(long, value_enum, num_args = 1..)]
    families: Vec<Family>,

    #[arg(long, default_value_t = 0.2)]
    holdout: f64,

    /// Share of the training split used to calibrate probabilities; 0 disables calibration.
    #[arg(long, default_value_t = 0.2)]
    calibration: f64,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Trees in the random forest.
    #[arg(long, default_value_t = 100)]
    trees: usize,

    /// Boosting rounds.
    #[arg(long, default_value_t = 100)]
    rounds: usize,

    /// SVM box constraint.
    #[arg(long = "svm-c", default_value_t = 1.0)]
    svm_c: f64,
}

fn main() -> Result<()> {
    clonewatch::init_logging();
    let params = Params::parse();

    if !(0.0..1.0).contains(&params.holdout) || params.holdout == 0.0 {
        bail!("--holdout must be in (0, 1), got {}", params.holdout);
    }
    if !(0.0..1.0).contains(&params.calibration) {
        bail!("--calibration must be in [0, 1), got {}", params.calibration);
    }
    if params.svm_c.is_nan() || params.svm_c <= 0.0 {
        bail!("--svm-c must be positive, got {}", params.svm_c);
    }

    let opts = match &params.config {
        Some(path) => Opts::from_json_file(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?,
        None => Opts::default(),
    };

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {pos} inputs {elapsed} {wide_msg}")?
            .progress_chars("#>-"),
    );
    let progress = |source: &str| {
        pb.inc(1);
        pb.set_message(source.to_owned());
    };

    let dataset = match (&params.data, params.synthetic) {
        (Some(dir), _) => Dataset::from_dir_with_progress(dir, &opts, &progress)
            .with_context(|| format!("failed to read dataset '{}'", dir.display()))?,
        (None, Some(per_class)) => {
            pb.set_length(per_class as u64 * 2);
            Dataset::synthetic_with_progress(per_class, params.seed, &opts, &progress)
        }
        (None, None) => bail!("either --data or --synthetic is required"),
    };
    pb.finish_and_clear();

    let (real, fake) = dataset.class_counts();
    eprintln!(
        "dataset: {real} real, {fake} fake, {} skipped",
        dataset.skipped.len()
    );
    for (source, reason) in &dataset.skipped {
        eprintln!("  skipped {source}: {reason}");
    }

    let train_opts = TrainOpts {
        holdout_fraction: params.holdout,
        calibration_fraction: params.calibration,
        seed: params.seed,
        families: if params.families.is_empty() {
            Family::ALL.to_vec()
        } else {
            params.families.clone()
        },
        forest: ForestParams {
            n_trees: params.trees,
            seed: params.seed,
            ..ForestParams::default()
        },
        boosting: BoostingParams {
            n_rounds: params.rounds,
            seed: params.seed,
            ..BoostingParams::default()
        },
        svm: SvmParams {
            c: params.svm_c,
            seed: params.seed,
            ..SvmParams::default()
        },
        ..TrainOpts::default()
    };

    let set = train(&dataset, &train_opts)?;
    for (name, stats) in &set.metadata.models {
        eprintln!(
            "  {name:<20} accuracy {:.4}  auc {:.4}  ({:.2}s)",
            stats.accuracy, stats.auc_score, stats.training_time
        );
    }
    eprintln!("best model: {}", set.metadata.best_model);

    set.write(&params.out)
        .with_context(|| format!("failed to write artifacts to '{}'", params.out.display()))?;
    eprintln!("wrote {}", params.out.display());
    Ok(())
}
