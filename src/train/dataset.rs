use std::fs;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::audio_pipeline::TARGET_SAMPLE_RATE;
use crate::features::{self, FeatureVector};
use crate::input::extension_of;
use crate::loader;
use crate::model::Label;
use crate::opts::Opts;
use crate::synth;
use crate::{Error, Result};

/// Sub-directory holding authentic recordings.
pub const REAL_DIR: &str = "real";
/// Sub-directory holding cloned recordings.
pub const FAKE_DIR: &str = "fake";

/// Labeled feature vectors, in a stable order.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub rows: Vec<Vec<f32>>,
    /// 0 = real, 1 = fake.
    pub targets: Vec<u8>,
    /// Where each row came from (file path or synthetic id).
    pub sources: Vec<String>,
    /// Inputs that could not be turned into a feature vector, with the reason.
    pub skipped: Vec<(String, String)>,
}

struct Item {
    source: String,
    label: Label,
    job: Job,
}

enum Job {
    File(PathBuf),
    Synthetic { seconds: f32, seed: u64 },
}

impl Dataset {
    /// Extract features from every supported file under `dir/real` and `dir/fake`.
    pub fn from_dir(dir: impl AsRef<Path>, opts: &Opts) -> Result<Self> {
        Self::from_dir_with_progress(dir, opts, &|_| {})
    }

    /// Like [`Dataset::from_dir`], calling `progress` with each input's source once it is done.
    pub fn from_dir_with_progress(
        dir: impl AsRef<Path>,
        opts: &Opts,
        progress: &(dyn Fn(&str) + Sync),
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let mut items = Vec::new();
        for (sub, label) in [(REAL_DIR, Label::Real), (FAKE_DIR, Label::Fake)] {
            for path in list_audio(&dir.join(sub), opts)? {
                items.push(Item {
                    source: path.display().to_string(),
                    label,
                    job: Job::File(path),
                });
            }
        }
        if items.is_empty() {
            return Err(Error::InvalidInput(format!(
                "no supported audio under '{}/{{{REAL_DIR},{FAKE_DIR}}}'",
                dir.display()
            )));
        }
        Ok(Self::build(items, opts, progress))
    }

    /// `per_class` natural and `per_class` cloned synthetic voices of 1.5 to 5 seconds.
    pub fn synthetic(per_class: usize, seed: u64, opts: &Opts) -> Self {
        Self::synthetic_with_progress(per_class, seed, opts, &|_| {})
    }

    pub fn synthetic_with_progress(
        per_class: usize,
        seed: u64,
        opts: &Opts,
        progress: &(dyn Fn(&str) + Sync),
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut items = Vec::with_capacity(per_class * 2);
        for label in [Label::Real, Label::Fake] {
            for i in 0..per_class {
                items.push(Item {
                    source: format!("synthetic/{}/{i}", label.as_str()),
                    label,
                    job: Job::Synthetic {
                        seconds: rng.gen_range(1.5..5.0),
                        seed: rng.r#gen(),
                    },
                });
            }
        }
        Self::build(items, opts, progress)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// `(real, fake)` row counts.
    pub fn class_counts(&self) -> (usize, usize) {
        let fake = self.targets.iter().filter(|&&t| t == 1).count();
        (self.targets.len() - fake, fake)
    }

    /// Extract every item on a rayon pool of `num_cpus` workers, keeping input order.
    fn build(items: Vec<Item>, opts: &Opts, progress: &(dyn Fn(&str) + Sync)) -> Self {
        let extract_all = || -> Vec<Result<FeatureVector>> {
            items
                .par_iter()
                .map(|item| {
                    let res = featurize(item, opts);
                    progress(&item.source);
                    res
                })
                .collect()
        };
        let outputs = match ThreadPoolBuilder::new()
            .num_threads(num_cpus::get().clamp(1, items.len().max(1)))
            .thread_name(|i| format!("clonewatch-extract-{i}"))
            .build()
        {
            Ok(pool) => pool.install(extract_all),
            Err(e) => {
                warn!(error = %e, "falling back to the global rayon pool");
                extract_all()
            }
        };

        let mut ds = Self::default();
        for (item, res) in items.into_iter().zip(outputs) {
            match res {
                Ok(fv) => {
                    ds.rows.push(fv.into_inner());
                    ds.targets.push(item.label.target());
                    ds.sources.push(item.source);
                }
                Err(e) => {
                    warn!(source = %item.source, error = %e, "skipping training input");
                    ds.skipped.push((item.source, e.to_string()));
                }
            }
        }

        let (real, fake) = ds.class_counts();
        info!(real, fake, skipped = ds.skipped.len(), "dataset ready");
        ds
    }
}

fn featurize(item: &Item, opts: &Opts) -> Result<FeatureVector> {
    let waveform = match (&item.job, item.label) {
        (Job::File(path), _) => loader::load_file(path, opts)?,
        (Job::Synthetic { seconds, seed }, Label::Real) => {
            loader::load_samples(synth::natural_voice(*seconds, *seed), TARGET_SAMPLE_RATE, opts)?
        }
        (Job::Synthetic { seconds, seed }, Label::Fake) => {
            loader::load_samples(synth::cloned_voice(*seconds, *seed), TARGET_SAMPLE_RATE, opts)?
        }
    };
    features::extract(&waveform)
}

/// Supported audio files directly inside `dir`, sorted by name. A missing directory is empty.
fn list_audio(dir: &Path, opts: &Opts) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .and_then(extension_of)
                .is_some_and(|ext| opts.allowed_extensions.iter().any(|a| a.eq_ignore_ascii_case(&ext)))
        })
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn parallel_extraction_keeps_input_order() {
        let done = AtomicUsize::new(0);
        let ds = Dataset::synthetic_with_progress(3, 9, &Opts::default(), &|_| {
            done.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(done.load(Ordering::Relaxed), 6);
        assert!(ds.skipped.is_empty());
        assert_eq!(
            ds.sources,
            [
                "synthetic/real/0",
                "synthetic/real/1",
                "synthetic/real/2",
                "synthetic/fake/0",
                "synthetic/fake/1",
                "synthetic/fake/2",
            ]
        );
        assert_eq!(ds.targets, [0, 0, 0, 1, 1, 1]);
    }

    #[test]
    fn unreadable_files_are_skipped_not_fatal() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join(REAL_DIR))?;
        std::fs::write(dir.path().join(REAL_DIR).join("broken.wav"), b"not audio")?;

        let ds = Dataset::from_dir(dir.path(), &Opts::default())?;
        assert!(ds.is_empty());
        assert_eq!(ds.skipped.len(), 1);
        Ok(())
    }
}
