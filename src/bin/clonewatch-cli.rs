use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use clonewatch::audio_pipeline::TARGET_SAMPLE_RATE;
use clonewatch::wav::write_wav;
use clonewatch::{Detector, Opts, ShortAudioPolicy, synth};

#[derive(Parser, Debug)]
#[command(name = "clonewatch")]
#[command(about = "Voice clone detection CLI")]
struct Params {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyse audio files and print one JSON response per file.
    Analyze {
        /// Model artifact directory (model_metadata.json, scaler.json, <name>_model.json).
        #[arg(short = 'm', long = "models")]
        models_dir: PathBuf,

        /// Optional JSON file with analysis options.
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,

        /// Override the policy for audio shorter than the minimum duration.
        #[arg(long = "short-audio", value_enum)]
        short_audio_policy: Option<ShortAudioPolicy>,

        /// Pretty-print the JSON output.
        #[arg(long, default_value_t = false)]
        pretty: bool,

        #[arg(required = true, num_args = 1..)]
        audio: Vec<PathBuf>,
    },

    /// Print the loaded model set without analysing anything.
    Status {
        #[arg(short = 'm', long = "models")]
        models_dir: PathBuf,
    },

    /// Render a synthetic voice to a 16-bit mono WAV file.
    Synth {
        #[arg(short = 'k', long = "kind", value_enum, default_value_t = VoiceKind::Natural)]
        kind: VoiceKind,

        #[arg(short = 's', long = "seconds", default_value_t = 3.0)]
        seconds: f32,

        #[arg(long = "seed", default_value_t = 42)]
        seed: u64,

        #[arg(short = 'o', long = "out")]
        out: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum VoiceKind {
    Natural,
    Cloned,
}

fn main() -> ExitCode {
    clonewatch::init_logging();
    match run(Params::parse()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns `Ok(false)` when at least one analysis failed.
fn run(params: Params) -> Result<bool> {
    match params.command {
        Command::Analyze {
            models_dir,
            config,
            short_audio_policy,
            pretty,
            audio,
        } => {
            let mut opts = match config {
                Some(path) => Opts::from_json_file(&path)
                    .with_context(|| format!("failed to read config '{}'", path.display()))?,
                None => Opts::default(),
            };
            if let Some(policy) = short_audio_policy {
                opts.short_audio_policy = policy;
            }

            let detector = Detector::new(opts).context("invalid analysis options")?;
            detector
                .initialize(&models_dir)
                .with_context(|| format!("failed to load models from '{}'", models_dir.display()))?;

            let stdout = io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            let mut all_ok = true;
            for path in &audio {
                let resp = detector.predict_file(path);
                all_ok &= resp.is_success();
                if pretty {
                    serde_json::to_writer_pretty(&mut out, &resp)?;
                } else {
                    serde_json::to_writer(&mut out, &resp)?;
                }
                writeln!(out)?;
            }
            out.flush()?;
            Ok(all_ok)
        }

        Command::Status { models_dir } => {
            let detector = Detector::new(Opts::default())?;
            let loaded = detector.initialize(&models_dir);
            println!("{}", serde_json::to_string_pretty(&detector.status())?);
            Ok(loaded.is_ok())
        }

        Command::Synth {
            kind,
            seconds,
            seed,
            out,
        } => {
            let samples = match kind {
                VoiceKind::Natural => synth::natural_voice(seconds, seed),
                VoiceKind::Cloned => synth::cloned_voice(seconds, seed),
            };
            write_wav(&out, &samples, TARGET_SAMPLE_RATE)?;
            eprintln!("wrote {} ({seconds:.1}s)", out.display());
            Ok(true)
        }
    }
}
