//! causal-lm CLI - evaluate, sample, and validate a causal language model

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use causal_lm::models::generate;
use causal_lm::{
    CausalLm, GenerationConfig, InputBatch, MetricAccumulator, ModelConfig, VERSION,
};

/// causal-lm - GPT-2 style language model evaluation in Rust
#[derive(Parser, Debug)]
#[command(name = "causal-lm")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use CPU instead of GPU
    #[arg(long, global = true)]
    cpu: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compute loss / accuracy / perplexity / bits-per-byte over a dataset
    Eval {
        /// JSONL file of pre-tokenized examples
        #[arg(short, long)]
        data: PathBuf,

        /// Path to model config file
        #[arg(short, long, default_value = "checkpoints/config.yaml")]
        config: PathBuf,

        /// Path to a safetensors checkpoint (random init when omitted)
        #[arg(short, long)]
        weights: Option<PathBuf>,

        /// Write results as JSON to this path
        #[arg(long)]
        json_out: Option<PathBuf>,

        /// Number of examples to evaluate (default: all)
        #[arg(long)]
        max_lines: Option<usize>,
    },

    /// Sample a continuation from a token-id prompt
    Generate {
        /// Prompt token ids, comma-separated
        #[arg(short, long)]
        prompt: String,

        /// Maximum number of new tokens
        #[arg(long, default_value = "32")]
        max_new_tokens: usize,

        /// Sampling temperature (0 = greedy)
        #[arg(long, default_value = "1.0")]
        temperature: f32,

        /// Top-k filtering (0 = disabled)
        #[arg(long, default_value = "0")]
        top_k: usize,

        /// Top-p nucleus filtering (1.0 = disabled)
        #[arg(long, default_value = "1.0")]
        top_p: f32,

        /// Stop token id
        #[arg(long)]
        eos: Option<u32>,

        /// Path to model config file
        #[arg(short, long, default_value = "checkpoints/config.yaml")]
        config: PathBuf,

        /// Path to a safetensors checkpoint (random init when omitted)
        #[arg(short, long)]
        weights: Option<PathBuf>,
    },

    /// Compare model outputs against golden reference data
    Validate {
        /// Directory of golden .npy files (input_ids, logits, ...)
        #[arg(short, long)]
        golden: PathBuf,

        /// Path to model config file
        #[arg(short, long, default_value = "checkpoints/config.yaml")]
        config: PathBuf,

        /// Path to a safetensors checkpoint
        #[arg(short, long)]
        weights: Option<PathBuf>,
    },

    /// Show model configuration and parameter statistics
    Info {
        /// Path to model config file
        #[arg(short, long, default_value = "checkpoints/config.yaml")]
        config: PathBuf,

        /// Path to a safetensors checkpoint (random init when omitted)
        #[arg(short, long)]
        weights: Option<PathBuf>,
    },
}

/// One pre-tokenized evaluation example
#[derive(Debug, Deserialize)]
struct EvalRecord {
    input_ids: Vec<i64>,
    /// Defaults to next-token labels derived from input_ids
    target_labels: Option<Vec<i64>>,
    /// Raw byte count of the original text, for bits-per-byte
    target_num_bytes: Option<i64>,
}

/// Aggregated evaluation results
#[derive(Debug, Serialize)]
struct EvalResults {
    examples: usize,
    live_targets: f32,
    loss: f32,
    accuracy: f32,
    perplexity: f32,
    bits_per_byte: Option<f32>,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

fn select_device(cpu: bool) -> Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    Device::cuda_if_available(0).map_err(Into::into)
}

fn load_model(config_path: &Path, weights: Option<&Path>, device: &Device) -> Result<CausalLm> {
    let config = ModelConfig::load(config_path)?;
    match weights {
        Some(path) => {
            let (decoder, report) =
                causal_lm::convert::load_gpt2_checkpoint(path, &config.decoder, device)?;
            if !report.unused.is_empty() {
                info!("{} checkpoint tensors unused", report.unused.len());
            }
            Ok(CausalLm::from_decoder(decoder))
        }
        None => {
            warn!("no checkpoint given, using random weights");
            CausalLm::new_random(&config, &causal_lm::Initializer::gpt2(), device)
        }
    }
}

/// Next-token labels: shift input ids left, pad the final position
fn shifted_labels(input_ids: &[i64], pad_token_id: i64) -> Vec<i64> {
    let mut labels: Vec<i64> = input_ids[1..].to_vec();
    labels.push(pad_token_id);
    labels
}

fn run_eval(
    model: &CausalLm,
    data: &Path,
    max_lines: Option<usize>,
    device: &Device,
) -> Result<EvalResults> {
    let file = std::fs::File::open(data)
        .with_context(|| format!("Failed to open eval data: {:?}", data))?;
    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .collect::<std::io::Result<_>>()?;
    let limit = max_lines.unwrap_or(lines.len()).min(lines.len());

    let pb = ProgressBar::new(limit as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40.green} {pos}/{len} {msg}")
            .unwrap(),
    );

    let mut accumulator = MetricAccumulator::new();
    let mut examples = 0usize;
    for line in lines.iter().take(limit) {
        if line.trim().is_empty() {
            continue;
        }
        let record: EvalRecord =
            serde_json::from_str(line).context("Failed to parse eval record")?;
        if record.input_ids.len() < 2 {
            warn!("skipping record with fewer than 2 tokens");
            continue;
        }
        let labels = record
            .target_labels
            .unwrap_or_else(|| shifted_labels(&record.input_ids, model.pad_token_id()));
        if labels.len() != record.input_ids.len() {
            bail!(
                "record has {} labels for {} tokens",
                labels.len(),
                record.input_ids.len()
            );
        }

        let seq_len = record.input_ids.len();
        let batch = InputBatch {
            input_ids: Tensor::from_slice(&record.input_ids, (1, seq_len), device)?,
            target_labels: Some(Tensor::from_slice(&labels, (1, seq_len), device)?),
            target_num_bytes: record
                .target_num_bytes
                .map(|n| Tensor::from_slice(&[n], (1,), device))
                .transpose()?,
        };
        let output = model.forward(&batch)?;
        accumulator.update(&output.summaries);
        examples += 1;
        pb.inc(1);
    }
    pb.finish_and_clear();

    let summaries = accumulator.summaries();
    let get = |name: &str| summaries.get(name).map(|s| s.mean).unwrap_or(0.0);
    Ok(EvalResults {
        examples,
        live_targets: summaries.get("loss").map(|s| s.weight).unwrap_or(0.0),
        loss: get("loss"),
        accuracy: get("accuracy"),
        perplexity: get("perplexity"),
        bits_per_byte: summaries.get("bits_per_byte").map(|s| s.mean),
    })
}

fn run_validate(model: &CausalLm, golden: &Path, device: &Device) -> Result<()> {
    use causal_lm::debug::{read_npy_i64, ReferenceChecker};

    let (ids, shape) = read_npy_i64(golden.join("input_ids.npy"))
        .context("golden dir needs an input_ids.npy")?;
    if shape.len() != 2 {
        bail!("input_ids.npy must be 2-D, got shape {:?}", shape);
    }
    let input_ids = Tensor::from_slice(&ids, (shape[0], shape[1]), device)?;
    let logits = model.predict(&input_ids)?;

    let mut checker = ReferenceChecker::new(golden);
    checker.check_tensor("logits", &logits)?;

    let labels_path = golden.join("target_labels.npy");
    if labels_path.exists() {
        let (labels, lshape) = read_npy_i64(&labels_path)?;
        if lshape.len() != 2 {
            bail!("target_labels.npy must be 2-D, got shape {:?}", lshape);
        }
        let target_labels = Tensor::from_slice(&labels, (lshape[0], lshape[1]), device)?;
        let metrics = model.metrics(&logits, &target_labels, None)?;
        checker.check_scalar("loss", metrics.loss)?;
        checker.check_scalar("accuracy", metrics.summaries["accuracy"].mean)?;
        checker.check_scalar("perplexity", metrics.summaries["perplexity"].mean)?;
    }

    if !checker.log_summary() {
        bail!("golden validation failed");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    info!("causal-lm v{}", VERSION);
    let device = select_device(cli.cpu)?;

    match cli.command {
        Commands::Eval {
            data,
            config,
            weights,
            json_out,
            max_lines,
        } => {
            let model = load_model(&config, weights.as_deref(), &device)?;
            model.check_numerics()?;
            let results = run_eval(&model, &data, max_lines, &device)?;

            info!(
                "examples={} live_targets={}",
                results.examples, results.live_targets
            );
            info!(
                "loss={:.4} accuracy={:.4} perplexity={:.4}",
                results.loss, results.accuracy, results.perplexity
            );
            if let Some(bpb) = results.bits_per_byte {
                info!("bits_per_byte={:.4}", bpb);
            }
            if let Some(path) = json_out {
                std::fs::write(&path, serde_json::to_string_pretty(&results)?)
                    .with_context(|| format!("Failed to write results: {:?}", path))?;
                info!("results written to {:?}", path);
            }
            Ok(())
        }

        Commands::Generate {
            prompt,
            max_new_tokens,
            temperature,
            top_k,
            top_p,
            eos,
            config,
            weights,
        } => {
            let tokens: Vec<u32> = prompt
                .split(',')
                .map(|t| t.trim().parse::<u32>().context("bad prompt token id"))
                .collect::<Result<_>>()?;
            let model = load_model(&config, weights.as_deref(), &device)?;
            let gen_config = GenerationConfig {
                max_new_tokens,
                temperature,
                top_k,
                top_p,
                eos_token: eos,
            };
            let generated = generate(model.decoder(), &tokens, &gen_config)?;
            info!("generated {} tokens", generated.len());
            println!(
                "{}",
                generated
                    .iter()
                    .map(|t| t.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            );
            Ok(())
        }

        Commands::Validate {
            golden,
            config,
            weights,
        } => {
            let model = load_model(&config, weights.as_deref(), &device)?;
            run_validate(&model, &golden, &device)
        }

        Commands::Info { config, weights } => {
            let model_config = ModelConfig::load(&config)?;
            println!("{:#?}", model_config);

            let model = load_model(&config, weights.as_deref(), &device)?;
            let mut total = 0usize;
            for (name, tensor) in model.decoder().named_parameters() {
                let stats = causal_lm::debug::tensor_stats(&tensor)?;
                total += stats.count;
                println!("{name}: {}", stats.summary());
            }
            println!("total parameters: {total}");
            Ok(())
        }
    }
}
