//! Infersim CLI - drive the fleet simulator from the command line.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use infersim_core::workload::{read_trace_file, DEFAULT_MAX_TOKEN_ID};
use infersim_core::{
    BatchConfig, BlackboxCoefficients, BlackboxModel, GaussianWorkload, GaussianWorkloadConfig,
    HardwareCalibration, KvConfig, LatencyModel, ModelArchitecture, PartitionedRng, PolicyBundle,
    RooflineModel, SimConfig, Simulator,
};

mod report;

#[derive(Debug, Parser)]
#[command(name = "infersim", about = "Discrete-event LLM inference fleet simulator")]
struct Args {
    /// Master seed; every subsystem derives its own substream from it.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Simulation horizon in microseconds.
    #[arg(long, default_value_t = 60_000_000)]
    horizon: u64,

    /// Number of instances in the fleet.
    #[arg(long, default_value_t = 1)]
    num_instances: usize,

    /// Arrival rate, requests per second (synthetic workload).
    #[arg(long, default_value_t = 4.0)]
    rate: f64,

    /// Stop generating after this many prompts (0 = horizon-bounded).
    #[arg(long, default_value_t = 0)]
    max_prompts: usize,

    #[arg(long, default_value_t = 512.0)]
    prompt_len_mean: f64,

    #[arg(long, default_value_t = 128.0)]
    prompt_len_std: f64,

    #[arg(long, default_value_t = 128.0)]
    output_len_mean: f64,

    #[arg(long, default_value_t = 32.0)]
    output_len_std: f64,

    /// Shared random prompt prefix length, in tokens.
    #[arg(long, default_value_t = 0)]
    shared_prefix_len: usize,

    /// Upper bound (exclusive) on generated token ids.
    #[arg(long, default_value_t = DEFAULT_MAX_TOKEN_ID)]
    max_token_id: u32,

    /// CSV trace to replay instead of the synthetic workload.
    #[arg(long)]
    trace: Option<PathBuf>,

    /// Policy bundle YAML.
    #[arg(long)]
    policy_bundle: Option<PathBuf>,

    /// Blackbox α/β coefficient JSON.
    #[arg(long)]
    coefficients: Option<PathBuf>,

    /// Roofline model-architecture JSON (requires --hardware).
    #[arg(long)]
    model: Option<PathBuf>,

    /// Roofline hardware-calibration JSON (requires --model).
    #[arg(long)]
    hardware: Option<PathBuf>,

    /// Tensor-parallel degree for the roofline model.
    #[arg(long, default_value_t = 1)]
    tp: usize,

    /// KV blocks per instance.
    #[arg(long, default_value_t = 1000)]
    total_kv_blocks: usize,

    /// Tokens per KV block.
    #[arg(long, default_value_t = 16)]
    block_size: usize,

    #[arg(long, default_value_t = 256)]
    max_num_running_reqs: usize,

    #[arg(long, default_value_t = 8192)]
    max_num_scheduled_tokens: usize,

    /// Per-instance prefix-index capacity, in blocks.
    #[arg(long, default_value_t = 4096)]
    prefix_index_capacity: usize,

    /// Include per-request records in the report.
    #[arg(long, default_value_t = false)]
    per_request: bool,

    /// Write the JSON report here instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "infersim=info,infersim_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let bundle = match &args.policy_bundle {
        Some(path) => PolicyBundle::from_path(path)
            .with_context(|| format!("loading policy bundle {}", path.display()))?,
        None => PolicyBundle::default(),
    };

    let latency = build_latency_model(&args)?;

    let config = SimConfig {
        seed: args.seed,
        horizon: args.horizon,
        num_instances: args.num_instances,
        kv: KvConfig {
            total_blocks: args.total_kv_blocks,
            block_size: args.block_size,
        },
        batch: BatchConfig {
            max_running_reqs: args.max_num_running_reqs,
            max_scheduled_tokens: args.max_num_scheduled_tokens,
        },
        prefix_index_capacity: args.prefix_index_capacity,
    };

    let requests = load_workload(&args, &config)?;
    info!(requests = requests.len(), "workload ready");

    let mut sim = Simulator::from_config(&config, &bundle, latency)?;
    sim.inject(requests);
    let report = sim.run();

    let run_report = report::summarize(report, args.per_request);
    let json = serde_json::to_string_pretty(&run_report)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("writing report to {}", path.display()))?;
            info!(path = %path.display(), "report written");
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn build_latency_model(args: &Args) -> anyhow::Result<Arc<dyn LatencyModel>> {
    match (&args.model, &args.hardware) {
        (Some(model_path), Some(hardware_path)) => {
            let model: ModelArchitecture = read_json(model_path)?;
            let hardware: HardwareCalibration = read_json(hardware_path)?;
            Ok(Arc::new(RooflineModel::new(hardware, model, args.tp)?))
        }
        (None, None) => {
            let coefficients = match &args.coefficients {
                Some(path) => read_json(path)?,
                None => BlackboxCoefficients {
                    alpha: vec![100.0, 1.0, 100.0],
                    beta: vec![1000.0, 10.0, 5.0],
                },
            };
            Ok(Arc::new(BlackboxModel::new(&coefficients)?))
        }
        _ => bail!("--model and --hardware must be provided together"),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> anyhow::Result<T> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn load_workload(
    args: &Args,
    config: &SimConfig,
) -> anyhow::Result<Vec<infersim_core::Request>> {
    if let Some(trace_path) = &args.trace {
        let ingest = read_trace_file(trace_path, config.horizon, args.max_token_id);
        if let Some(error) = ingest.error {
            // A bad row stops ingestion; the parsed prefix still runs.
            warn!(%error, rows = ingest.requests.len(), "trace truncated");
        }
        return Ok(ingest.requests);
    }
    let rng = PartitionedRng::new(config.seed);
    let mut workload = GaussianWorkload::new(
        GaussianWorkloadConfig {
            rate_per_sec: args.rate,
            max_prompts: args.max_prompts,
            prompt_len_mean: args.prompt_len_mean,
            prompt_len_std: args.prompt_len_std,
            output_len_mean: args.output_len_mean,
            output_len_std: args.output_len_std,
            shared_prefix_len: args.shared_prefix_len,
            max_token_id: args.max_token_id,
        },
        rng.substream("workload"),
    );
    Ok(workload.generate(config.horizon))
}
