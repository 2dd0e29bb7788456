use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rotary_core::backend::BACKEND_ENV;
use rotary_core::{
    Backend, BackendKind, DType, Result, RopeConfig, RopeError, RotaryEmbedding, RotaryStyle, Shape,
    Tensor,
};
use rotary_parity::{RotaryCase, gen_data, gen_positions, max_abs_diff};

#[derive(Parser)]
#[command(name = "rotary-cli")]
#[command(about = "Rotary positional embedding driver")]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Rotate random query/key tensors and print a checksum.
    Run {
        #[command(flatten)]
        problem: Problem,
        /// Backend to run on; defaults to the config file's, then
        /// `ROTARY_BACKEND`, then generic.
        #[arg(long)]
        backend: Option<BackendKind>,
        /// JSON rotary config; overrides head size, rot dim, style and dtype.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run both backends on the same case and report the largest difference.
    Parity {
        #[command(flatten)]
        problem: Problem,
    },
}

#[derive(ClapArgs, Clone, Debug)]
struct Problem {
    #[arg(long, default_value_t = 512)]
    tokens: usize,
    #[arg(long, default_value_t = 32)]
    heads: usize,
    /// Defaults to `--heads`.
    #[arg(long)]
    kv_heads: Option<usize>,
    #[arg(long, default_value_t = 128)]
    head_size: usize,
    /// Defaults to `--head-size`.
    #[arg(long)]
    rot_dim: Option<usize>,
    #[arg(long, default_value_t = 4096)]
    max_position: usize,
    /// GPT-J style adjacent pairs instead of GPT-NeoX halves.
    #[arg(long)]
    interleaved: bool,
    #[arg(long, default_value = "f32")]
    dtype: DType,
    #[arg(long, default_value_t = 7)]
    seed: u64,
}

impl Problem {
    fn config(&self) -> RopeConfig {
        let mut config = RopeConfig::new(self.head_size, self.max_position);
        config.rotary_dim = self.rot_dim;
        config.is_neox_style = !self.interleaved;
        config.dtype = self.dtype;
        config
    }

    fn case(&self) -> RotaryCase {
        let style = if self.interleaved {
            RotaryStyle::Interleaved
        } else {
            RotaryStyle::Neox
        };
        let mut case = RotaryCase::new(self.tokens, self.heads, self.head_size)
            .kv_heads(self.kv_heads.unwrap_or(self.heads))
            .rot_dim(self.rot_dim.unwrap_or(self.head_size))
            .style(style)
            .dtype(self.dtype)
            .seed(self.seed);
        case.max_position = self.max_position;
        case
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let result = match args.cmd {
        Cmd::Run {
            problem,
            backend,
            config,
        } => run(&problem, backend, config),
        Cmd::Parity { problem } => parity(&problem),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn make_backend(kind: BackendKind) -> Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match kind {
        BackendKind::GenericParallel => rotary_cpu::parallel_backend()?,
        BackendKind::VendorQueue => rotary_queue::queue_backend()?,
    };
    Ok(backend)
}

fn run(problem: &Problem, backend: Option<BackendKind>, config_path: Option<PathBuf>) -> Result<()> {
    let config = match config_path {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| RopeError::Config(format!("{}: {e}", path.display())))?;
            RopeConfig::from_json_str(&text)?
        }
        None => problem.config(),
    };
    let layer = RotaryEmbedding::new(&config)?;
    let kind = config.backend_kind(backend, std::env::var(BACKEND_ENV).ok().as_deref());
    let backend = make_backend(kind)?;
    info!(backend = backend.name(), lanes = backend.lane_count(), "running rotary_embedding");

    let kv_heads = problem.kv_heads.unwrap_or(problem.heads);
    let tokens = problem.tokens as i64;
    let q_width = problem.heads * config.head_size;
    let k_width = kv_heads * config.head_size;
    let query = Tensor::from_f32_as(
        &gen_data(problem.tokens * q_width, problem.seed),
        &Shape::new([tokens, q_width as i64]),
        config.dtype,
    )?;
    let key = Tensor::from_f32_as(
        &gen_data(problem.tokens * k_width, problem.seed.wrapping_add(1)),
        &Shape::new([tokens, k_width as i64]),
        config.dtype,
    )?;
    let positions = Tensor::from_vec(
        gen_positions(problem.tokens, layer.max_position(), problem.seed),
        &Shape::new([tokens]),
    )?;

    let start = Instant::now();
    layer.forward(backend.as_ref(), &positions, &query, &key)?.wait()?;
    let elapsed = start.elapsed();

    let checksum: f64 = query
        .to_vec_f32()?
        .iter()
        .chain(key.to_vec_f32()?.iter())
        .map(|&x| f64::from(x))
        .sum();
    println!(
        "backend={} style={} dtype={} tokens={} heads={}/{} head_size={} rot_dim={}",
        backend.name(),
        layer.style(),
        config.dtype,
        problem.tokens,
        problem.heads,
        kv_heads,
        layer.head_size(),
        layer.rot_dim(),
    );
    println!("checksum={checksum:.6} elapsed={elapsed:?}");
    Ok(())
}

fn parity(problem: &Problem) -> Result<()> {
    let case = problem.case();
    let mut outputs = Vec::new();
    for kind in [BackendKind::GenericParallel, BackendKind::VendorQueue] {
        let backend = make_backend(kind)?;
        let start = Instant::now();
        let (q, k) = case.run_on(backend.as_ref())?;
        println!("{:<28} elapsed={:?}", backend.name(), start.elapsed());
        outputs.push((q, k));
    }
    let (q0, k0) = &outputs[0];
    let (q1, k1) = &outputs[1];
    let diff = max_abs_diff(q0, q1).max(max_abs_diff(k0, k1));
    println!("max_abs_diff={diff:e}");
    Ok(())
}
