//! tbe-bench CLI
//!
//! Verifies and times table-batched embedding kernels across launch
//! configurations, locally or as a remote job.

use std::ffi::OsString;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tbe_bench::remote::{CommandExecutor, JobExecutor, JobSpec, SlurmParameters, DEFAULT_JOB_FOLDER};
use tbe_bench::{run_benchmark, BenchConfig, BenchReport, HostBackend, Precision};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tbe-bench")]
#[command(author, version, about = "Table-batched embedding kernel benchmark")]
struct Cli {
    /// Number of embedding tables (T)
    #[arg(long, default_value_t = 64)]
    num_tables: usize,

    /// Rows per table (E)
    #[arg(long, default_value_t = 10_000)]
    num_embeddings: usize,

    /// Embedding dimension (D)
    #[arg(long, default_value_t = 32)]
    embedding_dim: usize,

    /// Batch size (B)
    #[arg(long, default_value_t = 128)]
    batch_size: usize,

    /// Indices per bag (L)
    #[arg(long, default_value_t = 32)]
    bag_size: usize,

    /// Timed iterations per configuration
    #[arg(long, default_value_t = 100)]
    iters: usize,

    /// Submit the run as a remote job and print its output
    #[arg(long)]
    remote: bool,

    /// fp16 weights
    #[arg(long)]
    fp16: bool,

    /// Prefer a smaller memory footprint for the weights
    #[arg(long)]
    managed: bool,

    /// Kernel backend
    #[arg(long, value_enum, default_value_t = BackendKind::Host)]
    backend: BackendKind,

    /// RNG seed for weights and indices
    #[arg(long)]
    seed: Option<u64>,

    /// Log filter (RUST_LOG takes precedence)
    #[arg(long, default_value = "debug")]
    log_level: String,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Full)]
    log_format: LogFormat,

    /// Folder for captured remote job output
    #[arg(long, default_value = DEFAULT_JOB_FOLDER)]
    remote_folder: String,

    /// How remote jobs are launched
    #[arg(long, value_enum, default_value_t = Launcher::Srun)]
    remote_launcher: Launcher,

    /// Remote job time limit in minutes
    #[arg(long, default_value_t = 10)]
    timeout_min: u32,

    /// Slurm partition
    #[arg(long, default_value = "dev")]
    partition: String,

    /// Slurm node constraint
    #[arg(long, default_value = "volta32gb")]
    constraint: String,

    /// GPUs per node
    #[arg(long, default_value_t = 1)]
    gpus_per_node: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// Reference kernels on the host
    Host,
    /// wgpu compute kernels
    Gpu,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Full,
    Compact,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Launcher {
    /// Slurm `srun`
    Srun,
    /// Child process on this machine
    Local,
}

impl Cli {
    fn bench_config(&self) -> BenchConfig {
        BenchConfig {
            batch_size: self.batch_size,
            num_tables: self.num_tables,
            num_embeddings: self.num_embeddings,
            bag_size: self.bag_size,
            embedding_dim: self.embedding_dim,
            iters: self.iters,
            precision: Precision::from_fp16_flag(self.fp16),
            managed: self.managed,
            seed: self.seed,
        }
    }

    fn slurm_parameters(&self) -> SlurmParameters {
        SlurmParameters {
            timeout_min: self.timeout_min,
            partition: self.partition.clone(),
            constraint: self.constraint.clone(),
            gpus_per_node: self.gpus_per_node,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(&cli.log_level, cli.log_format);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Setup logging; `RUST_LOG` overrides `level`
fn setup_logging(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Compact => subscriber.compact().init(),
        LogFormat::Full => subscriber.init(),
    }
}

fn run(cli: &Cli) -> Result<()> {
    if cli.remote {
        return run_remote(cli);
    }

    let config = cli.bench_config();
    let report = match cli.backend {
        BackendKind::Host => {
            let backend = match cli.seed {
                Some(seed) => HostBackend::with_seed(seed),
                None => HostBackend::new(),
            };
            run_benchmark(&backend, &config)?
        }
        BackendKind::Gpu => run_gpu(cli, &config)?,
    };
    info!(
        "{} configurations measured on the {} backend",
        report.measurements().count(),
        report.backend
    );
    Ok(())
}

#[cfg(feature = "gpu")]
fn run_gpu(cli: &Cli, config: &BenchConfig) -> Result<BenchReport> {
    use tbe_bench::backends::gpu::GpuBackend;

    let backend = match cli.seed {
        Some(seed) => GpuBackend::with_seed(cli.managed, seed)?,
        None => GpuBackend::new(cli.managed)?,
    };
    Ok(run_benchmark(&backend, config)?)
}

#[cfg(not(feature = "gpu"))]
fn run_gpu(_cli: &Cli, _config: &BenchConfig) -> Result<BenchReport> {
    anyhow::bail!("the gpu backend is not compiled in; rebuild with `--features gpu`")
}

/// Resubmit this executable without `--remote` and relay its output
fn run_remote(cli: &Cli) -> Result<()> {
    let program = std::env::current_exe().context("cannot locate the tbe-bench executable")?;
    let args = remote_args(std::env::args_os().skip(1));

    let params = cli.slurm_parameters();
    let executor = match cli.remote_launcher {
        Launcher::Srun => CommandExecutor::slurm(&cli.remote_folder, &params),
        Launcher::Local => CommandExecutor::local(&cli.remote_folder).with_timeout(params.timeout()),
    };

    let job = executor.submit(JobSpec::new(program, args))?;
    let output = job.wait()?;
    info!("Finished");
    print!("{}", output.stdout);
    eprint!("{}", output.stderr);
    Ok(())
}

/// Arguments of the remote run: everything but `--remote`
fn remote_args<I: IntoIterator<Item = OsString>>(args: I) -> Vec<OsString> {
    args.into_iter().filter(|arg| arg != "--remote").collect()
}
