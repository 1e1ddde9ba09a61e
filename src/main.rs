use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use pipebench::{BenchSession, MeasureOptions, TaskRegistry};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(about = "Measure throughput and stream density of media analytics pipelines")]
struct Args {
    /// Repeat for more output (-v info, -vv debug and runner output on the console).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the measurements a workload configures.
    Measure(MeasureArgs),
    /// Print the task names a workload may use.
    ListTasks,
}

#[derive(Debug, clap::Args)]
struct MeasureArgs {
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// Workload file (.toml or .json).
    #[arg(long)]
    workload: Option<PathBuf>,

    /// Pipeline directory name, used when no workload file is given.
    #[arg(long, requires = "task", conflicts_with = "workload")]
    pipeline: Option<String>,

    #[arg(long, requires = "pipeline")]
    task: Option<String>,

    #[arg(long, default_value = "mockrun")]
    runner: String,

    /// Measure throughput again instead of reusing a previous result.
    #[arg(long)]
    throughput: bool,

    /// Add a density search to a pipeline/task workload.
    #[arg(long)]
    density: bool,

    /// Remove previous results for this runner and workload first.
    #[arg(long)]
    force: bool,

    /// Runner setting override, repeatable.
    #[arg(long = "override", num_args = 2, value_names = ["KEY", "VALUE"])]
    overrides: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::ListTasks => {
            for name in TaskRegistry::with_defaults().names() {
                println!("{name}");
            }
            Ok(())
        }
        Command::Measure(measure) => run_measure(measure, args.verbose),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_measure(args: MeasureArgs, verbose: u8) -> Result<()> {
    if args.workload.is_none() && args.pipeline.is_none() {
        bail!("pass --workload or --pipeline with --task");
    }
    let overrides = args
        .overrides
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect::<Vec<_>>();
    let workspace = args
        .workspace
        .canonicalize()
        .with_context(|| format!("resolve workspace {}", args.workspace.display()))?;

    let options = MeasureOptions {
        workspace,
        workload: args.workload,
        pipeline: args.pipeline,
        task: args.task,
        runner: args.runner,
        throughput: args.throughput,
        density: args.density,
        force: args.force,
        overrides,
        verbose,
        command_line: std::env::args().collect(),
    };
    let session = BenchSession::open(options, &TaskRegistry::with_defaults())
        .context("open benchmark session")?;
    let summary = session.measure().context("measure")?;

    for table in &summary.tables {
        println!("{table}");
    }
    println!("saved results: {}", summary.target_dir.display());
    Ok(())
}
