#!/usr/bin/env -S cargo +nightly -Zscript
---cargo
[package]
edition = "2024"

[dependencies]
anyhow = "1"
clap = { version = "4.5", features = ["derive"] }
---

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result, bail};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(about = "Run one workload against several runners serially")]
struct Args {
    #[arg(long)]
    workload: PathBuf,

    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// Runner names, in order.
    #[arg(long, value_delimiter = ',', default_value = "mockrun")]
    runners: Vec<String>,

    #[arg(long, default_value_t = true)]
    release: bool,

    #[arg(long)]
    force: bool,

    /// Measure throughput again instead of reusing earlier results.
    #[arg(long)]
    throughput: bool,

    /// Keep going after a runner fails.
    #[arg(long)]
    keep_going: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut failed = Vec::new();
    for runner in &args.runners {
        if let Err(err) = run_one(runner, &args) {
            if !args.keep_going {
                return Err(err);
            }
            eprintln!("[runner-suite] {err:#}");
            failed.push(runner.as_str());
        }
    }

    if !failed.is_empty() {
        bail!("runners failed: {}", failed.join(", "));
    }
    println!("[runner-suite] done");
    Ok(())
}

fn run_one(runner: &str, args: &Args) -> Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.args(["run", "--bin", "pipebench"]);
    if args.release {
        cmd.arg("--release");
    }
    cmd.arg("--")
        .arg("measure")
        .arg("--workspace")
        .arg(&args.workspace)
        .arg("--workload")
        .arg(&args.workload)
        .args(["--runner", runner]);
    if args.force {
        cmd.arg("--force");
    }
    if args.throughput {
        cmd.arg("--throughput");
    }

    println!("[runner-suite] start runner={runner}");
    let status = cmd
        .status()
        .with_context(|| format!("spawn pipebench measure ({runner})"))?;
    if !status.success() {
        bail!("pipebench measure failed for runner={runner} (status={status})");
    }
    println!("[runner-suite] done  runner={runner}");
    Ok(())
}
