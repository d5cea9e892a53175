mod heat;
mod timing;

use clap::{crate_name, crate_version, Args, Parser, Subcommand};
use itertools::Itertools;
use jobfarm::{
    job_fn, BincodeCodec, ChannelTransport, Farm, FarmConfig, FarmError, RunReport,
};
use serde::{Deserialize, Serialize};
use std::{
    path::PathBuf,
    process::exit,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tracing_unwrap::ResultExt;

// exit codes for scripting around the demo
const EXIT_CONFIG: i32 = 1;
const EXIT_TRANSPORT: i32 = 2;
const EXIT_SERIALIZATION: i32 = 3;
const EXIT_DEADLINE: i32 = 4;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct CLI {
    #[arg(
        short = 'c',
        long = "config",
        value_name = "CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to the config file",
        default_value = "farm.yml",
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
enum Commands {
    /// Farm a toy workload across a simulated cluster
    Farm(FarmArgs),
    /// Measure message round-trip time between two ranks
    Timing(TimingArgs),
    /// Relax a 1D heat rod with halo exchanges and collectives
    Heat(HeatArgs),
}

#[derive(Clone, Debug, Args)]
pub struct FarmArgs {
    #[arg(short = 'r', long = "ranks", help = "override the configured rank count")]
    ranks: Option<usize>,
    #[arg(short = 'n', long = "items", help = "override the configured item count")]
    items: Option<u64>,
}

#[derive(Clone, Debug, Args)]
pub struct TimingArgs {
    #[arg(long = "rounds", default_value = "1000", help = "ping-pong rounds")]
    rounds: usize,
    #[arg(long = "floats", default_value = "1", help = "payload size in floats")]
    floats: usize,
}

#[derive(Clone, Debug, Args)]
pub struct HeatArgs {
    #[arg(short = 'r', long = "ranks", default_value = "4")]
    ranks: usize,
    #[arg(long = "cells", default_value = "64", help = "rod cells per rank")]
    cells: usize,
    #[arg(long = "steps", default_value = "500")]
    steps: usize,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
struct DemoConfig {
    #[serde(default = "default_ranks")]
    ranks: usize,
    #[serde(default = "default_items")]
    items: u64,
    #[serde(default)]
    time_limit_seconds: Option<u64>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            ranks: default_ranks(),
            items: default_items(),
            time_limit_seconds: None,
        }
    }
}

fn default_ranks() -> usize {
    4
}

fn default_items() -> u64 {
    64
}

impl DemoConfig {
    /// read the config file, falling back to defaults when it does not exist
    fn load(path: &PathBuf) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = ?path, error = %e, "no config file, using defaults");
                return Self::default();
            }
        };

        match serde_yaml::from_str(&raw) {
            Ok(config) => config,
            Err(e) => {
                error!(path = ?path, "Failed to parse config: {e}");
                exit(EXIT_SERIALIZATION)
            }
        }
    }

    fn preflight_checks(&self) -> bool {
        let mut contains_error = false;

        if self.ranks == 0 {
            error!("ranks cannot be 0, a farm needs at least a controller");
            contains_error = true;
        }

        contains_error
    }
}

fn setup_global_subscriber() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new("info"))
                .unwrap(),
        )
        .with(
            fmt::layer()
                // one thread per simulated rank, ids make the interleave readable
                .with_thread_ids(true)
                .with_thread_names(true)
                .compact(),
        )
        .init()
}

fn main() {
    setup_global_subscriber();
    info!("{} {}", crate_name!(), crate_version!());

    let args = CLI::parse();
    debug!("Args: {args:?}");

    match args.command {
        Commands::Farm(sub_args) => {
            let mut config = DemoConfig::load(&args.config);
            if let Some(ranks) = sub_args.ranks {
                config.ranks = ranks;
            }
            if let Some(items) = sub_args.items {
                config.items = items;
            }

            if config.preflight_checks() {
                error!("Config contains one or more errors, see previous error messages");
                exit(EXIT_CONFIG);
            }

            run_farm(&config)
        }
        Commands::Timing(sub_args) => timing::run(&sub_args),
        Commands::Heat(sub_args) => heat::run(&sub_args),
    }
}

fn collatz_steps(mut n: u64) -> u64 {
    let mut steps = 0;
    while n > 1 {
        n = if n % 2 == 0 { n / 2 } else { 3 * n + 1 };
        steps += 1;
    }
    steps
}

fn run_farm(config: &DemoConfig) {
    info!(
        ranks = config.ranks,
        items = config.items,
        "farming collatz step counts"
    );

    let mut farm_config = FarmConfig::builder().controller_rank(0);
    if let Some(seconds) = config.time_limit_seconds {
        farm_config = farm_config.time_limit(Duration::from_secs(seconds));
    }
    let farm_config = farm_config.build();

    let results = Arc::new(Mutex::new(Vec::new()));
    let failures = Arc::new(Mutex::new(Vec::new()));
    let items = config.items;

    let mut controller_handle = None;
    let mut worker_handles = Vec::new();
    for (rank, endpoint) in ChannelTransport::cluster(config.ranks)
        .into_iter()
        .enumerate()
    {
        let farm = Farm::new(
            endpoint,
            farm_config.clone(),
            BincodeCodec,
            job_fn(|n: u64| Ok(collatz_steps(n))),
        );

        if rank == 0 {
            let results = results.clone();
            let failures = failures.clone();
            let farm = farm
                .source(1..=items)
                .on_result(move |result| {
                    if let Some(steps) = result {
                        results.lock().unwrap_or_log().push(steps);
                    }
                })
                .on_error(move |e| failures.lock().unwrap_or_log().push(e));
            controller_handle = Some(
                thread::Builder::new()
                    .name(format!("rank-{rank}"))
                    .spawn(move || farm.run())
                    .unwrap_or_log(),
            );
        } else {
            worker_handles.push(
                thread::Builder::new()
                    .name(format!("rank-{rank}"))
                    .spawn(move || farm.run())
                    .unwrap_or_log(),
            );
        }
    }

    let report = match controller_handle
        .expect("controller thread was spawned")
        .join()
        .expect("controller thread did not panic")
    {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "Farm run failed: {e}");
            exit(exit_code_for(&e))
        }
    };

    for handle in worker_handles {
        if let Err(e) = handle.join().expect("worker thread did not panic") {
            error!(error = %e, "Worker rank failed: {e}");
            exit(exit_code_for(&e))
        }
    }

    report_farm(&report, &results.lock().unwrap_or_log(), failures.lock().unwrap_or_log().len());

    if report.deadline_hit && report.dispatched == 0 {
        exit(EXIT_DEADLINE)
    }
}

fn report_farm(report: &RunReport, results: &[u64], failures: usize) {
    info!(
        dispatched = report.dispatched,
        collected = report.collected,
        failures,
        deadline_hit = report.deadline_hit,
        "farm finished"
    );
    info!(
        "first step counts: {}",
        results.iter().take(8).join(", ")
    );
}

fn exit_code_for(error: &FarmError) -> i32 {
    match error {
        FarmError::Transport(_) | FarmError::Frame(_) => EXIT_TRANSPORT,
        _ => EXIT_CONFIG,
    }
}
