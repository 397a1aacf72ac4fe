//! CLI for ddmgrid: build, dispatch and fit hierarchical DDM grids.

mod commands;

use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ddmgrid")]
#[command(about = "ddmgrid: hierarchical drift-diffusion model grids")]
#[command(version = ddmgrid_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a model grid. Rank 0 (or --role coordinator) hands out the grid;
    /// every other rank works on it.
    Run {
        /// Role: coordinator or worker. Defaults to the rank found in
        /// DDMGRID_RANK, OMPI_COMM_WORLD_RANK or PMI_RANK.
        #[arg(long, value_parser = ["coordinator", "worker"])]
        role: Option<String>,

        /// Directory holding the dataset files
        #[arg(long, default_value = "data")]
        data: String,

        /// Directory receiving one trace directory per model
        #[arg(long, default_value = "traces")]
        traces: String,

        /// Which grid to fit
        #[arg(long, default_value = "combined", value_parser = ["combined", "nodbs", "rooted", "correlation", "pd"])]
        grid: String,

        /// Include the variability-parameter models in the nodbs and rooted grids
        #[arg(long)]
        full: bool,

        /// Total iterations per model, burn-in included
        #[arg(long, default_value = "10000")]
        samples: usize,

        /// Iterations discarded as burn-in
        #[arg(long, default_value = "5000")]
        burn: usize,

        /// Local worker threads (coordinator without --listen)
        #[arg(long)]
        workers: Option<usize>,

        /// Serve the grid to remote workers on this address
        #[arg(long)]
        listen: Option<String>,

        /// Coordinator address (worker role)
        #[arg(long)]
        connect: Option<String>,

        /// Proposal tuning: off, fixed (per-family steps), adaptive (joint effect blocks)
        #[arg(long, default_value = "off", value_parser = ["off", "fixed", "adaptive"])]
        tuning: String,

        /// Base random seed
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Continue from existing traces instead of starting over
        #[arg(long)]
        resume: bool,

        /// Per-model wall-clock limit in seconds
        #[arg(long, value_parser = commands::run::parse_timeout)]
        timeout_sec: Option<Duration>,

        /// Write all outcomes as JSON
        #[arg(long)]
        output: Option<String>,
    },

    /// List the models of a grid in dispatch order
    Grid {
        #[arg(long, default_value = "data")]
        data: String,

        #[arg(long, default_value = "combined", value_parser = ["combined", "nodbs", "rooted", "correlation", "pd"])]
        grid: String,

        #[arg(long)]
        full: bool,

        /// Print spec summaries as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the node graph of one model
    Expand {
        /// Model name or grid index
        model: String,

        #[arg(long, default_value = "data")]
        data: String,

        #[arg(long, default_value = "combined", value_parser = ["combined", "nodbs", "rooted", "correlation", "pd"])]
        grid: String,

        #[arg(long)]
        full: bool,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            role,
            data,
            traces,
            grid,
            full,
            samples,
            burn,
            workers,
            listen,
            connect,
            tuning,
            seed,
            resume,
            timeout_sec,
            output,
        } => commands::run::run(commands::run::RunCommandConfig {
            role: role.as_deref(),
            grid: commands::GridArgs {
                data: &data,
                grid: &grid,
                full,
            },
            traces: &traces,
            samples,
            burn,
            workers,
            listen,
            connect,
            tuning: &tuning,
            seed,
            resume,
            timeout: timeout_sec,
            output_path: output.as_deref(),
        }),
        Commands::Grid {
            data,
            grid,
            full,
            json,
        } => commands::grid::run(
            &commands::GridArgs {
                data: &data,
                grid: &grid,
                full,
            },
            json,
        ),
        Commands::Expand {
            model,
            data,
            grid,
            full,
        } => commands::expand::run(
            &model,
            &commands::GridArgs {
                data: &data,
                grid: &grid,
                full,
            },
        ),
    }
}
