//! `ddmgrid run`: fit a grid as coordinator or worker.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ddmgrid_core::{
    BatchConfig, CancelToken, ModelRunner, ProposalTuning, Role, RunnerConfig, format_report,
    run_batch,
};
use ddmgrid_sampler::MetropolisEngine;

use super::{GridArgs, load_grid};

pub struct RunCommandConfig<'a> {
    pub role: Option<&'a str>,
    pub grid: GridArgs<'a>,
    pub traces: &'a str,
    pub samples: usize,
    pub burn: usize,
    pub workers: Option<usize>,
    pub listen: Option<String>,
    pub connect: Option<String>,
    pub tuning: &'a str,
    pub seed: u64,
    pub resume: bool,
    pub timeout: Option<Duration>,
    pub output_path: Option<&'a str>,
}

/// Parse a per-model time limit in seconds (positive and finite).
pub fn parse_timeout(s: &str) -> Result<Duration, String> {
    let secs: f64 = s
        .trim()
        .parse()
        .map_err(|_| format!("'{s}' is not a number of seconds"))?;
    if secs <= 0.0 {
        return Err(format!("timeout must be positive, got {s}"));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid timeout '{s}': {e}"))
}

pub fn run(cfg: RunCommandConfig<'_>) {
    let role = match cfg.role {
        Some(r) => match r.parse::<Role>() {
            Ok(role) => role,
            Err(e) => {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        },
        None => Role::from_env(),
    };
    let tuning: ProposalTuning = match cfg.tuning.parse() {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    if cfg.burn >= cfg.samples {
        eprintln!(
            "Error: --burn ({}) must be smaller than --samples ({})",
            cfg.burn, cfg.samples
        );
        std::process::exit(1);
    }

    // Both roles build the same grid; workers check job names against it.
    let specs = load_grid(&cfg.grid);
    log::info!("{:?}: {} grid with {} models", role, cfg.grid.grid, specs.len());

    let runner = ModelRunner::new(
        Arc::new(MetropolisEngine::default()),
        RunnerConfig {
            trace_root: PathBuf::from(cfg.traces),
            tuning,
            seed: cfg.seed,
            timeout: cfg.timeout,
        },
    );

    let mut batch = BatchConfig {
        samples: cfg.samples,
        burn: cfg.burn,
        resume: cfg.resume,
        listen: cfg.listen,
        connect: cfg.connect,
        ..Default::default()
    };
    if let Some(w) = cfg.workers {
        batch.workers = w;
    }

    // Ctrl+C cancels every running model.
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nInterrupted, cancelling running models...");
        handler_token.cancel();
    }) {
        log::warn!("cannot install Ctrl+C handler: {e}");
    }

    let outcomes = match run_batch(role, &specs, &runner, &batch, &cancel) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    if role == Role::Worker {
        let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
        log::info!("worker finished: {} jobs, {failed} failed", outcomes.len());
        return;
    }

    print!("{}", format_report(&outcomes));

    if let Some(path) = cfg.output_path {
        let written = serde_json::to_string_pretty(&outcomes)
            .map_err(|e| e.to_string())
            .and_then(|json| std::fs::write(path, json).map_err(|e| e.to_string()));
        match written {
            Ok(()) => println!("Outcomes written to {path}"),
            Err(e) => {
                eprintln!("Error writing {path}: {e}");
                std::process::exit(1);
            }
        }
    }

    if outcomes.iter().any(|o| !o.is_ok()) {
        std::process::exit(2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_timeout("0.5").unwrap(), Duration::from_millis(500));
        for bad in ["-1", "0", "NaN", "inf", "1e400", "abc", ""] {
            assert!(parse_timeout(bad).is_err(), "{bad}");
        }
    }
}
