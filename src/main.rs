use factorevo::param::{self, Param};
use flexi_logger::{FileSpec, Logger};
use log::{error, info};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::env;
use std::error::Error;
use std::fs;
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

fn build_logger(param: &Param) -> Result<(), Box<dyn Error>> {
    let logger = Logger::try_with_env_or_str(&param.general.log_level)?;
    if param.general.log_base.is_empty() {
        logger.start()?;
    } else {
        logger
            .log_to_file(
                FileSpec::default()
                    .basename(param.general.log_base.as_str())
                    .suffix(param.general.log_suffix.as_str()),
            )
            .start()?;
    }
    Ok(())
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let param_file = args
        .get(1)
        .cloned()
        .unwrap_or_else(|| "param.yaml".to_string());

    let param = match param::get(param_file.clone()) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Unusable parameter file {}: {}", param_file, e);
            exit(1);
        }
    };

    if let Err(e) = build_logger(&param) {
        eprintln!("Cannot set up logging: {}", e);
        exit(1);
    }
    info!("Parameters loaded from {}", param_file);

    // SIGINT/SIGTERM flip the flag; the engine checks it between generations
    // and returns the best-so-far instead of dying mid-run
    let running = Arc::new(AtomicBool::new(true));
    match Signals::new([SIGINT, SIGTERM]) {
        Ok(mut signals) => {
            let flag = Arc::clone(&running);
            thread::spawn(move || {
                if signals.forever().next().is_some() {
                    flag.store(false, Ordering::Relaxed);
                }
            });
        }
        Err(e) => error!("Signal handler not installed: {}", e),
    }

    let report = match factorevo::run(&param, running) {
        Ok(report) => report,
        Err(e) => {
            error!("Evolution failed: {}", e);
            exit(1);
        }
    };

    println!(
        "Run {} finished in {:.2}s ({:?}), {} evaluations over {} generations",
        report.id,
        report.execution_time,
        report.stop_reason,
        report.stats.evaluations,
        report.stats.generation
    );
    println!("Top factors:");
    for (pos, individual) in report.top.iter().enumerate() {
        println!(
            "#{:<3} {}  fitness={:.4} IC={:.4} IR={:.4} Sharpe={:.4} [gen {}]",
            pos + 1,
            individual.expression,
            individual.fitness,
            individual.ic,
            individual.ir,
            individual.sharpe,
            individual.generation
        );
    }

    if !param.general.save_report.is_empty() {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => {
                if let Err(e) = fs::write(&param.general.save_report, json) {
                    error!("Cannot write report {}: {}", param.general.save_report, e);
                } else {
                    info!("Report saved to {}", param.general.save_report);
                }
            }
            Err(e) => error!("Cannot serialize report: {}", e),
        }
    }
}
