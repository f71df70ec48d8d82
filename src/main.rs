// ============================================================================
// CHAR-LSTM - command line front end
// Usage: char-lstm [--key=value ...]   (see `Config` for the keys)
// ============================================================================

use std::fs;
use std::io::{self, BufRead};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use char_lstm::config::{Mode, Precision};
use char_lstm::trainer::{sentences_from_text, Report, Session};
use char_lstm::{Config, Element, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Sets `cancel` when `q` or `stop` is typed on stdin. Training then
/// finishes its current tick and writes the final checkpoint.
fn watch_stdin(cancel: Arc<AtomicBool>) {
    thread::spawn(move || {
        for line in io::stdin().lock().lines().map_while(|l| l.ok()) {
            if matches!(line.trim(), "q" | "stop") {
                info!("stop requested");
                cancel.store(true, Ordering::Relaxed);
                break;
            }
        }
    });
}

fn corpus(config: &Config) -> String {
    if !config.training_file.is_empty() {
        match fs::read_to_string(&config.training_file) {
            Ok(content) => {
                info!(file = %config.training_file, chars = content.chars().count(), "loaded training text");
                return content;
            }
            Err(e) => warn!(file = %config.training_file, error = %e, "cannot read training file, using training text"),
        }
    }
    config.training_text.clone()
}

fn print_samples(report: &Report) {
    println!("{}", "-".repeat(70));
    for s in &report.samples {
        println!("{s}");
    }
    println!("{}", "-".repeat(70));
}

fn run<E: Element>(config: &Config) -> Result<()> {
    let sentences = sentences_from_text(&corpus(config));
    let mut session = Session::<E>::open(config.clone(), sentences)?;
    match config.mode {
        Mode::Train => {
            let cancel = Arc::new(AtomicBool::new(false));
            watch_stdin(Arc::clone(&cancel));
            let done = session.run(&cancel, print_samples)?;
            info!(ticks = done, total = session.ticks(), epoch = session.epoch(), "training finished");
        }
        Mode::Sample => {
            let cfg = config.sampling();
            for _ in 0..config.samples.max(1) {
                let text = if config.prime.is_empty() {
                    session.sample(&cfg)?
                } else {
                    format!("{}{}", config.prime, session.predict(&config.prime, &cfg)?)
                };
                println!("{text}");
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_args();
    info!(mode = ?config.mode, precision = ?config.precision, hidden = ?config.hidden_sizes, "starting");

    let result = match config.precision {
        Precision::F32 => run::<f32>(&config),
        Precision::F64 => run::<f64>(&config),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "aborted");
            ExitCode::FAILURE
        }
    }
}
