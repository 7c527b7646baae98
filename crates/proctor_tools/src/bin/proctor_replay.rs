#![forbid(unsafe_code)]

use std::env;
use std::fs::File;
use std::io::{self, BufReader, Write};

use proctor_os::config::ProctorOsConfig;
use proctor_tools::replay::run_replay;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: proctor_replay <script.jsonl | ->";

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

fn run() -> Result<(), String> {
    init_tracing();

    let path = env::args().nth(1).ok_or_else(|| USAGE.to_string())?;
    let config = ProctorOsConfig::from_env();
    let outputs = if path == "-" {
        run_replay(config, io::stdin().lock())
    } else {
        let file = File::open(&path).map_err(|e| format!("{path}: {e}"))?;
        run_replay(config, BufReader::new(file))
    }
    .map_err(|e| e.to_string())?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for value in outputs {
        writeln!(out, "{value}").map_err(|e| e.to_string())?;
    }
    Ok(())
}

// Logs go to stderr so stdout stays one JSON object per line.
fn init_tracing() {
    let filter = env::var("RUST_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}
