use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use paramflow_core::config::{load_config, JobConfig};
use paramflow_core::message::{JobOutput, ParamId};
use paramflow_core::{print_logo, transform_with_default_ps};
use paramflow_logics::CountingWorker;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file
    #[clap(short, long, value_parser)]
    config: String,
}

/// A counting job: `input` names a text file with one integer key per
/// line; the final server snapshot is the key frequency table.
#[derive(Debug, Deserialize)]
struct DemoConfig {
    input: String,
    #[serde(flatten)]
    job: JobConfig,
}

#[monoio::main(timer_enabled = true)]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    print_logo();

    let args = Args::parse();
    let config: DemoConfig = load_config(args.config.to_owned()).await?;
    let records = read_records(&config.input)?;
    info!(records = records.len(), input = %config.input, "training stream loaded");

    let handle = transform_with_default_ps(
        records,
        |_| CountingWorker,
        |_| 0i64,
        |count: &i64, delta: i64| count + delta,
        &config.job,
    )?;
    for output in handle.wait()? {
        if let JobOutput::Server((id, count)) = output {
            info!(id, count, "parameter");
        }
    }
    Ok(())
}

fn read_records(path: &str) -> Result<Vec<ParamId>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading training input {path}"))?;
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<ParamId>()
                .with_context(|| format!("invalid key {line:?} in {path}"))
        })
        .collect()
}
