//! LPWAN protocol simulator CLI.
//!
//! ```bash
//! # reference scenario, summary on stdout
//! lpwan-sim --config scenario.toml
//!
//! # five seeds of the MQTT-SN baseline, full trace to a file
//! lpwan-sim --config scenario.toml --protocol mqtt_sn --runs 5 --output trace.jsonl
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use env_logger::Builder;
use log::{LevelFilter, info};

use lpwan_sim::RunConfig;
use lpwan_sim::protocols::ProtocolKind;

#[derive(Debug, Clone, Copy, ValueEnum)]
#[value(rename_all = "snake_case")]
enum ProtocolArg {
    Novel,
    MqttSn,
    Coap,
}

impl From<ProtocolArg> for ProtocolKind {
    fn from(value: ProtocolArg) -> Self {
        match value {
            ProtocolArg::Novel => ProtocolKind::Novel,
            ProtocolArg::MqttSn => ProtocolKind::MqttSn,
            ProtocolArg::Coap => ProtocolKind::Coap,
        }
    }
}

/// Runs one or more seeded simulations and writes their records as JSON lines.
#[derive(Parser, Debug)]
#[command(name = "lpwan-sim")]
#[command(version, about, long_about = None)]
struct Args {
    /// Run configuration (.toml or .json)
    #[arg(short, long)]
    config: PathBuf,

    /// Write the full trace here instead of printing summaries to stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Seed of the first run; overrides the configuration
    #[arg(long)]
    seed: Option<u64>,

    /// Number of runs, seeded consecutively
    #[arg(long, default_value = "1")]
    runs: u32,

    /// Protocol under test; overrides the configuration
    #[arg(long, value_enum)]
    protocol: Option<ProtocolArg>,

    /// Debug logging for the simulator
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut logger = Builder::new();
    logger.filter_level(LevelFilter::Info);
    if args.verbose {
        logger.filter(Some("lpwan_sim"), LevelFilter::Debug);
    }
    logger.init();

    let mut config = RunConfig::load(&args.config).with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(protocol) = args.protocol {
        config.protocol = protocol.into();
    }
    config.validate().context("configuration after command-line overrides")?;
    if args.runs == 0 {
        bail!("--runs must be at least 1");
    }

    let seeds: Vec<u64> = (0..args.runs as u64).map(|i| config.seed.wrapping_add(i)).collect();
    info!("{} run(s) of {:?}, seeds {:?}", seeds.len(), config.protocol, seeds);
    let reports = lpwan_sim::run_batch(&config, &seeds)
        .into_iter()
        .zip(&seeds)
        .map(|(report, seed)| report.with_context(|| format!("run with seed {seed}")))
        .collect::<Result<Vec<_>>>()?;

    match &args.output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            for report in &reports {
                report.write_json_lines(&mut writer).with_context(|| format!("writing {}", path.display()))?;
            }
            writer.flush().with_context(|| format!("writing {}", path.display()))?;
            info!("trace written to {}", path.display());
        }
        None => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for report in &reports {
                serde_json::to_writer(&mut out, &report.summary).context("writing summary")?;
                writeln!(out).context("writing summary")?;
            }
        }
    }
    Ok(())
}
