use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod channel;
mod config;
mod consumer;
mod error;
mod frame;
mod generate;
mod replayer;
mod session;
mod sink;
mod source;
mod topic;

use config::AppConfig;
use consumer::Consumer;
use replayer::Replayer;
use sink::{JsonLinesSink, LogSink, SampleSink};
use source::CsvSource;

#[derive(Parser)]
#[command(
    name = "em_replay",
    about = "Replay EM sensor logs over a topic-filtered publish/subscribe channel"
)]
struct Cli {
    /// TOML configuration file; the built-in defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a log and consume it in the same process.
    Run {
        #[arg(short, long)]
        file: PathBuf,
        /// Replay the log indefinitely.
        #[arg(short = 'r', long = "loop")]
        loop_data: bool,
        /// Subscribe to sensors 1..=N.
        #[arg(short = 'n', long, value_parser = clap::value_parser!(u32).range(1..))]
        sensors: Option<u32>,
        /// Print samples as JSON lines on stdout.
        #[arg(long)]
        json: bool,
    },
    /// Publish a log only.
    Replay {
        #[arg(short, long)]
        file: PathBuf,
        #[arg(short = 'r', long = "loop")]
        loop_data: bool,
    },
    /// Consume a running replay only.
    Consume {
        #[arg(short = 'n', long, value_parser = clap::value_parser!(u32).range(1..))]
        sensors: Option<u32>,
        #[arg(long)]
        json: bool,
    },
    /// Write a sample log.
    Generate {
        #[arg(short, long, default_value = "replay_data.csv")]
        output: PathBuf,
        /// Random-walk rows appended after the reference rows.
        #[arg(long, default_value_t = 0)]
        rows: usize,
    },
}

fn sink_for(json: bool) -> Box<dyn SampleSink + Send> {
    if json {
        Box::new(JsonLinesSink::new(std::io::stdout()))
    } else {
        Box::new(LogSink)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => AppConfig::load_default()?,
    };

    match cli.command {
        Command::Run {
            file,
            loop_data,
            sensors,
            json,
        } => {
            // Neither side starts unless the log can be opened.
            let source = open_source(&file, &config)?;
            let sensors = sensors.unwrap_or(config.consumer.sensors);
            info!("starting replay of '{}'", source.path().display());

            let cancel = CancellationToken::new();
            session::cancel_on_interrupt(&cancel);
            session::run(
                Replayer::from_config(&config, loop_data),
                source,
                Consumer::from_config(&config, sensors),
                sink_for(json),
                cancel,
            )
            .await?;
            info!("finished");
        }
        Command::Replay { file, loop_data } => {
            let source = open_source(&file, &config)?;
            let cancel = CancellationToken::new();
            session::cancel_on_interrupt(&cancel);
            Replayer::from_config(&config, loop_data)
                .replay(&source, &cancel)
                .await?;
            cancel.cancel();
        }
        Command::Consume { sensors, json } => {
            let sensors = sensors.unwrap_or(config.consumer.sensors);
            let cancel = CancellationToken::new();
            session::cancel_on_interrupt(&cancel);
            Consumer::from_config(&config, sensors)
                .consume(&mut sink_for(json), &cancel)
                .await?;
            cancel.cancel();
        }
        Command::Generate { output, rows } => {
            generate::write_sample_log(&output, rows)?;
        }
    }

    Ok(())
}

fn open_source(file: &Path, config: &AppConfig) -> Result<CsvSource> {
    match CsvSource::open(file, &config.source.columns) {
        Ok(source) => Ok(source),
        Err(e) => {
            error!("{}", e);
            Err(e.into())
        }
    }
}
