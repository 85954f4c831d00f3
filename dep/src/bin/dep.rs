//! KOA DEP runner.
//!
//! # Usage
//!
//! ```bash
//! # Nightly program assignment over a stage directory
//! koa-dep assign HIRES 2021-03-04 /koadata/stage/HIRES/20210304 [assist|force]
//!
//! # Process one file (level 0) or a directory of derived products
//! koa-dep process HIRES /s/sdata125/hires1/2021mar04/hires0001.fits [--reprocess]
//! koa-dep process KCWI /k1/reduced --level 1 --koaid KB.20210304.12345.67
//!
//! # Run queued records until interrupted
//! koa-dep dispatch [--level N]
//!
//! # Send the error digest if one is due
//! koa-dep digest
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Log level (default: info)
//! - `DEP_ROOTDIR`, `DEP_MAX_WORKERS`: override `dep.toml`
//! - `REPOSITORY_TYPE`, `DATABASE_URL`: status store selection

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use koa_dep::config::DepConfig;
use koa_dep::db;
use koa_dep::models::{parse_utdate, parse_utc, Instrument, Status};
use koa_dep::services::pipeline::normalizer_for;
use koa_dep::services::{
    ApiProgramDirectory, CachingDirectory, DigestOutcome, Dispatcher, ErrorDigest,
    HeaderProgMode, LogNotifier, Pipeline, ProgramAssigner, RunRequest,
};

#[derive(Parser, Debug)]
#[command(name = "koa-dep", about = "KOA data evaluation and processing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Assign programs to every file of one night.
    Assign {
        /// Instrument name, e.g. HIRES.
        instrument: String,
        /// UT date, YYYY-MM-DD or YYYY/MM/DD.
        utdate: String,
        /// Stage directory holding the catalog and schedule files.
        stage_dir: PathBuf,
        /// Reconcile with PROG* values already in the headers (assist or force).
        #[arg(value_parser = parse_header_mode)]
        header_mode: Option<HeaderProgMode>,
    },
    /// Process one file (level 0) or a directory of derived products.
    Process {
        #[arg(value_parser = parse_instrument)]
        instrument: Instrument,
        filepath: PathBuf,
        /// Archive the existing record and process again.
        #[arg(long)]
        reprocess: bool,
        #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
        level: u8,
        /// KOAID of the raw frame the products belong to.
        #[arg(long)]
        koaid: Option<String>,
        /// UT date when the products cannot be traced to a KOAID.
        #[arg(long, value_parser = parse_date)]
        utdate: Option<NaiveDate>,
    },
    /// Run queued records until interrupted.
    Dispatch {
        #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
        level: u8,
    },
    /// Send the error digest if one is due.
    Digest,
}

fn parse_instrument(raw: &str) -> Result<Instrument, String> {
    raw.parse()
}

fn parse_header_mode(raw: &str) -> Result<HeaderProgMode, String> {
    raw.parse()
}

fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    parse_utdate(raw).ok_or_else(|| format!("invalid utdate {}", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    FmtSubscriber::builder()
        .with_max_level(
            env::var("RUST_LOG")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(Level::INFO),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let config = DepConfig::load_or_default().context("Failed to load dep.toml")?;
    let repo = Arc::clone(db::init_repository(&config.store).await?);
    let directory = Arc::new(CachingDirectory::from_directory(
        ApiProgramDirectory::new(
            &config.api.proposal_api,
            &config.api.sun_api,
            config.api.timeout(),
        )
        .context("Failed to build the program directory client")?,
    ));

    match cli.command {
        Command::Assign {
            instrument,
            utdate,
            stage_dir,
            header_mode,
        } => assign(&config, directory, &instrument, &utdate, stage_dir, header_mode).await,
        Command::Process {
            instrument,
            filepath,
            reprocess,
            level,
            koaid,
            utdate,
        } => {
            let pipeline = Pipeline::from_config(&config, repo, directory)?;
            let mut request = RunRequest::new(instrument, level, filepath).with_reprocess(reprocess);
            if let Some(koaid) = koaid {
                request = request.with_koaid(koaid.as_str());
            }
            if let Some(utdate) = utdate {
                request = request.with_utdate(utdate);
            }
            process(pipeline, request).await
        }
        Command::Dispatch { level } => {
            let pipeline = Pipeline::from_config(&config, repo, directory)?;
            let dispatcher = Dispatcher::from_settings(pipeline, level, &config.dispatcher);
            dispatcher
                .run_until(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!("Unable to listen for ctrl-c: {}", e);
                        std::future::pending::<()>().await;
                    }
                })
                .await;
            Ok(())
        }
        Command::Digest => {
            let digest = ErrorDigest::from_settings(repo, Arc::new(LogNotifier), &config.digest);
            match digest.run_digest(Utc::now()).await? {
                DigestOutcome::Sent { .. } => info!("Error digest sent"),
                DigestOutcome::Throttled { last } => info!("Error digest already sent at {}", last),
                DigestOutcome::NothingToReport => info!("Nothing to report"),
            }
            Ok(())
        }
    }
}

async fn assign(
    config: &DepConfig,
    directory: Arc<CachingDirectory>,
    instrument: &str,
    utdate: &str,
    stage_dir: PathBuf,
    header_mode: Option<HeaderProgMode>,
) -> Result<()> {
    let split_time = config
        .assign
        .split_time
        .as_deref()
        .map(|s| {
            NaiveTime::parse_from_str(s, "%H:%M")
                .ok()
                .or_else(|| parse_utc(s))
                .ok_or_else(|| anyhow!("invalid split_time {}", s))
        })
        .transpose()?;

    let assigner = ProgramAssigner::new(instrument, utdate, directory)?
        .with_header_mode(header_mode)
        .with_split_time(split_time);
    let normalizer = normalizer_for(assigner.instrument());
    let assigner = assigner.with_normalizer(Some(normalizer));
    let report = assigner.run(&stage_dir).await?;
    info!(
        "{} files assigned for {} {}",
        report.assignments.len(),
        assigner.instrument(),
        utdate
    );
    Ok(())
}

async fn process(pipeline: Pipeline, request: RunRequest) -> Result<()> {
    let filepath = request.filepath.display().to_string();
    let outcome = pipeline.run(request).await;
    match outcome.status {
        Status::Error | Status::Invalid => bail!(
            "{} finished {} ({})",
            filepath,
            outcome.status,
            outcome.status_code.unwrap_or_default()
        ),
        status => {
            info!("{} finished {}", filepath, status);
            Ok(())
        }
    }
}
