use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use muse_contracts::candidates::SourceOutcome;
use muse_contracts::images::{GridAspect, ImageCategory, ImageKind};
use muse_engine::config::{DEFAULT_JUDGE_GUIDE, DEFAULT_ROUND_CAP};
use muse_engine::{
    DryrunJudge, FixtureSource, GridCellInput, GridRequest, JudgeConfig, OpenAiJudge,
    SelectorConfig, Session, SourceQuery, SourceRegistry, VisionJudge,
};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "muse_engine=info,muse_rs=info";

#[derive(Debug, Parser)]
#[command(name = "muse-rs", version, about = "Candidate image pooling and grid tournaments")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Narrow pre-fetched search results to a shortlist.
    Select(SelectArgs),
    /// Compose one badge-numbered grid.
    Grid(GridArgs),
    /// Show what a session's registry holds.
    Registry(RegistryArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Strategy {
    Tournament,
    PerSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Judge {
    Openai,
    Dryrun,
}

#[derive(Debug, Parser)]
struct SelectArgs {
    #[arg(long)]
    out: PathBuf,
    /// JSON array of `{source, query, candidates}` objects. Repeatable.
    #[arg(long = "batch", required = true)]
    batches: Vec<PathBuf>,
    #[arg(long = "final")]
    final_count: usize,
    #[arg(long, value_enum, default_value = "tournament")]
    strategy: Strategy,
    #[arg(long, default_value = "")]
    criteria: String,
    #[arg(long, default_value = "")]
    context: String,
    #[arg(long)]
    guide: Option<String>,
    #[arg(long, default_value = "square")]
    aspect: GridAspect,
    #[arg(long, value_enum, default_value = "openai")]
    judge: Judge,
    #[arg(long, default_value_t = DEFAULT_ROUND_CAP)]
    rounds: usize,
    #[arg(long)]
    round_timeout_secs: Option<f64>,
}

#[derive(Debug, Parser)]
struct GridArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    label: String,
    #[arg(long, default_value = "square")]
    aspect: GridAspect,
    #[arg(required = true)]
    refs: Vec<String>,
}

#[derive(Debug, Parser)]
struct RegistryArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    category: Option<ImageCategory>,
    /// Retry downloads of references that are still remote.
    #[arg(long)]
    localize: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("muse-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let output = runtime.block_on(async {
        match cli.command {
            Command::Select(args) => run_select(args).await,
            Command::Grid(args) => run_grid(args).await,
            Command::Registry(args) => run_registry(args).await,
        }
    })?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(0)
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_select(args: SelectArgs) -> Result<Value> {
    let (queries, sources) = load_batches(&args.batches)?;
    let judge = build_judge(args.judge)?;
    let config = selector_config(&args)?;

    let session = Session::start(&args.out)?;
    let selector = session.selector(judge, sources, config);
    let selected = match args.strategy {
        Strategy::Tournament => selector.search_and_select(&queries, args.final_count).await,
        Strategy::PerSource => {
            selector
                .search_and_select_per_source(&queries, args.final_count, &args.criteria)
                .await
        }
    };
    Ok(json!({
        "session": session.id(),
        "strategy": format!("{:?}", args.strategy).to_lowercase(),
        "selected": selected,
    }))
}

fn selector_config(args: &SelectArgs) -> Result<SelectorConfig> {
    let round_timeout = match args.round_timeout_secs {
        Some(secs) if secs.is_finite() && secs > 0.0 => Some(Duration::from_secs_f64(secs)),
        Some(secs) => bail!("--round-timeout-secs must be positive, got {secs}"),
        None => None,
    };
    Ok(SelectorConfig {
        round_cap: args.rounds.max(1),
        aspect: args.aspect,
        context: args.context.clone(),
        judge_guide: Some(
            args.guide
                .clone()
                .unwrap_or_else(|| DEFAULT_JUDGE_GUIDE.to_string()),
        ),
        round_timeout,
        ..SelectorConfig::default()
    })
}

fn build_judge(judge: Judge) -> Result<Arc<dyn VisionJudge>> {
    match judge {
        Judge::Dryrun => Ok(Arc::new(DryrunJudge)),
        Judge::Openai => {
            let config = JudgeConfig::from_env();
            if config.api_key.is_none() {
                bail!("OPENAI_API_KEY is not set; pass --judge dryrun for an offline run");
            }
            Ok(Arc::new(OpenAiJudge::new(config)))
        }
    }
}

/// Reads batch files into one query per entry and a fixture source per name.
fn load_batches(paths: &[PathBuf]) -> Result<(Vec<SourceQuery>, SourceRegistry)> {
    let mut fixtures: BTreeMap<String, FixtureSource> = BTreeMap::new();
    let mut queries = Vec::new();
    for path in paths {
        for outcome in read_batch(path)? {
            queries.push(SourceQuery::new(outcome.source.clone(), outcome.query.clone()));
            let fixture = fixtures
                .remove(&outcome.source)
                .unwrap_or_else(|| FixtureSource::new(outcome.source.clone()));
            fixtures.insert(outcome.source.clone(), fixture.with_outcome(outcome));
        }
    }
    let sources = fixtures
        .into_values()
        .fold(SourceRegistry::new(), |registry, fixture| registry.with(Arc::new(fixture)));
    Ok((queries, sources))
}

fn read_batch(path: &Path) -> Result<Vec<SourceOutcome>> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid batch file {}", path.display()))
}

async fn run_grid(args: GridArgs) -> Result<Value> {
    let session = Session::resume(&args.out)?;
    let mut cells = Vec::with_capacity(args.refs.len());
    for reference in &args.refs {
        let id = session
            .registry()
            .register_image(reference, ImageKind::Reference, ImageCategory::Inspiration, None)
            .await?;
        cells.push(GridCellInput {
            id,
            reference: reference.clone(),
            title: None,
        });
    }
    let request = GridRequest {
        label: args.label,
        aspect: args.aspect,
        cells,
    };
    let render = session.compositor().compose(&request).await?;
    Ok(json!({
        "path": render.path.display().to_string(),
        "cached": render.cached,
        "cells": render
            .cells
            .iter()
            .map(|cell| json!({"position": cell.position, "id": cell.id}))
            .collect::<Vec<_>>(),
    }))
}

async fn run_registry(args: RegistryArgs) -> Result<Value> {
    let session = Session::resume(&args.out)?;
    let registry = session.registry();
    let localized = if args.localize {
        let report = registry.localize_references().await;
        Some(json!({"downloaded": report.downloaded, "failed": report.failed}))
    } else {
        None
    };
    let images = match args.category {
        Some(category) => registry.images_by_category(category),
        None => ImageCategory::ALL
            .into_iter()
            .flat_map(|category| registry.images_by_category(category))
            .collect(),
    };
    eprint!("{}", registry.summary());
    Ok(json!({
        "images": images,
        "localized": localized,
    }))
}
