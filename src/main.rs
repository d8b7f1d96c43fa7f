//! CLI entry point for ivfstore.
//!
//! Rebuilds the serving cache from synthetic corpora, either through the
//! divide-and-conquer builder or the streaming IVF trainer, and runs demo
//! searches against it.

use anyhow::{Context, anyhow};
use clap::{
    Args, Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use ivfstore::display::{
    create_build_table, create_centroid_table, create_search_table, create_spinner,
};
use ivfstore::dnc::prune_small_leaves;
use ivfstore::serving::{CentroidInfo, RefreshReport};
use ivfstore::{
    BuildReport, DncBuilder, EmbeddingGenerator, Error, MemoryRowSource, MockEmbeddingGenerator,
    Row, SearchHit, ServingCache, Settings, VectorDimension, default_compression,
};
use serde::Serialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

const DEMO_TOPICS: &[&str] = &[
    "ownership and borrowing rules for safe memory access",
    "approximate nearest neighbour search over quantized vectors",
    "k-means clustering with mini-batch centroid updates",
    "lz4 frame compression for on-disk caches",
    "async task scheduling on a multi-threaded runtime",
    "write-ahead logging and crash recovery in databases",
];

#[derive(Debug, Serialize)]
struct RebuildOutput {
    build: Option<BuildReport>,
    leaves_kept: Option<usize>,
    refresh: RefreshReport,
    centroids: Vec<CentroidSummary>,
}

#[derive(Debug, Serialize)]
struct CentroidSummary {
    index: usize,
    rows: u64,
    file: PathBuf,
    updated: String,
}

impl From<&CentroidInfo> for CentroidSummary {
    fn from(info: &CentroidInfo) -> Self {
        Self {
            index: info.index.get(),
            rows: info.rows,
            file: info.path.clone(),
            updated: info.updated.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SearchOutput {
    query: String,
    offset: usize,
    results: Vec<SearchResult>,
}

#[derive(Debug, Serialize)]
struct SearchResult {
    id: u64,
    score: f32,
    document: Option<String>,
}

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

#[derive(Parser)]
#[command(
    name = "ivfstore",
    version,
    about = "Quantized IVF vector store with a centroid-partitioned serving cache",
    styles = clap_cargo_style()
)]
struct Cli {
    /// Path to custom settings file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Shape of the synthetic corpus used by `build` and `refresh`.
#[derive(Args, Debug, Clone)]
struct CorpusArgs {
    /// Rows to generate
    #[arg(long, default_value_t = 50_000)]
    rows: u64,

    /// Vector dimension
    #[arg(long, default_value_t = 64)]
    dim: usize,

    /// Number of underlying clusters the rows are scattered around
    #[arg(long, default_value_t = 8)]
    clusters: usize,

    /// Seed for corpus generation and sampling
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// List every centroid file after the rebuild
    #[arg(long)]
    list: bool,

    /// Print the reports as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the settings file
    #[command(about = "Set up .ivfstore/settings.toml with default values")]
    Init {
        /// Overwrite an existing settings file
        #[arg(short, long)]
        force: bool,
    },

    /// Show the effective configuration
    #[command(about = "Print the merged configuration as TOML")]
    Config,

    /// Bulk rebuild through the divide-and-conquer builder
    #[command(
        about = "Cluster a synthetic corpus on disk, then serve it from the resulting centroids"
    )]
    Build {
        #[command(flatten)]
        corpus: CorpusArgs,
    },

    /// Online rebuild with the streaming IVF trainer
    #[command(about = "Rebuild the serving cache while training centroids from the row stream")]
    Refresh {
        #[command(flatten)]
        corpus: CorpusArgs,
    },

    /// Search a small demo corpus
    #[command(about = "Embed demo documents, serve them and rank them against a query")]
    Search {
        /// Query text
        #[arg(long)]
        text: String,

        /// Centroid files to scan (defaults to serving.default_centroids)
        #[arg(long)]
        centroids: Option<usize>,

        /// Results to return
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,

        /// Results to skip
        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Demo documents to index
        #[arg(long, default_value_t = 600)]
        docs: usize,

        /// Embedding dimension
        #[arg(long, default_value_t = 128)]
        dim: usize,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = if let Some(path) = &cli.config {
        Settings::load_from(path).unwrap_or_else(|e| {
            eprintln!("Configuration error: {e}");
            Settings::default()
        })
    } else {
        Settings::load().unwrap_or_else(|e| {
            eprintln!("Configuration error: {e}");
            Settings::default()
        })
    };
    ivfstore::logging::init(&settings.log_level);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted, stopping after the current batch...");
            on_interrupt.cancel();
        }
    });

    if let Err(e) = run(cli.command, settings, cancel).await {
        let cancelled = match e.downcast_ref::<Error>() {
            Some(error) => {
                report_error(error);
                error.is_cancelled()
            }
            None => {
                eprintln!("Error: {e:#}");
                false
            }
        };
        std::process::exit(if cancelled { 130 } else { 1 });
    }
}

async fn run(
    command: Commands,
    settings: Settings,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    match command {
        Commands::Init { force } => {
            let path = Settings::init_config_file(force).map_err(|e| anyhow!("{e}"))?;
            println!("Created configuration file at: {}", path.display());
            Ok(())
        }
        Commands::Config => {
            let toml = settings.to_toml().context("failed to serialize settings")?;
            print!("{toml}");
            Ok(())
        }
        Commands::Build { corpus } => {
            let spinner = (!corpus.json).then(|| create_spinner("Building centroids..."));
            let json = corpus.json;
            let list = corpus.list;
            let result = blocking(move || build_command(&settings, &corpus, &cancel)).await;
            if let Some(spinner) = spinner {
                spinner.finish_and_clear();
            }
            print_rebuild(&result?, json, list)?;
            Ok(())
        }
        Commands::Refresh { corpus } => {
            let spinner = (!corpus.json).then(|| create_spinner("Refreshing serving cache..."));
            let json = corpus.json;
            let list = corpus.list;
            let result = blocking(move || refresh_command(&settings, &corpus, &cancel)).await;
            if let Some(spinner) = spinner {
                spinner.finish_and_clear();
            }
            print_rebuild(&result?, json, list)?;
            Ok(())
        }
        Commands::Search {
            text,
            centroids,
            count,
            offset,
            docs,
            dim,
            json,
        } => {
            let centroids = centroids.unwrap_or(settings.serving.default_centroids);
            let query = text.clone();
            let (documents, hits) = blocking(move || {
                search_command(&settings, &query, centroids, count, offset, docs, dim, &cancel)
            })
            .await?;
            print_search(&text, &documents, &hits, offset, json)?;
            Ok(())
        }
    }
}

async fn blocking<T, F>(work: F) -> ivfstore::Result<T>
where
    F: FnOnce() -> ivfstore::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Internal(format!("worker task failed: {e}")))?
}

fn open_cache(settings: &Settings) -> ivfstore::Result<ServingCache> {
    Ok(ServingCache::open(
        &settings.cache_path,
        settings.serving.clone(),
        default_compression(),
    )?)
}

struct Rebuild {
    build: Option<(BuildReport, usize)>,
    refresh: RefreshReport,
    centroids: Vec<CentroidInfo>,
}

fn build_command(
    settings: &Settings,
    corpus: &CorpusArgs,
    cancel: &CancellationToken,
) -> ivfstore::Result<Rebuild> {
    let source = MemoryRowSource::synthetic(corpus.rows, corpus.dim, corpus.clusters, corpus.seed)?;
    let builder = DncBuilder::new(
        settings.build.to_build_config(Some(corpus.seed)),
        default_compression(),
        &settings.scratch_path,
    )?;
    let root = builder.stage(source.vectors())?;
    let (leaves, build) = builder.collect(root, cancel)?;
    let kept = prune_small_leaves(leaves, settings.build.min_leaf_rows());
    let centroids: Vec<_> = kept.iter().map(|leaf| leaf.centroid.clone()).collect();

    let cache = open_cache(settings)?;
    let refresh = cache.refresh_with_centroids(&source, &centroids, cancel)?;
    Ok(Rebuild {
        build: Some((build, kept.len())),
        refresh,
        centroids: cache.centroids()?,
    })
}

fn refresh_command(
    settings: &Settings,
    corpus: &CorpusArgs,
    cancel: &CancellationToken,
) -> ivfstore::Result<Rebuild> {
    let source = MemoryRowSource::synthetic(corpus.rows, corpus.dim, corpus.clusters, corpus.seed)?;
    let cache = open_cache(settings)?;
    let refresh = cache.refresh(&source, cancel)?;
    Ok(Rebuild {
        build: None,
        refresh,
        centroids: cache.centroids()?,
    })
}

#[allow(clippy::too_many_arguments)]
fn search_command(
    settings: &Settings,
    text: &str,
    centroids: usize,
    count: usize,
    offset: usize,
    docs: usize,
    dim: usize,
    cancel: &CancellationToken,
) -> ivfstore::Result<(Vec<String>, Vec<SearchHit>)> {
    let generator = MockEmbeddingGenerator::with_dimension(VectorDimension::new(dim)?);
    let documents: Vec<String> = (0..docs)
        .map(|i| {
            let topic = DEMO_TOPICS[i % DEMO_TOPICS.len()];
            format!("{topic} (note {})", i / DEMO_TOPICS.len() + 1)
        })
        .collect();
    let texts: Vec<&str> = documents.iter().map(String::as_str).collect();
    let rows = generator
        .embed_quantized(&texts)?
        .into_iter()
        .enumerate()
        .map(|(i, vector)| Row::new(i as u64, vector))
        .collect();
    let source = MemoryRowSource::new(rows);

    let cache = open_cache(settings)?;
    let report = cache.refresh(&source, cancel)?;
    if report.cancelled {
        return Err(Error::Cancelled);
    }

    let query = generator
        .embed_quantized(&[text])?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Internal("query produced no embedding".to_string()))?;
    let hits = cache.search(&query, centroids, count, offset)?;
    Ok((documents, hits))
}

fn print_rebuild(rebuild: &Rebuild, json: bool, list: bool) -> ivfstore::Result<()> {
    let cancelled =
        rebuild.refresh.cancelled || rebuild.build.is_some_and(|(report, _)| report.cancelled);

    if json {
        let output = RebuildOutput {
            build: rebuild.build.map(|(report, _)| report),
            leaves_kept: rebuild.build.map(|(_, kept)| kept),
            refresh: rebuild.refresh.clone(),
            centroids: rebuild.centroids.iter().map(CentroidSummary::from).collect(),
        };
        println!("{}", to_json(&output)?);
    } else {
        let build = rebuild.build.as_ref().map(|(report, kept)| (report, *kept));
        println!("{}", create_build_table(build, &rebuild.refresh));
        if list && !rebuild.centroids.is_empty() {
            println!("{}", create_centroid_table(&rebuild.centroids));
        }
    }

    if cancelled { Err(Error::Cancelled) } else { Ok(()) }
}

fn print_search(
    query: &str,
    documents: &[String],
    hits: &[SearchHit],
    offset: usize,
    json: bool,
) -> ivfstore::Result<()> {
    let document = |id: u64| usize::try_from(id).ok().and_then(|i| documents.get(i)).cloned();

    if json {
        let output = SearchOutput {
            query: query.to_string(),
            offset,
            results: hits
                .iter()
                .map(|hit| SearchResult {
                    id: hit.id.get(),
                    score: hit.score,
                    document: document(hit.id.get()),
                })
                .collect(),
        };
        println!("{}", to_json(&output)?);
    } else if hits.is_empty() {
        println!("No results for \"{query}\"");
    } else {
        println!("Results for \"{query}\":");
        println!("{}", create_search_table(hits, offset, |id| document(id.get())));
    }
    Ok(())
}

fn to_json<T: Serialize>(value: &T) -> ivfstore::Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| Error::Internal(format!("failed to encode JSON: {e}")))
}

fn report_error(error: &Error) {
    eprintln!("Error [{}]: {error}", error.status_code());
    let suggestions = error.recovery_suggestions();
    if !suggestions.is_empty() {
        eprintln!("\nSuggestions:");
        for suggestion in suggestions {
            eprintln!("  - {suggestion}");
        }
    }
}
