use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use docvector_core::config::Settings;
use docvector_core::documents::load_directory;
use docvector_core::filter::Filter;
use docvector_core::traits::VectorStore;
use docvector_embed::registry::{get_recommended_model, list_models, ModelFilter};
use docvector_embed::{create_embedder, create_persistent_embedder, embedder_info};
use docvector_hybrid::{DocumentIndexer, HybridSearchEngine};
use docvector_vector::{get_vector_store, StoreOverrides};

#[derive(Parser)]
#[command(name = "docvector", version, about = "Index documentation and run hybrid similarity queries")]
struct Cli {
    /// Config environment: dev, prod or test. Falls back to RUST_ENV.
    #[arg(long, global = true)]
    env: Option<String>,
    /// Vector store mode, overriding vector_store.mode (local, cloud, hybrid)
    #[arg(long, global = true)]
    mode: Option<String>,
    /// Collection name, overriding vector_store.collection
    #[arg(long, short, global = true)]
    collection: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Chunk, embed and store every document under a directory
    Ingest {
        dir: PathBuf,
        /// Only the first N files (sorted by path)
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },
    /// Hybrid search over a collection
    Query {
        query: String,
        #[arg(long, short = 'k', default_value_t = 5)]
        top_k: usize,
        #[arg(long)]
        min_score: Option<f32>,
        /// JSON payload filter, e.g. '{"source_id": "guide.md"}'
        #[arg(long)]
        filter: Option<String>,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete all chunks of one source document
    Remove { source_id: String },
    /// Inspect the embedding model registry
    Models {
        #[command(subcommand)]
        action: ModelsCommand,
    },
    /// Manage vector store collections
    Collections {
        #[command(subcommand)]
        action: CollectionsCommand,
    },
}

#[derive(Subcommand)]
enum ModelsCommand {
    List {
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        speed: Option<String>,
        #[arg(long)]
        min_quality: Option<String>,
    },
    Recommend {
        #[arg(default_value = "general")]
        use_case: String,
    },
    /// The configured embedder
    Info,
}

#[derive(Subcommand)]
enum CollectionsCommand {
    List,
    Info { name: Option<String> },
    Delete { name: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

async fn open_store(settings: &Settings, mode: Option<&str>) -> Result<Arc<dyn VectorStore>> {
    let overrides = StoreOverrides { mode: mode.map(str::to_string), ..StoreOverrides::default() };
    let store = get_vector_store(&settings.vector_store, &overrides)?;
    store.initialize().await.with_context(|| format!("connecting to the {} vector store", store.backend()))?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let settings = Settings::load_for_env(cli.env.as_deref()).context("loading configuration")?;
    let collection = cli.collection.clone().unwrap_or_else(|| settings.vector_store.collection.clone());
    let mode = cli.mode.as_deref();

    match cli.command {
        Command::Ingest { dir, limit, concurrency } => {
            let docs = load_directory(&dir, limit)?;
            println!("📂 {} documents under {}", docs.len(), dir.display());
            let embedder = create_persistent_embedder(&settings.embedding, &settings.vector_store.persist_path())
                .await
                .context("opening the embedding cache")?;
            let store = open_store(&settings, mode).await?;
            let indexer = DocumentIndexer::new(embedder, Arc::clone(&store), settings.chunking.chunker()?, &collection)
                .with_concurrency(concurrency);
            indexer.ensure_collection().await?;

            let pb = ProgressBar::new(docs.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} docs ({percent}%) {msg}")?
                    .progress_chars("#>-"),
            );
            let summary = indexer
                .index_many(&docs, |doc, _| {
                    pb.set_message(doc.source_id.clone());
                    pb.inc(1);
                })
                .await;
            pb.finish_and_clear();
            println!("✅ Indexed {} documents ({} chunks) into '{}'", summary.documents, summary.chunks, collection);
            for (source_id, err) in &summary.failures {
                eprintln!("❌ {source_id}: {err}");
            }
            store.close().await?;
        }
        Command::Query { query, top_k, min_score, filter, json } => {
            let filter = filter
                .map(|raw| serde_json::from_str::<serde_json::Value>(&raw).context("--filter is not valid JSON"))
                .transpose()?
                .map(|v| Filter::from_json(&v))
                .transpose()?;
            let embedder = create_persistent_embedder(&settings.embedding, &settings.vector_store.persist_path())
                .await
                .context("opening the embedding cache")?;
            let store = open_store(&settings, mode).await?;
            let engine = HybridSearchEngine::new(embedder, Arc::clone(&store), settings.search.clone());
            let hits = engine.search_detailed(&query, &collection, top_k, min_score, filter.as_ref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else {
                println!("🔍 {} results for \"{}\"", hits.len(), query);
                for (i, h) in hits.iter().enumerate() {
                    println!(
                        "\n  {}. score={:.4} (vector={:.4} keyword={:.4})  id={}",
                        i + 1,
                        h.score,
                        h.vector_score,
                        h.keyword_score,
                        h.id
                    );
                    if let Some(content) = h.payload.get("content").and_then(|v| v.as_str()) {
                        let preview: String = content.chars().take(200).collect();
                        println!("     📝 {}", preview.replace('\n', " "));
                    }
                }
            }
            store.close().await?;
        }
        Command::Remove { source_id } => {
            let embedder = create_embedder(&settings.embedding)?;
            let store = open_store(&settings, mode).await?;
            let indexer = DocumentIndexer::new(embedder, Arc::clone(&store), settings.chunking.chunker()?, &collection);
            let removed = indexer.remove_source(&source_id).await?;
            println!("🗑️  Removed {removed} chunks of {source_id}");
            store.close().await?;
        }
        Command::Models { action } => match action {
            ModelsCommand::List { provider, speed, min_quality } => {
                let filter = ModelFilter {
                    provider: provider.map(|p| p.parse()).transpose()?,
                    speed: speed.map(|s| s.parse()).transpose()?,
                    min_quality: min_quality.map(|q| q.parse()).transpose()?,
                };
                for m in list_models(filter) {
                    println!(
                        "{:<48} {:<7} dim={:<5} speed={:<7} quality={:<10} {}",
                        m.id,
                        m.provider.to_string(),
                        m.dimension,
                        m.speed.to_string(),
                        m.quality.to_string(),
                        m.description
                    );
                }
            }
            ModelsCommand::Recommend { use_case } => {
                let m = get_recommended_model(&use_case);
                println!("💡 {} ({}, {} dims): {}", m.id, m.provider, m.dimension, m.description);
            }
            ModelsCommand::Info => {
                let info = embedder_info(&settings.embedding)?;
                println!("provider:   {}", info.provider);
                println!("model:      {}", info.model);
                println!("dimension:  {}", info.dimension);
                println!("device:     {}", info.device);
                println!("batch size: {}", info.batch_size);
                println!("cache:      {}", if info.cache_enabled { "on" } else { "off" });
                match info.registry {
                    Some(m) => println!("registry:   {} / {} / {} MB", m.speed, m.quality, m.memory_mb),
                    None => warn!(model = %info.model, "model is not in the registry"),
                }
            }
        },
        Command::Collections { action } => {
            let store = open_store(&settings, mode).await?;
            match action {
                CollectionsCommand::List => {
                    for name in store.list_collections().await? {
                        println!("{name}");
                    }
                }
                CollectionsCommand::Info { name } => {
                    let info = store.get_collection_info(name.as_deref().unwrap_or(&collection)).await?;
                    println!("{}", serde_json::to_string_pretty(&info)?);
                }
                CollectionsCommand::Delete { name } => {
                    store.delete_collection(&name).await?;
                    println!("🗑️  Deleted collection '{name}'");
                }
            }
            store.close().await?;
        }
    }
    Ok(())
}
