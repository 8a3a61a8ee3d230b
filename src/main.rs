//! Postvault CLI - maintenance tool for an agent's data directory

use clap::{Parser, Subcommand};
use postvault::config::{self, StoreConfig};
use postvault::content::{ContentGraph, ContentGraphDocument, Vectorizer};
use postvault::storage::{Document, DurableStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "postvault")]
#[command(version)]
#[command(about = "Inspect and maintain a social automation agent's durable document store")]
#[command(long_about = r#"
Postvault keeps every piece of agent state in one JSON document per feature
and remembers what has already been posted, so the agent does not repeat itself.

Example usage:
  postvault check "Shipping v2 today!"
  postvault add "Shipping v2 today!" --topic release
  postvault similar "Shipping version two" --threshold 0.7
  postvault doctor
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory (overrides config and POSTVAULT_DATA_DIR)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file with default settings
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Check whether content duplicates something already posted
    Check {
        /// Proposed content
        text: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Record posted content
    Add {
        /// Posted content
        text: String,

        /// Topic tag (repeatable)
        #[arg(short, long = "topic")]
        topics: Vec<String>,

        /// Record even if the content is a duplicate
        #[arg(long)]
        force: bool,
    },

    /// List posted content similar to the given text
    Similar {
        /// Text to compare against
        text: String,

        /// Similarity threshold (defaults to the stored threshold)
        #[arg(long)]
        threshold: Option<f32>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove a content node
    Remove {
        /// Node ID
        id: Uuid,
    },

    /// Show or set the similarity threshold
    Threshold {
        /// New threshold in 0.0..=1.0
        value: Option<f32>,
    },

    /// Show statistics about the content graph
    Stats,

    /// Report corrupt backups, unreadable documents and stale locks
    Doctor {
        /// Remove stale lock files
        #[arg(long)]
        clear_stale_locks: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);

    let command = match cli.command {
        Commands::Init { force } => {
            let mut config = StoreConfig::default();
            if let Some(dir) = cli.data_dir {
                config.data_dir = dir;
            }
            config::write_config(&config_path, &config, force)?;
            println!("Wrote {}", config_path.display());
            println!("Data directory: {}", config.data_dir.display());
            return Ok(());
        }
        command => command,
    };

    let mut config = config::resolve_config(Some(&config_path))?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    tracing::debug!(data_dir = %config.data_dir.display(), "Using data directory");

    let durable = Arc::new(DurableStore::new(&config));

    match command {
        Commands::Init { .. } => {}

        Commands::Check { text, json } => {
            let graph = open_graph(&durable, &config)?;
            let check = graph.check_duplicate(&text).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&check)?);
            } else if let Some(node) = check.matched_node() {
                match check.similarity() {
                    Some(similarity) => println!(
                        "Duplicate ({}, similarity {:.3}) of node {}",
                        check.reason().map(|r| r.as_str()).unwrap_or_default(),
                        similarity,
                        node.id
                    ),
                    None => println!(
                        "Duplicate ({}) of node {}",
                        check.reason().map(|r| r.as_str()).unwrap_or_default(),
                        node.id
                    ),
                }
                if let Some(content) = &node.content {
                    println!("  Posted {}: {}", node.posted_at, content);
                }
            } else {
                println!("Unique");
            }
        }

        Commands::Add { text, topics, force } => {
            let graph = open_graph(&durable, &config)?;
            if !force {
                let check = graph.check_duplicate(&text).await?;
                if let Some(node) = check.matched_node() {
                    anyhow::bail!(
                        "content is a duplicate ({}) of node {} (use --force to record anyway)",
                        check.reason().map(|r| r.as_str()).unwrap_or_default(),
                        node.id
                    );
                }
            }

            let node = graph.add_node(&text, topics, None).await?;
            println!("Added node {}", node.id);
            println!("  Hash: {}", node.content_hash);
        }

        Commands::Similar { text, threshold, json } => {
            let graph = open_graph(&durable, &config)?;
            let vector = graph.vectorize(&text).await?;
            let results = graph.find_similar(&vector, threshold).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if results.is_empty() {
                println!("No similar content found.");
            } else {
                for res in results {
                    println!("- {} (Score: {:.3})", res.node.id, res.similarity);
                    if let Some(content) = &res.node.content {
                        println!("  {}", content);
                    }
                }
            }
        }

        Commands::Remove { id } => {
            let graph = open_graph(&durable, &config)?;
            if graph.remove_node(id).await? {
                println!("Removed node {}", id);
            } else {
                anyhow::bail!("no content node with id {}", id);
            }
        }

        Commands::Threshold { value } => {
            let graph = open_graph(&durable, &config)?;
            if let Some(value) = value {
                graph.set_similarity_threshold(value).await?;
            }
            println!("{:.3}", graph.similarity_threshold().await?);
        }

        Commands::Stats => {
            let graph = open_graph(&durable, &config)?;
            let stats = graph.stats().await?;

            println!("Postvault Statistics ({})", config.data_dir.display());
            println!("------------------------------------");
            println!("{}", stats);
        }

        Commands::Doctor { clear_stale_locks } => {
            doctor(&durable, clear_stale_locks).await?;
        }
    }

    Ok(())
}

fn open_graph(durable: &Arc<DurableStore>, config: &StoreConfig) -> anyhow::Result<ContentGraph> {
    Ok(ContentGraph::with_vectorizer(durable.clone(), config, vectorizer()?)?.with_locked_writes(true))
}

#[cfg(feature = "embeddings")]
fn vectorizer() -> anyhow::Result<Arc<dyn Vectorizer>> {
    Ok(Arc::new(postvault::content::FastEmbedVectorizer::new()?))
}

#[cfg(not(feature = "embeddings"))]
fn vectorizer() -> anyhow::Result<Arc<dyn Vectorizer>> {
    Ok(Arc::new(postvault::content::LetterFrequencyVectorizer))
}

async fn doctor(durable: &DurableStore, clear_stale_locks: bool) -> anyhow::Result<()> {
    let mut problems = 0usize;
    println!("Data directory: {}", durable.data_dir().display());

    let mut names = durable.list_documents().await?;
    if !names.iter().any(|n| n == ContentGraphDocument::NAME) {
        names.push(ContentGraphDocument::NAME.to_string());
    }

    for name in &names {
        let path = match durable.resolve_path(name) {
            Ok(path) => path,
            Err(e) => {
                tracing::debug!(name = %name, error = %e, "Skipping unresolvable document name");
                continue;
            }
        };
        match durable.read(&path).await {
            Ok(Some(_)) => println!("  ok       {}", name),
            Ok(None) => println!("  absent   {}", name),
            Err(e) => {
                problems += 1;
                println!("  CORRUPT  {} ({})", name, e);
            }
        }

        for backup in durable.list_backups(name).await? {
            println!("           backup {}", backup.display());
        }
    }

    for lock in durable.list_locks().await? {
        if durable.is_lock_stale(&lock).await {
            if clear_stale_locks {
                if durable.reclaim_stale_lock(&lock).await {
                    println!("  cleared  {}", lock.display());
                } else {
                    // Taken over or refreshed since the first look
                    println!("  held     {}", lock.display());
                }
            } else {
                problems += 1;
                println!("  STALE    {}", lock.display());
            }
        } else {
            println!("  held     {}", lock.display());
        }
    }

    if problems == 0 {
        println!("No problems found.");
    } else {
        println!("{} problem(s) found.", problems);
    }
    Ok(())
}
