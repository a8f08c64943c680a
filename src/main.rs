use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};

use vesper::cache::ResponseCache;
use vesper::config::Config;
use vesper::error::{Result, VesperError};
use vesper::interfaces::generator::ResponseGenerator;
use vesper::ledger::{format_timestamp, MessageDraft, MessageStore};
use vesper::processor::{ChatProcessor, ChatWorker};
use vesper::responders::{CachedGenerator, CannedResponder};

#[derive(Parser, Debug)]
#[command(name = "vesper")]
#[command(about = "Local assistant message ledger and processing worker")]
#[command(version = env!("VESPER_GIT_SHA"))]
struct Cli {
    /// SQLite file holding the ledger and the response cache.
    #[arg(long, env = "VESPER_DB")]
    db: Option<String>,

    /// JSON config file; defaults to `config.json` in the app data dir.
    #[arg(long, env = "VESPER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Append a user message.
    Send {
        text: String,
        #[arg(long)]
        conversation: Option<String>,
    },
    /// Print the full history of a conversation.
    History { conversation: String },
    /// Print the context window the processor would see.
    Context {
        conversation: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// List unprocessed user messages.
    Pending {
        #[arg(long)]
        conversation: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List conversations, most recently active first.
    Conversations {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Stats,
    CacheStats,
    CacheClear,
    /// Run the processing worker until interrupted.
    Run {
        /// Process a single batch and exit.
        #[arg(long, default_value_t = false)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    vesper::logging::init_tracing("vesper");
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if err.is_fatal() => {
            error!(error = %err, "database schema is unusable; aborting");
            ExitCode::from(2)
        }
        Err(err) => {
            error!(error = %err, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(vesper::runtime_paths::default_config_path);
    let config = Config::load_or_defaults(&config_path, cli.db.as_deref())?;

    match cli.command {
        Command::Send { text, conversation } => {
            let store = MessageStore::open(config.store_config()).await?;
            let mut draft = MessageDraft::user(text);
            if let Some(conversation) = conversation {
                draft = draft.in_conversation(conversation);
            }
            match store.add_message(draft).await? {
                Some(inserted) => print_json(&inserted)?,
                None => println!("duplicate message suppressed"),
            }
        }
        Command::History { conversation } => {
            let store = MessageStore::open(config.store_config()).await?;
            for message in store.get_conversation_messages(&conversation).await? {
                let marker = if message.processed { ' ' } else { '*' };
                println!(
                    "{marker} [{}] #{} {}: {}",
                    format_timestamp(message.created_at),
                    message.id,
                    message.role,
                    message.content
                );
            }
        }
        Command::Context {
            conversation,
            limit,
        } => {
            let store = MessageStore::open(config.store_config()).await?;
            print_json(&store.get_context(&conversation, limit).await?)?;
        }
        Command::Pending {
            conversation,
            limit,
        } => {
            let store = MessageStore::open(config.store_config()).await?;
            print_json(&store.get_unprocessed(conversation.as_deref(), limit).await?)?;
        }
        Command::Conversations { limit } => {
            let store = MessageStore::open(config.store_config()).await?;
            print_json(&store.list_conversations(limit).await?)?;
        }
        Command::Stats => {
            let store = MessageStore::open(config.store_config()).await?;
            print_json(&store.processing_stats().await?)?;
        }
        Command::CacheStats => {
            let cache = ResponseCache::open(config.cache_config()).await?;
            print_json(&cache.stats().await?)?;
        }
        Command::CacheClear => {
            let cache = ResponseCache::open(config.cache_config()).await?;
            let removed = cache.clear().await?;
            println!("removed {removed} cached entries");
        }
        Command::Run { once } => run_worker(&config, once).await?,
    }

    Ok(())
}

async fn run_worker(config: &Config, once: bool) -> Result<()> {
    let store = Arc::new(MessageStore::open(config.store_config()).await?);
    let cache = Arc::new(ResponseCache::open(config.cache_config()).await?);
    let generator: Arc<dyn ResponseGenerator> = Arc::new(CachedGenerator::new(
        Arc::new(CannedResponder::new()),
        cache.clone(),
    ));
    let processor = Arc::new(ChatProcessor::new(
        store,
        generator,
        config.processor_config(),
    ));

    if once {
        let report = processor.tick().await?;
        print_json(&report)?;
        return Ok(());
    }

    let mut worker = ChatWorker::new(processor);
    if let Some(interval) = config.sweep_interval() {
        worker = worker.with_cache_sweep(cache, interval);
    }
    worker.start();
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| VesperError::Runtime(e.to_string()))?;
    info!("interrupt received; stopping worker");
    worker.stop().await;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered =
        serde_json::to_string_pretty(value).map_err(|e| VesperError::Serialization(e.to_string()))?;
    println!("{rendered}");
    Ok(())
}
