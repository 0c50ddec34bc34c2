#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use outpost::config::Config;
use outpost::queue::{load_snapshot, QueueLimits, Retention, DEFAULT_MAX_ITEMS};
use outpost::store::{create_store, PersistentStore};
use outpost::Outpost;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// `outpost` - reliable event delivery over a websocket with HTTP polling fallback.
#[derive(Parser, Debug)]
#[command(name = "outpost")]
#[command(version)]
#[command(about = "Queue events for reliable delivery and listen on notification channels.", long_about = None)]
struct Cli {
    /// Directory holding config.toml and persisted state
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the delivery service
    #[command(long_about = "\
Run the delivery service in the foreground.

Each line read from stdin is parsed as JSON and enqueued on --queue. \
Notifications for every --subscribe channel are printed to stdout \
as JSON lines. Stops on Ctrl-C, or at end of input when no channel \
is subscribed.

Examples:
  tail -F events.jsonl | outpost run --queue stat
  outpost run --subscribe cast --subscribe alerts < /dev/null
  outpost run --queue err --max-items 20 --max-age-secs 3600")]
    Run {
        /// Queue receiving stdin lines
        #[arg(long, default_value = "events")]
        queue: String,
        /// Channel to listen on (repeatable)
        #[arg(long = "subscribe", value_name = "CHANNEL")]
        subscribe: Vec<String>,
        /// Queue capacity; the oldest items are evicted first
        #[arg(long, default_value_t = DEFAULT_MAX_ITEMS)]
        max_items: usize,
        /// Item lifetime in seconds (0 = not persisted, -1 = forever)
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        max_age_secs: i64,
    },

    /// List queues persisted from earlier runs
    Queues,

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Dump the full configuration JSON Schema to stdout
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Both reqwest and tokio-tungstenite pull in rustls; pick the provider up front.
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("Warning: Failed to install default crypto provider: {e:?}");
    }

    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        std::env::set_var("OUTPOST_CONFIG_DIR", config_dir);
    }

    // Schema output must stay clean JSON; no config load, no logging.
    if let Commands::Config {
        config_command: ConfigCommands::Schema,
    } = &cli.command
    {
        return print_schema();
    }

    // Logs go to stderr so stdout stays a clean stream of notifications.
    let subscriber = fmt::Subscriber::builder()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install tracing subscriber")?;

    let config = Config::load_or_init().await?;

    match cli.command {
        Commands::Run {
            queue,
            subscribe,
            max_items,
            max_age_secs,
        } => {
            let limits = QueueLimits::new(max_items, max_age_secs);
            run(config, &queue, &subscribe, limits).await
        }
        Commands::Queues => {
            print_queues(&config);
            Ok(())
        }
        Commands::Config { config_command } => match config_command {
            ConfigCommands::Show => {
                print!(
                    "{}",
                    toml::to_string_pretty(&config).context("Failed to serialize config")?
                );
                Ok(())
            }
            ConfigCommands::Schema => print_schema(),
        },
    }
}

async fn run(config: Config, queue: &str, channels: &[String], limits: QueueLimits) -> Result<()> {
    let outpost = Outpost::from_config(config)?;
    let enqueuer = outpost.create_queue(queue, limits)?;

    for channel in channels {
        outpost.subscribe(channel, json!({}), |payload: &Value, channel: &str| {
            println!("{}", json!({ "channel": channel, "payload": payload }));
        });
    }

    outpost.start()?;
    eprintln!("📮 outpost running");
    eprintln!("   Queue:     {queue}");
    if !channels.is_empty() {
        eprintln!("   Channels:  {}", channels.join(", "));
    }
    eprintln!("   Ctrl+C to stop");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            line = lines.next_line(), if stdin_open => match line.context("Failed to read stdin")? {
                Some(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(line) {
                        Ok(payload) => enqueuer.enqueue(payload)?,
                        Err(e) => warn!("Skipping line that is not JSON: {e}"),
                    }
                }
                None => {
                    if channels.is_empty() {
                        info!("Input closed");
                        break;
                    }
                    stdin_open = false;
                }
            },
        }
    }

    outpost.stop().await;
    let stats = outpost.stats();
    info!(
        "Sent {} item(s), {} acknowledged, {} still pending",
        stats.items_sent_total,
        stats.acks_total,
        outpost.pending_total()
    );
    Ok(())
}

fn print_schema() -> Result<()> {
    let schema = schemars::schema_for!(Config);
    println!(
        "{}",
        serde_json::to_string_pretty(&schema).context("Failed to serialize JSON Schema")?
    );
    Ok(())
}

fn print_queues(config: &Config) {
    let store = create_store(&config.storage, &config.state_dir);
    let snapshot = load_snapshot(store.as_ref());
    if snapshot.is_empty() {
        println!("No persisted queues ({} store).", store.name());
        return;
    }

    println!("Persisted queues ({} store):", store.name());
    for (name, queue) in &snapshot {
        let retention = match queue.retention {
            Retention::Forever => "forever".to_string(),
            Retention::Ephemeral => "not persisted".to_string(),
            Retention::MaxAge(secs) => format!("{secs}s"),
        };
        println!(
            "  {name:<24} pending={:<6} max_items={:<6} retention={retention}",
            queue.items.len(),
            queue.max_items
        );
    }
}
