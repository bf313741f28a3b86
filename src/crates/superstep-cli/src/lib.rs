//! # superstep-cli
//!
//! Inspect and maintain the checkpoint databases written by `superstep-core`.
//!
//! ```text
//! superstep --database sqlite://runs.db history <thread>
//! superstep --database sqlite://runs.db show <thread> [--checkpoint <id>]
//! superstep --database sqlite://runs.db delete-thread <thread>
//! ```
//!
//! Encrypted databases need `--key-env <VAR>`, naming the environment
//! variable that holds the base64 AES-256 key the writer used.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use superstep_checkpoint::{CheckpointConfig, CheckpointSaver, CheckpointTuple};
use superstep_core::{CheckpointerConfig, EngineConfig};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "superstep")]
#[command(about = "Inspect superstep checkpoint databases", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Database URL, e.g. sqlite://runs.db
    #[arg(long, env = "SUPERSTEP_DATABASE_URL", global = true)]
    pub database: Option<String>,

    /// Engine configuration file (YAML, TOML or JSON)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Environment variable holding the base64 encryption key
    #[arg(long, global = true)]
    pub key_env: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List a thread's checkpoints, newest first
    History {
        thread: String,

        /// Checkpoint namespace
        #[arg(long)]
        ns: Option<String>,

        /// Only the newest N checkpoints
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only checkpoints from this source (input, loop, update, fork)
        #[arg(long)]
        source: Option<String>,

        /// Print JSON instead of one line per checkpoint
        #[arg(long)]
        json: bool,
    },

    /// Show a checkpoint with its channel values and pending writes
    Show {
        thread: String,

        /// Checkpoint id (defaults to the thread head)
        #[arg(short, long)]
        checkpoint: Option<String>,

        #[arg(long)]
        ns: Option<String>,
    },

    /// Delete every checkpoint and pending write of a thread
    DeleteThread { thread: String },
}

impl Cli {
    /// Engine configuration with command line overrides applied
    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => EngineConfig::default(),
        };
        if let Some(url) = &self.database {
            config.checkpointer = CheckpointerConfig::Sqlite { url: url.clone() };
        }
        if let Some(var) = &self.key_env {
            config.encryption_key_env = Some(var.clone());
        }
        if config.checkpointer == CheckpointerConfig::Memory {
            bail!("No database given; pass --database or set SUPERSTEP_DATABASE_URL");
        }
        Ok(config)
    }
}

/// Run one command, writing its report to `out`
pub async fn run(cli: &Cli, out: &mut impl Write) -> anyhow::Result<()> {
    let saver = cli
        .engine_config()?
        .open_checkpointer()
        .await
        .context("Failed to open checkpoint database")?;

    match &cli.command {
        Command::History {
            thread,
            ns,
            limit,
            source,
            json,
        } => history(&saver, &thread_config(thread, ns), *limit, source.as_deref(), *json, out).await,
        Command::Show {
            thread,
            checkpoint,
            ns,
        } => {
            let mut config = thread_config(thread, ns);
            config.checkpoint_id = checkpoint.clone();
            show(&saver, &config, out).await
        }
        Command::DeleteThread { thread } => {
            saver
                .delete_thread(thread)
                .await
                .with_context(|| format!("Failed to delete thread '{thread}'"))?;
            writeln!(out, "Deleted thread {thread}")?;
            Ok(())
        }
    }
}

fn thread_config(thread: &str, ns: &Option<String>) -> CheckpointConfig {
    let config = CheckpointConfig::for_thread(thread);
    match ns {
        Some(ns) => config.with_checkpoint_ns(ns.clone()),
        None => config,
    }
}

async fn history(
    saver: &Arc<dyn CheckpointSaver>,
    config: &CheckpointConfig,
    limit: Option<usize>,
    source: Option<&str>,
    as_json: bool,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let filter = source.map(|source| HashMap::from([("source".to_string(), json!(source))]));
    let tuples: Vec<CheckpointTuple> = saver
        .list(Some(config), filter, None, limit)
        .await?
        .try_collect()
        .await
        .context("Failed to read checkpoint history")?;
    debug!(count = tuples.len(), "Listed checkpoints");

    if as_json {
        let rows: Vec<Value> = tuples.iter().map(summary).collect();
        writeln!(out, "{}", serde_json::to_string_pretty(&rows)?)?;
        return Ok(());
    }
    if tuples.is_empty() {
        writeln!(out, "No checkpoints for thread {}", config.thread_id.as_deref().unwrap_or_default())?;
        return Ok(());
    }
    for tuple in &tuples {
        let source = tuple
            .metadata
            .source
            .map(|s| format!("{s:?}").to_lowercase())
            .unwrap_or_else(|| "-".to_string());
        writeln!(
            out,
            "{}  step={:<3} source={:<6} parent={}  writes={}  pending={}",
            tuple.checkpoint.id,
            tuple.step(),
            source,
            tuple.parent_checkpoint_id().unwrap_or("-"),
            writers(tuple).join(","),
            tuple.pending_writes.len(),
        )?;
    }
    Ok(())
}

async fn show(
    saver: &Arc<dyn CheckpointSaver>,
    config: &CheckpointConfig,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let Some(tuple) = saver.get_tuple(config).await.context("Failed to load checkpoint")? else {
        match &config.checkpoint_id {
            Some(id) => bail!("Checkpoint '{id}' not found"),
            None => bail!(
                "Thread '{}' has no checkpoints",
                config.thread_id.as_deref().unwrap_or_default()
            ),
        }
    };

    let report = json!({
        "config": tuple.config,
        "parent_config": tuple.parent_config,
        "metadata": tuple.metadata,
        "created_at": tuple.checkpoint.ts,
        "channel_values": tuple.checkpoint.channel_values,
        "channel_versions": tuple.checkpoint.channel_versions,
        "versions_seen": tuple.checkpoint.versions_seen,
        "pending_writes": tuple.pending_writes,
    });
    writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
    Ok(())
}

/// Nodes whose writes produced a checkpoint
fn writers(tuple: &CheckpointTuple) -> Vec<String> {
    match &tuple.metadata.writes {
        Some(Value::Object(writes)) => writes.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

fn summary(tuple: &CheckpointTuple) -> Value {
    json!({
        "checkpoint_id": tuple.checkpoint.id,
        "parent_checkpoint_id": tuple.parent_checkpoint_id(),
        "step": tuple.step(),
        "source": tuple.metadata.source,
        "created_at": tuple.checkpoint.ts,
        "writes": writers(tuple),
        "pending_writes": tuple.pending_writes.len(),
    })
}
