//! `bulwark dlq` commands.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;

use crate::adapters::sqlite::{initialize_from_config, SqliteDeadLetterStore};
use crate::cli::output::{output, table, truncate, CommandOutput};
use crate::domain::models::config::Config;
use crate::domain::models::dead_letter::{DeadLetterFilter, DeadLetterItem};
use crate::domain::models::event::EventId;
use crate::domain::ports::clock::SystemClock;
use crate::services::{DeadLetterQueue, DeadLetterQueueConfig};

#[derive(Args, Debug)]
pub struct DlqArgs {
    #[command(subcommand)]
    pub command: DlqCommands,
}

#[derive(Subcommand, Debug)]
pub enum DlqCommands {
    /// List dead letter entries, oldest first
    List {
        /// Only entries whose event type starts with this prefix
        #[arg(short = 't', long = "type")]
        event_type: Option<String>,
        /// Only entries for this thread
        #[arg(long)]
        thread: Option<String>,
        /// Maximum number of entries to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Show one entry with its full failure history
    Show {
        /// Event id of the entry
        id: String,
    },
    /// Remove entries past their retention period
    Sweep,
    /// Remove every entry
    Purge {
        /// Confirm the purge
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub thread_id: String,
    pub attempts: u32,
    pub failure_reason: String,
    pub first_failed_at: String,
    pub expires_at: String,
}

impl From<&DeadLetterItem> for DlqEntry {
    fn from(item: &DeadLetterItem) -> Self {
        Self {
            id: item.id().to_string(),
            event_type: item.event.event_type.clone(),
            thread_id: item.event.thread_id.clone(),
            attempts: item.attempts,
            failure_reason: item.failure_reason.clone(),
            first_failed_at: item.first_failed_at.to_rfc3339(),
            expires_at: item.expires_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DlqListOutput {
    pub entries: Vec<DlqEntry>,
    pub total: usize,
}

impl CommandOutput for DlqListOutput {
    fn to_human(&self) -> String {
        if self.entries.is_empty() {
            return "No dead letter entries found.".to_string();
        }

        let mut t = table(&["ID", "TYPE", "THREAD", "ATTEMPTS", "FIRST FAILED", "REASON"]);
        for e in &self.entries {
            t.add_row(vec![
                e.id.clone(),
                e.event_type.clone(),
                e.thread_id.clone(),
                e.attempts.to_string(),
                e.first_failed_at.clone(),
                truncate(&e.failure_reason, 48),
            ]);
        }
        format!("Showing {} of {} DLQ entry(ies):\n{t}", self.entries.len(), self.total)
    }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct DlqShowOutput {
    pub item: DeadLetterItem,
}

impl CommandOutput for DlqShowOutput {
    fn to_human(&self) -> String {
        let item = &self.item;
        let mut lines = vec![
            format!("ID:           {}", item.id()),
            format!("Type:         {}", item.event.event_type),
            format!("Thread:       {}", item.event.thread_id),
            format!("Attempts:     {}", item.attempts),
            format!("Reason:       {}", item.failure_reason),
            format!("First failed: {}", item.first_failed_at.to_rfc3339()),
            format!("Expires:      {}", item.expires_at.to_rfc3339()),
            format!("Payload:      {}", item.event.data),
            "Failures:".to_string(),
        ];
        for failure in &item.failure_history {
            lines.push(format!("  {}  {}", failure.timestamp.to_rfc3339(), failure.error));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct DlqActionOutput {
    pub message: String,
    pub count: usize,
}

impl CommandOutput for DlqActionOutput {
    fn to_human(&self) -> String {
        self.message.clone()
    }
}

async fn open_dead_letters(config: &Config) -> Result<DeadLetterQueue> {
    let pool = initialize_from_config(&config.database)
        .await
        .with_context(|| format!("Failed to open database at {}", config.database.path))?;
    let dlq = DeadLetterQueue::new(
        DeadLetterQueueConfig::from_config(config),
        Arc::new(SystemClock),
    )
    .with_store(Arc::new(SqliteDeadLetterStore::new(pool)));
    dlq.load().await.context("Failed to load dead letters")?;
    Ok(dlq)
}

pub async fn execute(args: DlqArgs, config: &Config, json_mode: bool) -> Result<()> {
    let dlq = open_dead_letters(config).await?;

    match args.command {
        DlqCommands::List {
            event_type,
            thread,
            limit,
        } => {
            let mut filter = DeadLetterFilter::new();
            if let Some(prefix) = event_type {
                filter = filter.event_type_prefix(prefix);
            }
            if let Some(thread) = thread {
                filter = filter.thread_id(thread);
            }
            let matching = dlq.list(&filter);

            let out = DlqListOutput {
                total: matching.len(),
                entries: matching.iter().take(limit).map(DlqEntry::from).collect(),
            };
            output(&out, json_mode);
        }
        DlqCommands::Show { id } => {
            let event_id =
                EventId::parse(&id).with_context(|| format!("Invalid event id: {id}"))?;
            let item = dlq
                .get(event_id)
                .with_context(|| format!("No dead letter entry {id}"))?;
            output(&DlqShowOutput { item }, json_mode);
        }
        DlqCommands::Sweep => {
            let count = dlq.sweep().await.context("Failed to sweep dead letters")?;
            output(
                &DlqActionOutput {
                    message: format!("Removed {count} expired DLQ entry(ies)"),
                    count,
                },
                json_mode,
            );
        }
        DlqCommands::Purge { yes } => {
            if !yes {
                anyhow::bail!(
                    "Refusing to purge {} DLQ entry(ies) without --yes",
                    dlq.len()
                );
            }
            let count = dlq.purge().await.context("Failed to purge dead letters")?;
            output(
                &DlqActionOutput {
                    message: format!("Purged {count} DLQ entry(ies)"),
                    count,
                },
                json_mode,
            );
        }
    }
    Ok(())
}
