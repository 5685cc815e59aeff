//! `bulwark pending` commands.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;

use crate::adapters::sqlite::{initialize_from_config, SqlitePendingEventStore};
use crate::cli::output::{output, table, truncate, CommandOutput};
use crate::domain::models::config::Config;
use crate::domain::models::event::QueueItem;
use crate::domain::ports::stores::PendingEventStore;

#[derive(Args, Debug)]
pub struct PendingArgs {
    #[command(subcommand)]
    pub command: PendingCommands,
}

#[derive(Subcommand, Debug)]
pub enum PendingCommands {
    /// List persisted critical events, oldest first
    List {
        /// Only events whose type starts with this prefix
        #[arg(short = 't', long = "type")]
        event_type: Option<String>,
        /// Maximum number of events to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub thread_id: String,
    pub priority: u8,
    pub attempts: u32,
    pub max_retries: u32,
    pub enqueued_at: String,
    pub last_error: Option<String>,
}

impl From<&QueueItem> for PendingEntry {
    fn from(item: &QueueItem) -> Self {
        Self {
            id: item.id().to_string(),
            event_type: item.event.event_type.clone(),
            thread_id: item.event.thread_id.clone(),
            priority: item.priority,
            attempts: item.attempts,
            max_retries: item.max_retries,
            enqueued_at: item.enqueued_at.to_rfc3339(),
            last_error: item.last_error().map(str::to_string),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PendingListOutput {
    pub entries: Vec<PendingEntry>,
    pub total: usize,
}

impl CommandOutput for PendingListOutput {
    fn to_human(&self) -> String {
        if self.entries.is_empty() {
            return "No pending events.".to_string();
        }

        let mut t = table(&["ID", "TYPE", "THREAD", "PRIORITY", "ATTEMPTS", "ENQUEUED", "LAST ERROR"]);
        for e in &self.entries {
            t.add_row(vec![
                e.id.clone(),
                e.event_type.clone(),
                e.thread_id.clone(),
                e.priority.to_string(),
                format!("{}/{}", e.attempts, e.max_retries),
                e.enqueued_at.clone(),
                truncate(e.last_error.as_deref().unwrap_or("-"), 40),
            ]);
        }
        format!("Showing {} of {} pending event(s):\n{t}", self.entries.len(), self.total)
    }
}

pub async fn execute(args: PendingArgs, config: &Config, json_mode: bool) -> Result<()> {
    let pool = initialize_from_config(&config.database)
        .await
        .with_context(|| format!("Failed to open database at {}", config.database.path))?;
    let store = SqlitePendingEventStore::new(pool);

    match args.command {
        PendingCommands::List { event_type, limit } => {
            let items = store
                .load_all()
                .await
                .context("Failed to load pending events")?;
            let matching: Vec<&QueueItem> = items
                .iter()
                .filter(|item| {
                    event_type
                        .as_deref()
                        .is_none_or(|prefix| item.event.event_type.starts_with(prefix))
                })
                .collect();

            let out = PendingListOutput {
                total: matching.len(),
                entries: matching.into_iter().take(limit).map(PendingEntry::from).collect(),
            };
            output(&out, json_mode);
        }
    }
    Ok(())
}
