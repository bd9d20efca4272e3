mod config;

use std::io::{self, BufRead, Write};

use clap::Parser;
use logfold_store::{
    Filter, FindQuery, Fingerprint, Level, LogDocument, LogStore, PurgeScope, StoreConfig,
    copy_collection, purge,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, Command, load_store_config, purge_scope};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(io::stderr)
        .init();

    let config = load_store_config(cli.config.as_deref(), cli.connection.as_deref(), |key| {
        std::env::var(format!("{}{key}", logfold_store::config::ENV_PREFIX)).ok()
    })?;

    match cli.command {
        Command::Query {
            limit,
            query,
            level,
            logger,
            fingerprint,
            fields,
            json,
        } => {
            let store = open(config)?;
            let mut filter = match query {
                Some(text) => Filter::from_json(&serde_json::from_str(&text)?)?,
                None => Filter::all(),
            };
            if let Some(level) = level {
                filter = filter.with_level(level.parse::<Level>()?.name());
            }
            if let Some(logger) = logger {
                filter = filter.with_logger(logger);
            }
            if let Some(fp) = fingerprint {
                filter = filter.with_fingerprint(fp.parse()?);
            }
            let mut find = FindQuery::new(filter).with_limit(limit);
            if !fields.is_empty() {
                find = find.with_projection(fields);
            }

            let mut out = io::stdout().lock();
            for doc in store.find(&find)? {
                if doc.level_name() == Some(Level::Internal.name()) {
                    continue;
                }
                if json {
                    writeln!(out, "{}", serde_json::to_string_pretty(&doc.to_json())?)?;
                } else {
                    writeln!(out, "{}", summary_line(&doc))?;
                }
            }
        }

        Command::Purge {
            all,
            days,
            backup,
            force,
        } => {
            let scope = purge_scope(all, days, chrono::Utc::now())?;
            let store = open(config)?;
            let mut prompt = match scope {
                PurgeScope::OlderThan(cutoff) => format!(
                    "Delete records in {} first seen at or before {cutoff}?",
                    store.collection().name()
                ),
                PurgeScope::All => format!(
                    "Delete ALL records in {} and {}?",
                    store.collection().name(),
                    store.timestamp_collection().name()
                ),
            };
            if let Some(backup) = &backup {
                prompt.push_str(&format!(" (backup to {backup} first)"));
            }
            if !force && !confirm(&prompt)? {
                println!("Aborted");
                return Ok(());
            }

            info!(target: "logfold::cli", ?scope, backup = ?backup, "Purging");
            let report = purge(&store, scope, backup.as_deref())?;
            if let Some(copied) = report.backed_up {
                println!("Backed up {copied} records");
            }
            println!(
                "Deleted {} records and {} ledger entries",
                report.documents, report.ledger_entries
            );
        }

        Command::Copy { to } => {
            let store = open(config)?;
            let source = store.collection();
            info!(target: "logfold::cli", from = source.name(), %to, "Copying");
            let copied = copy_collection(&store, &to)?;
            println!("Copied {copied} records from {} to {to}", source.name());
        }

        Command::Ledger { fingerprint, limit } => {
            let store = open(config)?;
            let fingerprint: Fingerprint = fingerprint.parse()?;
            let entries = store.timestamp_collection().entries_for(&fingerprint)?;
            let skip = limit.map_or(0, |n| entries.len().saturating_sub(n));
            println!("{} occurrences of {fingerprint}", entries.len());
            for entry in entries.iter().skip(skip) {
                println!("{}", entry.occurred_at);
            }
        }
    }

    Ok(())
}

fn open(config: StoreConfig) -> anyhow::Result<LogStore> {
    debug!(target: "logfold::cli", connection = ?config.connection, "Opening store");
    let store = LogStore::open(config).map_err(|e| anyhow::anyhow!("Failed to open store: {}", e))?;
    info!(
        target: "logfold::cli",
        version = %store.connection().version(),
        rules = ?store.key_rules(),
        "Connected"
    );
    Ok(store)
}

fn summary_line(doc: &LogDocument) -> String {
    let message = match doc.message() {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let count = doc
        .counter()
        .map(|c| format!(" x{c}"))
        .unwrap_or_default();
    format!(
        "{} {:<8} {}{} [{}] {}",
        doc.last_seen(),
        doc.level_name().unwrap_or("-"),
        doc.fingerprint,
        count,
        doc.logger_name().unwrap_or("-"),
        message
    )
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{prompt} [y/N] ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
