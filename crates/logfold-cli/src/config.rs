use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::{ArgGroup, Parser, Subcommand};
use logfold_store::{PurgeScope, StoreConfig, cutoff_days_ago};

#[derive(Parser, Debug)]
#[command(name = "logfold", about = "Inspect and maintain a logfold store")]
pub struct Cli {
    /// TOML store configuration
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Backend address (memory://, redb://path or a .redb file)
    #[arg(long, global = true)]
    pub connection: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print stored records, newest first
    Query {
        /// Maximum number of records
        #[arg(long, short = 'n', default_value_t = 10)]
        limit: usize,
        /// Extra equality filter as a JSON object of dotted paths
        #[arg(long, short)]
        query: Option<String>,
        /// Only records at this level
        #[arg(long)]
        level: Option<String>,
        /// Only records from this logger
        #[arg(long)]
        logger: Option<String>,
        /// Only the record with this fingerprint
        #[arg(long)]
        fingerprint: Option<String>,
        /// Fields to keep, comma separated dotted paths
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,
        /// Print full documents as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete records
    #[command(group(ArgGroup::new("scope").required(true).args(["all", "days"])))]
    Purge {
        /// Delete every record and ledger entry
        #[arg(long)]
        all: bool,
        /// Delete records first seen more than this many days ago
        #[arg(long)]
        days: Option<u32>,
        /// Copy the record collection here before deleting
        #[arg(long, short)]
        backup: Option<String>,
        /// Do not ask for confirmation
        #[arg(long)]
        force: bool,
    },
    /// Copy the record collection
    Copy {
        /// Destination collection name
        #[arg(long)]
        to: String,
    },
    /// Show the timestamp ledger of one fingerprint
    Ledger {
        /// Fingerprint (32 hex digits)
        fingerprint: String,
        /// Show at most this many of the most recent entries
        #[arg(long, short = 'n')]
        limit: Option<usize>,
    },
}

/// Build the store configuration: file, then `LOGFOLD_*` env, then flags
pub fn load_store_config(
    path: Option<&Path>,
    connection: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<StoreConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
            toml::from_str::<StoreConfig>(&text)?
        }
        None => StoreConfig::default(),
    };
    config.apply_env(env)?;
    if let Some(connection) = connection {
        config.connection = Some(connection.to_string());
    }
    config.validate()?;
    Ok(config)
}

/// Scope of a purge, with `--days` measured back from `now`
pub fn purge_scope(all: bool, days: Option<u32>, now: DateTime<Utc>) -> anyhow::Result<PurgeScope> {
    match days {
        Some(days) if !all => Ok(PurgeScope::OlderThan(cutoff_days_ago(now, days)?)),
        _ => Ok(PurgeScope::All),
    }
}
