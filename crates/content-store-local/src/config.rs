use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use content_store_core::{ContentType, StoreError};

use crate::store::StoreOptions;

/// Configuration for the content-store admin CLI.
#[derive(Parser, Debug, Clone)]
#[command(name = "content-store")]
#[command(about = "File-backed game content store: inspect, edit and sync master documents")]
pub struct Config {
    /// Base directory for entity files
    #[arg(long, global = true, env = "CONTENT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Directory holding the master documents (defaults to <data-dir>/master)
    #[arg(long, global = true, env = "CONTENT_MASTER_DIR")]
    pub master_dir: Option<PathBuf>,

    /// Secondary store that mirrors every save and delete
    #[arg(long, global = true, default_value = "none", env = "CONTENT_MIRROR")]
    pub mirror: MirrorKind,

    /// Give up waiting for a file lock after this many milliseconds
    #[arg(long, global = true, env = "CONTENT_LOCK_TIMEOUT_MS")]
    pub lock_timeout_ms: Option<u64>,

    /// Abandon a mirror call after this many milliseconds
    #[arg(long, global = true, default_value = "5000", env = "CONTENT_MIRROR_TIMEOUT_MS")]
    pub mirror_timeout_ms: u64,

    /// Key-value namespace URL (for the kv mirror)
    #[arg(long, global = true, env = "KV_BASE_URL")]
    pub kv_base_url: Option<String>,

    /// Key-value API token (for the kv mirror)
    #[arg(long, global = true, env = "KV_API_TOKEN")]
    pub kv_api_token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Load every content type from disk and report counts
    Warm,
    /// Print every entity of a type
    List {
        #[arg(value_parser = parse_content_type)]
        content_type: ContentType,
    },
    /// Print one entity, read from disk
    Get {
        #[arg(value_parser = parse_content_type)]
        content_type: ContentType,
        key: String,
    },
    /// Save an entity from a JSON file ("-" for stdin)
    Put {
        #[arg(value_parser = parse_content_type)]
        content_type: ContentType,
        file: PathBuf,
    },
    /// Delete one entity
    Delete {
        #[arg(value_parser = parse_content_type)]
        content_type: ContentType,
        key: String,
    },
    /// Fan out master documents into entity files (all types when omitted)
    Sync {
        #[arg(value_parser = parse_content_type)]
        content_type: Option<ContentType>,
    },
    /// Write the current entities of a type back into its master document
    Export {
        #[arg(value_parser = parse_content_type)]
        content_type: ContentType,
    },
    /// Print the initial state for a new player
    NewPlayer { external_id: String, display_name: String },
    /// Print the template for new entities of a type
    Defaults {
        #[arg(value_parser = parse_content_type)]
        content_type: ContentType,
    },
}

fn parse_content_type(s: &str) -> Result<ContentType, StoreError> {
    s.parse()
}

impl Config {
    /// Get the effective data directory.
    pub fn effective_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("tapgame")
                .join("content")
        })
    }

    /// Get the effective master document directory.
    pub fn effective_master_dir(&self) -> PathBuf {
        self.master_dir
            .clone()
            .unwrap_or_else(|| self.effective_data_dir().join("master"))
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            lock_timeout: self.lock_timeout_ms.map(Duration::from_millis),
            mirror_timeout: Duration::from_millis(self.mirror_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum MirrorKind {
    None,
    /// Key-value REST mirror (requires the `cloud` feature)
    Kv,
}

impl std::fmt::Display for MirrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MirrorKind::None => write!(f, "none"),
            MirrorKind::Kv => write!(f, "kv"),
        }
    }
}
