use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use keepsake_core::models::ConflictResolution;
use keepsake_core::EntityType;

#[derive(Parser)]
#[command(name = "keepsake")]
#[command(about = "Inspect and drive Keepsake sync from the command line")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create an entity from a JSON object and queue its upload
    #[command(alias = "new")]
    Add {
        #[arg(value_enum)]
        entity_type: EntityTypeArg,
        /// JSON object payload (read from stdin when omitted)
        payload: Option<String>,
    },
    /// Replace an entity's payload
    Edit {
        #[arg(value_enum)]
        entity_type: EntityTypeArg,
        /// Entity ID or unique ID prefix
        id: String,
        /// JSON object payload (read from stdin when omitted)
        payload: Option<String>,
    },
    /// Delete an entity
    #[command(alias = "rm")]
    Delete {
        #[arg(value_enum)]
        entity_type: EntityTypeArg,
        /// Entity ID or unique ID prefix
        id: String,
    },
    /// List local entities, most recently modified first
    List {
        #[arg(value_enum)]
        entity_type: EntityTypeArg,
        /// Number of entities to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Set the exact content membership of a journal
    Link {
        /// Journal ID
        journal: String,
        /// Content IDs; omitting all of them empties the journal
        content: Vec<String>,
    },
    /// Run a sync pass against the configured server
    Sync {
        /// Only sync one entity type
        #[arg(long = "type", value_enum, value_name = "TYPE")]
        entity_type: Option<EntityTypeArg>,
    },
    /// Show pending changes, watermarks, and open conflicts
    Status {
        /// Also query the server's per-type counts
        #[arg(long)]
        remote: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List open sync conflicts
    Conflicts {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve an open sync conflict
    Resolve {
        #[arg(value_enum)]
        entity_type: EntityTypeArg,
        /// Entity ID
        id: String,
        #[command(flatten)]
        resolution: ResolutionArgs,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
pub struct ResolutionArgs {
    /// Rebase the local edit onto the server version and upload it again
    #[arg(long)]
    pub keep_local: bool,
    /// Discard the local edit and adopt the server state
    #[arg(long)]
    pub take_server: bool,
}

impl ResolutionArgs {
    pub const fn resolution(&self) -> ConflictResolution {
        if self.keep_local {
            ConflictResolution::KeepLocal
        } else {
            ConflictResolution::TakeServer
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum EntityTypeArg {
    Content,
    Journal,
    Association,
    Media,
}

impl From<EntityTypeArg> for EntityType {
    fn from(value: EntityTypeArg) -> Self {
        match value {
            EntityTypeArg::Content => Self::Content,
            EntityTypeArg::Journal => Self::Journal,
            EntityTypeArg::Association => Self::Association,
            EntityTypeArg::Media => Self::Media,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
