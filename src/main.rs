use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use memoir::cli::{db, list, read, search, session, sync};
use memoir::config::Config;
use memoir::parser::{ParserRegistry, Source};
use memoir::store::{SessionFilter, Store};

#[derive(Parser)]
#[command(name = "memoir")]
#[command(about = "Unified local index, search, and forking for AI coding assistant sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "memoir.yaml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan source roots and reconcile the index
    Sync {
        /// Discard all derived data and reprocess every file
        #[arg(long)]
        full: bool,

        /// Restrict the run to one source
        #[arg(short, long)]
        source: Option<String>,

        /// List failing files with reasons
        #[arg(long)]
        failures: bool,
    },

    /// List known sources with counts
    Sources,

    /// List projects
    Projects {
        /// Filter by source
        #[arg(short, long)]
        source: Option<String>,
    },

    /// List sessions
    List {
        /// Filter by source
        #[arg(short, long)]
        source: Option<String>,

        /// Filter by project key
        #[arg(short, long)]
        project: Option<String>,

        /// Starred sessions only
        #[arg(long)]
        starred: bool,

        /// Full-text filter
        #[arg(short, long)]
        query: Option<String>,

        /// Maximum rows
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Print a session transcript
    Show {
        /// Session key (or unambiguous prefix)
        session_id: String,
    },

    /// Full-text search over message content
    Search {
        /// Query terms
        terms: Vec<String>,

        /// Filter by source
        #[arg(short, long)]
        source: Option<String>,

        /// Starred sessions only
        #[arg(long)]
        starred: bool,

        /// Maximum hits
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Star a session
    Star { session_id: String },

    /// Remove a session's star
    Unstar { session_id: String },

    /// Write a source-native continuation file for a session
    Fork { session_id: String },

    /// Database maintenance
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
}

#[derive(Subcommand)]
enum DbCommands {
    /// Report size, row counts, WAL state, and schema version
    Info,
    /// Reclaim free pages and stale WAL segments
    Clean {
        /// Report reclaimable space without removing anything
        #[arg(long)]
        dry_run: bool,
    },
}

fn parse_source(name: Option<String>) -> Result<Option<Source>> {
    match name {
        None => Ok(None),
        Some(name) => match Source::from_name(&name) {
            Some(source) => Ok(Some(source)),
            None => bail!(
                "unknown source '{}'; expected one of: {}",
                name,
                Source::ALL
                    .iter()
                    .map(|s| s.name())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        },
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Load config
    let config = Config::load(&cli.config)?;

    // Open and migrate the store before serving any command
    let mut store = Store::open(&config.database_path())?;

    match cli.command {
        Commands::Sync {
            full,
            source,
            failures,
        } => {
            let source = parse_source(source)?;
            let registry = ParserRegistry::new(&config);
            sync::run(&mut store, &config, &registry, full, source, failures)?;
        }
        Commands::Sources => {
            list::sources(&store)?;
        }
        Commands::Projects { source } => {
            list::projects(&store, parse_source(source)?)?;
        }
        Commands::List {
            source,
            project,
            starred,
            query,
            limit,
        } => {
            let filter = SessionFilter {
                source: parse_source(source)?,
                project,
                starred_only: starred,
                query,
                limit,
            };
            list::sessions(&store, &filter)?;
        }
        Commands::Show { session_id } => {
            read::run(&store, &session_id)?;
        }
        Commands::Search {
            terms,
            source,
            starred,
            limit,
        } => {
            let filter = SessionFilter {
                source: parse_source(source)?,
                project: None,
                starred_only: starred,
                query: None,
                limit,
            };
            search::run(&store, &terms.join(" "), &filter)?;
        }
        Commands::Star { session_id } => {
            session::set_starred(&mut store, &session_id, true)?;
        }
        Commands::Unstar { session_id } => {
            session::set_starred(&mut store, &session_id, false)?;
        }
        Commands::Fork { session_id } => {
            session::fork(&mut store, &session_id)?;
        }
        Commands::Db { command } => match command {
            DbCommands::Info => db::info(&store)?,
            DbCommands::Clean { dry_run } => db::clean(&mut store, dry_run)?,
        },
    }

    Ok(())
}
