use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jarstore::config::Config;
use jarstore::db::{self, Database};
use jarstore::kernel::Oid;
use jarstore::tree_render;
use jarstore::txn::Transaction;

#[derive(Parser)]
#[command(name = "jarstore")]
#[command(about = "Inspect a jarstore object database")]
struct Cli {
    /// Database file (overrides JARSTORE_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    Migrate,
    /// Print one stored object as JSON
    Show {
        oid: i64,
    },
    /// List the children of a container (the root by default)
    Ls {
        oid: Option<i64>,
    },
    /// List the annotation keys of an object
    Annotations {
        oid: i64,
    },
    /// Render the object tree below the root
    Tree,
    /// Print store statistics as JSON
    Stats,
}

/// Initialize tracing with output to stderr so stdout stays clean for data.
fn init_tracing(filter: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn open(config: &Config) -> anyhow::Result<Database> {
    tracing::debug!(path = %config.db_path.display(), "Opening database");
    let db = Database::open(config.db_path.clone())?;
    db.migrate()?;
    Ok(db)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?.with_db_path(cli.db);
    init_tracing(&config.log_filter);

    match cli.command {
        Commands::Migrate => {
            open(&config)?;
            println!("Database ready at {}", config.db_path.display());
        }
        Commands::Show { oid } => {
            let db = open(&config)?;
            let record = db
                .get_record(Oid(oid))?
                .ok_or_else(|| anyhow::anyhow!("Object {} not found", oid))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Ls { oid } => {
            let db = open(&config)?;
            let parent = oid.map(Oid).unwrap_or(db::ROOT_OID);
            for child in db.get_children(parent)? {
                println!("{}\t{}\t{}", child.oid, child.type_name, child.name);
            }
        }
        Commands::Annotations { oid } => {
            let db = open(&config)?;
            for key in db.get_annotation_keys(Oid(oid))? {
                println!("{}", key);
            }
        }
        Commands::Tree => {
            let db = open(&config)?;
            db.register_stored_types()?;
            if db.get_record(db::ROOT_OID)?.is_none() {
                println!("(empty store)");
                return Ok(());
            }

            let txn = Transaction::begin_read_only(&db)?;
            let root = txn.get(db::ROOT_OID)?;
            root.activate().await?;
            let tree = txn.tree(&root)?;
            txn.abort();
            print!("{}", tree_render::render_tree(&[tree]));
        }
        Commands::Stats => {
            let db = open(&config)?;
            println!("{}", serde_json::to_string_pretty(&db.get_stats()?)?);
        }
    }

    Ok(())
}
