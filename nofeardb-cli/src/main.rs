use clap::{Parser, Subcommand, ValueEnum};
use nofeardb::StorageEngine;
use serde_json::{json, Value};
use std::process;

/// nofeardb CLI: inspect a nofeardb data directory from the command line
#[derive(Parser)]
#[command(name = "nofeardb", version, about)]
struct Cli {
    /// Path to the data directory (default: current directory)
    #[arg(long, default_value = ".")]
    data_dir: String,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// List the stored documents of a collection
    List {
        /// Collection (document directory) name
        collection: String,
    },

    /// Get a single document by identity
    Get {
        /// Collection (document directory) name
        collection: String,
        /// Document identity
        id: String,
    },

    /// Show the lock files of a collection
    Locks {
        /// Collection (document directory) name
        collection: String,
    },

    /// Remove expired lock files from a collection
    ClearStaleLocks {
        /// Collection (document directory) name
        collection: String,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let engine = StorageEngine::open(&cli.data_dir)?;
    log::debug!("Opened data directory {}", engine.root().display());

    match cli.command {
        Command::List { collection } => {
            let docs: Vec<Value> = engine
                .raw_documents(&collection)?
                .into_iter()
                .map(|(_, doc)| doc)
                .collect();
            print_output(&Value::Array(docs), &cli.format)?;
        }

        Command::Get { collection, id } => {
            let doc = engine
                .raw_documents(&collection)?
                .into_iter()
                .find(|(path, doc)| {
                    doc.get("id").and_then(Value::as_str) == Some(id.as_str())
                        || path
                            .file_name()
                            .and_then(|n| n.to_str())
                            .is_some_and(|n| n.starts_with(&format!("{id}__")))
                })
                .map(|(_, doc)| doc)
                .ok_or_else(|| format!("No document '{id}' in '{collection}'"))?;
            print_output(&doc, &cli.format)?;
        }

        Command::Locks { collection } => {
            let expiration = engine.config().lock_expiration();
            let locks: Vec<Value> = engine
                .locks(&collection)?
                .into_iter()
                .map(|info| {
                    json!({
                        "path": info.path.display().to_string(),
                        "token": &info.token,
                        "created": info.created.map(|c| c.to_string()),
                        "age_secs": info.age().map(|a| a.as_secs()),
                        "stale": info.is_expired(expiration),
                    })
                })
                .collect();
            print_output(&Value::Array(locks), &cli.format)?;
        }

        Command::ClearStaleLocks { collection } => {
            let removed: Vec<String> = engine
                .clear_stale_locks(&collection)?
                .into_iter()
                .map(|p| p.display().to_string())
                .collect();
            print_output(&json!({ "ok": true, "removed": removed }), &cli.format)?;
        }
    }

    Ok(())
}

fn print_output(value: &Value, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}
