//! partition-cache - list a table's partitions through a local file cache

use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use partition_cache::source::{B2PartitionSource, LocalPartitionSource};
use partition_cache::{PartitionListCache, PartitionSource};

/// Extension of default cache files
const CACHE_FILE_EXTENSION: &str = "partitions";

/// CLI command
#[derive(Debug)]
enum Command {
    /// List partitions of a table directory on local disk
    Local {
        table_dir: PathBuf,
        cache_file: Option<PathBuf>,
    },
    /// List partitions of a table stored in a B2 bucket
    B2 {
        bucket_name: String,
        table_prefix: String,
        cache_file: Option<PathBuf>,
    },
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"partition-cache - List table partitions through a local cache file

USAGE:
    partition-cache local <table_dir> [cache_file]
    partition-cache b2 <bucket_name> <table_prefix> [cache_file]
    partition-cache help

COMMANDS:
    local   Scan a table directory on local disk
    b2      List a table stored under a prefix in a Backblaze B2 bucket
    help    Show this help message

The cache file is read if present; otherwise the table is listed and the
result is written to it. Delete the file to force a fresh listing.
Partitions are printed to stdout, one per line.

ENVIRONMENT:
    B2_KEY_ID              B2 application key ID (required for b2)
    B2_KEY                 B2 application key (required for b2)
    PARTITION_CACHE_FILE   Cache file to use when none is given
    RUST_LOG               Log level (trace, debug, info, warn, error)
"#
    );
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "local" => {
            if args.len() < 3 {
                return Err(anyhow!("Usage: partition-cache local <table_dir> [cache_file]"));
            }
            Ok(Command::Local {
                table_dir: PathBuf::from(&args[2]),
                cache_file: args.get(3).map(PathBuf::from),
            })
        }
        "b2" => {
            if args.len() < 4 {
                return Err(anyhow!(
                    "Usage: partition-cache b2 <bucket_name> <table_prefix> [cache_file]"
                ));
            }
            Ok(Command::B2 {
                bucket_name: args[2].clone(),
                table_prefix: args[3].clone(),
                cache_file: args.get(4).map(PathBuf::from),
            })
        }
        "help" | "--help" | "-h" => Ok(Command::Help),
        _ => Err(anyhow!("Unknown command: {}", args[1])),
    }
}

/// Resolve the cache file: explicit argument, then PARTITION_CACHE_FILE,
/// then a file named after the table under the user cache directory.
fn resolve_cache_file(explicit: Option<PathBuf>, table_name: &str) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    if let Some(path) = env::var_os("PARTITION_CACHE_FILE") {
        return Ok(PathBuf::from(path));
    }

    let cache_dir = dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("partition-cache");
    std::fs::create_dir_all(&cache_dir)
        .with_context(|| format!("Failed to create cache directory: {:?}", cache_dir))?;

    let file_name = table_name.trim_matches('/').replace(['/', ':'], "_");
    Ok(cache_dir.join(format!("{}.{}", file_name, CACHE_FILE_EXTENSION)))
}

/// Run the cached listing on a blocking thread and print the result
async fn list_cached(source: Arc<dyn PartitionSource>, cache_file: PathBuf) -> Result<()> {
    info!(path = %cache_file.display(), "Using partition cache file");

    let cache = PartitionListCache::new(source, cache_file);
    let partitions = tokio::task::spawn_blocking(move || cache.get_all_partitions())
        .await
        .context("Partition listing task failed")?
        .context("Failed to list partitions")?;

    for partition in &partitions {
        println!("{}", partition);
    }
    info!(count = partitions.len(), "Done");
    Ok(())
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Local {
            table_dir,
            cache_file,
        } => {
            let table_name = table_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "table".to_string());
            let cache_file = resolve_cache_file(cache_file, &table_name)?;

            list_cached(Arc::new(LocalPartitionSource::new(table_dir)), cache_file).await
        }
        Command::B2 {
            bucket_name,
            table_prefix,
            cache_file,
        } => {
            let key_id = env::var("B2_KEY_ID").context("B2_KEY_ID is not set")?;
            let key = env::var("B2_KEY").context("B2_KEY is not set")?;
            let cache_file =
                resolve_cache_file(cache_file, &format!("{}/{}", bucket_name, table_prefix))?;

            let source = B2PartitionSource::new(
                &key_id,
                &key,
                &bucket_name,
                &table_prefix,
                tokio::runtime::Handle::current(),
            );

            list_cached(Arc::new(source), cache_file).await
        }
        Command::Help => {
            print_help();
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let command = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    if let Err(e) = run(command).await {
        error!(error = %e, "partition-cache failed");
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
