//! Command-line access to an on-disk branchstore.
//!
//! ```bash
//! export BRANCHSTORE_ROOT=/var/lib/branchstore
//! branchstore --project acme put /app/config.json --file config.json
//! branchstore --project acme fork feature
//! branchstore --project acme -b feature put /app/config.json '{"v":2}'
//! branchstore --project acme merge --from feature --strategy lww
//! branchstore --project acme watch /app/ --from-ctime 0
//! ```
//!
//! Every command prints JSON on stdout. Logging goes to stderr and follows
//! `RUST_LOG`.

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use branchstore::{
    Branch, Error, MergeStrategy, OpenOptions, Result, Store, UserMetadata, WatchOptions,
    WriteRequest,
};

#[derive(Parser)]
#[command(name = "branchstore")]
#[command(about = "Branchable, versioned file store", long_about = None)]
struct Cli {
    /// Store root directory
    #[arg(long, env = "BRANCHSTORE_ROOT", default_value = ".branchstore", global = true)]
    root: PathBuf,

    /// Project id
    #[arg(short, long, env = "BRANCHSTORE_PROJECT", default_value = "default", global = true)]
    project: String,

    /// Branch to operate on
    #[arg(short, long, default_value = "main", global = true)]
    branch: String,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a file
    Put {
        path: String,

        /// Inline content (use --file to read from disk)
        value: Option<String>,

        #[arg(short, long, conflicts_with = "value")]
        file: Option<PathBuf>,

        /// User metadata as a JSON object
        #[arg(short, long)]
        meta: Option<String>,

        /// Only write if the file's ctime is still this value
        #[arg(long)]
        if_ctime: Option<i64>,

        /// Settle a ctime mismatch by mtime instead of failing
        #[arg(long, requires = "if_ctime")]
        force: bool,
    },

    /// Print a file's content
    Cat { path: String },

    /// List files, optionally under some prefixes
    Ls {
        prefixes: Vec<String>,

        /// Include base64 content
        #[arg(short, long)]
        content: bool,
    },

    /// Delete a file
    Rm { path: String },

    /// Create a new branch from the current one
    Fork { name: String },

    /// Show what the branch must apply to match another (default: its origin)
    Diff {
        #[arg(long)]
        other: Option<String>,
    },

    /// Merge another branch (default: the origin) into this one
    Merge {
        #[arg(long)]
        from: Option<String>,

        /// override | lww
        #[arg(short, long, default_value = "override")]
        strategy: MergeStrategy,
    },

    /// Show the patch log
    Log {
        /// Only patches newer than this timestamp (ms)
        #[arg(long)]
        after: Option<i64>,
    },

    /// Stream change events as JSON lines
    Watch {
        prefixes: Vec<String>,

        /// Replay changes newer than this timestamp (ms) first
        #[arg(long)]
        from_ctime: Option<i64>,
    },

    /// Remove every file from the branch in one patch
    Drop,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("branchstore=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_meta(raw: Option<&str>) -> Result<Option<UserMetadata>> {
    raw.map(|s| match serde_json::from_str(s)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(Error::invalid_argument("--meta must be a JSON object")),
    })
    .transpose()
}

async fn run(cli: Cli) -> Result<()> {
    let store = Store::open(OpenOptions::on_disk(&cli.root))?;
    let branch: Branch = store.branch(&cli.project, &cli.branch).await?;

    match cli.command {
        Commands::Put {
            path,
            value,
            file,
            meta,
            if_ctime,
            force,
        } => {
            let content = match (value, file) {
                (Some(v), _) => v.into_bytes(),
                (None, Some(f)) => std::fs::read(&f).map_err(|e| Error::io(&f, e))?,
                (None, None) => {
                    return Err(Error::invalid_argument("put needs a value or --file"))
                }
            };
            let mut req = WriteRequest::write(path, content);
            req.metadata = parse_meta(meta.as_deref())?;
            req.expected_ctime = if_ctime;
            let results = branch.transactional_write(vec![req], force).await?;
            print_json(&results)?;
        }
        Commands::Cat { path } => {
            let data = branch
                .get_file(&path)
                .await?
                .ok_or_else(|| Error::not_found(path))?;
            std::io::stdout().write_all(&data)?;
        }
        Commands::Ls { prefixes, content } => {
            if content {
                print_json(&branch.list_files_with_content(&prefixes).await?)?;
            } else {
                print_json(&branch.list_files(&prefixes).await?)?;
            }
        }
        Commands::Rm { path } => {
            let removed = branch.delete_file(&path).await?;
            print_json(&serde_json::json!({ "path": path, "deleted": removed }))?;
        }
        Commands::Fork { name } => {
            let new = branch.branch(&name).await?;
            print_json(&serde_json::json!({
                "name": new.name(),
                "origin": new.get_origin().await?,
                "seq": new.seq().await?,
            }))?;
        }
        Commands::Diff { other } => {
            print_json(&branch.diff(other.as_deref()).await?)?;
        }
        Commands::Merge { from, strategy } => {
            print_json(&branch.merge(from.as_deref(), strategy).await?)?;
        }
        Commands::Log { after } => {
            print_json(&branch.history(after).await?)?;
        }
        Commands::Watch {
            prefixes,
            from_ctime,
        } => {
            let mut stream = branch
                .watch(WatchOptions {
                    from_ctime,
                    path_filters: prefixes,
                    watcher_id: None,
                })
                .await?;
            while let Some(event) = stream.next().await {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Commands::Drop => {
            let removed = branch.soft_delete().await?;
            print_json(&serde_json::json!({ "removed": removed }))?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::ExitCode::FAILURE
        }
    }
}
