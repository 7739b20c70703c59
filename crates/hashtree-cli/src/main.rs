//! htree - versioned content-addressed storage from the command line
//!
//! Usage:
//!   htree add <path> [--key <key>]
//!   htree cat <key> [--offset N] [--length N]
//!   htree set <key> <nhash>
//!   htree get <key>
//!   htree rm <key>
//!   htree ls [--from <key>] [--to <key>]
//!   htree search <query> [--limit N] [--type blob|file|dir]
//!   htree nhash <nhash|hex> [--kind blob|file|dir] [--size N]
//!   htree log
//!   htree status

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hashtree_cli::Repo;
use hashtree_config::Config;
use hashtree_core::{from_hex, is_nhash, nhash_decode, nhash_encode, to_hex, Link, LinkType};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "htree")]
#[command(about = "Versioned content-addressed storage", long_about = None)]
struct Cli {
    /// Data directory (defaults to storage.data_dir from config)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a file and link it under a key
    Add {
        path: PathBuf,
        /// Key to link under (defaults to the file name)
        #[arg(long)]
        key: Option<String>,
    },
    /// Print the contents of a key
    Cat {
        key: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        length: Option<u64>,
    },
    /// Link an existing CID under a key
    Set { key: String, nhash: String },
    /// Show the CID stored under a key
    Get { key: String },
    /// Remove a key
    Rm { key: String },
    /// List keys in [from, to)
    Ls {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
    },
    /// Search paths of the current root
    Search {
        query: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long = "type", value_enum)]
        link_type: Option<KindArg>,
    },
    /// Decode an nhash, or encode a hex hash as one
    Nhash {
        value: String,
        #[arg(long, value_enum, default_value_t = KindArg::Blob)]
        kind: KindArg,
        #[arg(long, default_value_t = 0)]
        size: u64,
    },
    /// List every committed root, oldest first
    Log,
    /// Show the current root, local usage and mirror state
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Blob,
    File,
    Dir,
}

impl From<KindArg> for LinkType {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Blob => LinkType::Blob,
            KindArg::File => LinkType::File,
            KindArg::Dir => LinkType::Dir,
        }
    }
}

fn kind_name(kind: LinkType) -> &'static str {
    match kind {
        LinkType::Blob => "blob",
        LinkType::File => "file",
        LinkType::Dir => "dir",
    }
}

fn link_nhash(link: &Link) -> Result<String> {
    Ok(nhash_encode(&link.to_cid())?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hashtree=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Needs no repository
    if let Commands::Nhash { value, kind, size } = &cli.command {
        return print_nhash(value, *kind, *size);
    }

    let config = Config::load()?;
    let data_dir = cli.data_dir.clone().unwrap_or_else(|| config.storage.data_dir());
    let repo = Repo::open(&config, &data_dir).await?;

    run(&repo, cli.command).await?;

    if let Some(status) = repo.close().await {
        if status.outstanding() > 0 {
            eprintln!(
                "warning: {} blob(s) not mirrored yet; they will be retried on the next run",
                status.outstanding()
            );
        }
    }
    Ok(())
}

async fn run(repo: &Repo, command: Commands) -> Result<()> {
    let tree = repo.tree();
    match command {
        Commands::Add { path, key } => {
            let key = match key {
                Some(key) => key,
                None => path
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .context("Path has no file name; pass --key")?,
            };
            let (root, link) = repo.add_file(&key, &path).await?;
            println!("added {} {}", key, link_nhash(&link)?);
            println!("root {}", nhash_encode(&root)?);
        }
        Commands::Cat { key, offset, length } => {
            let link = tree
                .get(&key)
                .await?
                .with_context(|| format!("Key not found: {}", key))?;
            let length = length.unwrap_or(u64::MAX);
            let data = tree.read_range(&link, offset, length).await?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&data).await?;
            stdout.flush().await?;
        }
        Commands::Set { key, nhash } => {
            let cid = nhash_decode(&nhash).context("Invalid nhash")?;
            let root = repo.set(&key, Link::from_cid(&cid).with_name(&key)).await?;
            println!("root {}", nhash_encode(&root)?);
        }
        Commands::Get { key } => match tree.get(&key).await? {
            Some(link) => println!(
                "{}\t{}\t{}",
                link_nhash(&link)?,
                kind_name(link.link_type),
                link.size
            ),
            None => bail!("Key not found: {}", key),
        },
        Commands::Rm { key } => {
            if tree.get(&key).await?.is_none() {
                bail!("Key not found: {}", key);
            }
            let root = repo.delete(&key).await?;
            println!("root {}", nhash_encode(&root)?);
        }
        Commands::Ls { from, to } => {
            for (key, link) in tree.list(from.as_deref(), to.as_deref()).await? {
                println!("{}\t{}\t{}", kind_name(link.link_type), link.size, key);
            }
        }
        Commands::Search {
            query,
            limit,
            link_type,
        } => {
            let results = repo
                .search(&query, limit, link_type.map(LinkType::from))
                .await?;
            for result in results {
                println!("{}\t{}", result.score, result.path);
            }
        }
        Commands::Nhash { value, kind, size } => print_nhash(&value, kind, size)?,
        Commands::Log => {
            let roots = repo.roots()?;
            let last = roots.len().saturating_sub(1);
            for (i, root) in roots.iter().enumerate() {
                let marker = if i == last { " (current)" } else { "" };
                println!("{}\t{}\t{} entries{}", i, nhash_encode(root)?, root.size, marker);
            }
        }
        Commands::Status => {
            let root = repo.root().await;
            let usage = repo.usage().await;
            println!("Root: {}", nhash_encode(&root)?);
            println!("Entries: {}", tree.len().await?);
            println!("Data directory: {}", repo.data_dir().display());
            println!("Local blobs: {} ({} bytes)", usage.count, usage.bytes);
            match repo.mirror_status() {
                Some(status) => println!(
                    "Mirror: {} in flight, {} failed{}",
                    status.in_flight,
                    status.failed,
                    if status.is_stale() { " (stale)" } else { "" }
                ),
                None => println!("Mirror: not configured"),
            }
        }
    }
    Ok(())
}

fn print_nhash(value: &str, kind: KindArg, size: u64) -> Result<()> {
    if is_nhash(value) {
        let cid = nhash_decode(value).context("Invalid nhash")?;
        println!("hash: {}", to_hex(&cid.hash));
        println!("type: {}", kind_name(cid.kind));
        println!("size: {}", cid.size);
        if let Some(codec) = cid.codec {
            println!("codec: {:?}", codec);
        }
    } else {
        let hash = from_hex(value).context("Expected an nhash or a 64-character hex hash")?;
        let link = Link::new(hash).with_link_type(kind.into()).with_size(size);
        println!("{}", link_nhash(&link)?);
    }
    Ok(())
}
