//! mpool CLI - administration of directory-backed pools
//!
//! Formats pools, inspects their objects, and drives MDCs and mlogs from
//! the command line.

use anyhow::Result;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use mpool_common::{DeviceReport, MediaClass, MpoolConfig, ObjectId};
use mpool_core::{Mdc, MlogHandle, MlogOpenFlags, Mpool};
use mpool_media::{DirPool, DirPoolParams, MediaPool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "mpool-cli")]
#[command(about = "mpool Admin CLI")]
#[command(version)]
struct Args {
    /// Pool directory
    #[arg(short, long, env = "MPOOL_PATH")]
    path: PathBuf,

    /// Pool configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Format a new pool
    Create {
        /// Pool name
        #[arg(short, long)]
        name: String,
        /// Capacity of every mblock (e.g. 32M)
        #[arg(long, default_value = "32M")]
        mblock_capacity: String,
        /// Default mlog capacity (e.g. 4M)
        #[arg(long, default_value = "4M")]
        mlog_capacity: String,
    },
    /// Show the superblock and object counts
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Metadata container operations
    Mdc {
        #[command(subcommand)]
        action: MdcCommands,
    },
    /// mlog operations
    Mlog {
        #[command(subcommand)]
        action: MlogCommands,
    },
}

#[derive(Subcommand, Debug)]
enum MdcCommands {
    /// Allocate and commit a new MDC
    Create {
        /// Capacity of each log (0 = pool default)
        #[arg(long, default_value = "0")]
        capacity: String,
        /// Place the logs on staging media
        #[arg(long)]
        staging: bool,
    },
    /// Append records
    Append {
        log1: String,
        log2: String,
        /// Records to append, one per argument
        #[arg(required = true)]
        records: Vec<String>,
    },
    /// Print every record
    Dump {
        log1: String,
        log2: String,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Rewrite the MDC with its current records
    Compact { log1: String, log2: String },
    /// Erase and delete both logs
    Destroy { log1: String, log2: String },
}

#[derive(Subcommand, Debug)]
enum MlogCommands {
    /// Show mlog properties
    Show { id: String },
    /// Print the records visible to readers
    Dump {
        id: String,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Erase the log, keeping its generation at least `mingen`
    Erase {
        id: String,
        #[arg(long, default_value = "0")]
        mingen: u64,
    },
}

/// Parse a human-readable size string (e.g. "4M", "1G") into bytes.
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (num, multiplier) = if let Some(n) = s.strip_suffix('G') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1024)
    } else {
        // Assume bytes if no suffix
        (s, 1)
    };
    let value: u64 = num
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid size: '{s}'"))?;
    Ok(value * multiplier)
}

/// Parse an object id given in hex (`0x` prefix) or decimal.
fn parse_objid(s: &str) -> Result<ObjectId> {
    let s = s.trim();
    let raw = match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|_| anyhow::anyhow!("Invalid object id: '{s}'"))?;
    Ok(ObjectId::from(raw))
}

/// Render a record as text when it is UTF-8, hex otherwise.
fn format_record(rec: &[u8]) -> String {
    match std::str::from_utf8(rec) {
        Ok(text) => text.to_string(),
        Err(_) => format!("0x{}", hex::encode(rec)),
    }
}

fn print_records(records: &[impl AsRef<[u8]>], json: bool) -> Result<()> {
    if json {
        let out: Vec<_> = records.iter().map(|r| format_record(r.as_ref())).collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if records.is_empty() {
        println!("No records");
    } else {
        for (idx, rec) in records.iter().enumerate() {
            println!("{idx:>6}  {}", format_record(rec.as_ref()));
        }
    }
    Ok(())
}

fn open_media(path: &Path) -> Result<DirPool> {
    let mut rpt = DeviceReport::new();
    DirPool::open(path, &mut rpt)
        .map_err(|e| anyhow::anyhow!("Failed to open pool at {}: {e} ({rpt})", path.display()))
}

fn open_pool(path: &Path, config: &MpoolConfig) -> Result<Mpool> {
    let media = open_media(path)?;
    let mut rpt = DeviceReport::new();
    Mpool::open(Arc::new(media), config.clone(), &mut rpt)
        .map_err(|e| anyhow::anyhow!("Failed to open pool: {e} ({rpt})"))
}

fn open_mdc(pool: &Mpool, log1: &str, log2: &str) -> Result<Mdc> {
    let (id1, id2) = (parse_objid(log1)?, parse_objid(log2)?);
    Ok(Mdc::open(pool, id1, id2)?)
}

fn run_mdc(pool: &Mpool, action: MdcCommands) -> Result<()> {
    match action {
        MdcCommands::Create { capacity, staging } => {
            let class = if staging {
                MediaClass::Staging
            } else {
                MediaClass::Capacity
            };
            let (id1, id2) = Mdc::alloc(pool, class, parse_size(&capacity)?)?;
            Mdc::commit(pool, id1, id2)?;
            println!("{id1} {id2}");
        }
        MdcCommands::Append {
            log1,
            log2,
            records,
        } => {
            let mdc = open_mdc(pool, &log1, &log2)?;
            for rec in &records {
                mdc.append(rec.as_bytes(), false)?;
            }
            mdc.sync()?;
            println!("Appended {} records", records.len());
            mdc.close()?;
        }
        MdcCommands::Dump { log1, log2, json } => {
            let mdc = open_mdc(pool, &log1, &log2)?;
            let records = mdc.reader()?.collect_records()?;
            if !json {
                println!(
                    "MDC {log1}/{log2}: active {} generation {} usage {} bytes",
                    mdc.active_objid()?,
                    mdc.generation()?,
                    mdc.usage()?
                );
            }
            print_records(&records, json)?;
            mdc.close()?;
        }
        MdcCommands::Compact { log1, log2 } => {
            let mdc = open_mdc(pool, &log1, &log2)?;
            let records = mdc.reader()?.collect_records()?;
            let before = mdc.usage()?;
            let generation = mdc.rewrite(&records)?;
            println!(
                "Compacted {} records: {before} -> {} bytes, generation {generation}",
                records.len(),
                mdc.usage()?
            );
            mdc.close()?;
        }
        MdcCommands::Destroy { log1, log2 } => {
            Mdc::destroy(pool, parse_objid(&log1)?, parse_objid(&log2)?)?;
            println!("Destroyed MDC {log1}/{log2}");
        }
    }
    Ok(())
}

fn read_all(handle: &MlogHandle) -> mpool_common::Result<Vec<Bytes>> {
    let mut records = Vec::new();
    while let Some(rec) = handle.read_next_record()? {
        records.push(rec);
    }
    Ok(records)
}

fn run_mlog(pool: &Mpool, action: MlogCommands) -> Result<()> {
    match action {
        MlogCommands::Show { id } => {
            let props = pool.mlog_props(parse_objid(&id)?)?;
            println!("mlog {}", props.objid);
            println!("  Capacity:   {}", props.capacity);
            println!("  Generation: {}", props.generation);
            println!("  Committed:  {}", props.committed);
            println!("  Class:      {:?}", props.class);
        }
        MlogCommands::Dump { id, json } => {
            let (handle, generation) =
                pool.mlog_open(parse_objid(&id)?, MlogOpenFlags::RDONLY)?;
            let records = read_all(&handle);
            handle.close()?;
            pool.mlog_put(handle)?;
            let records = records?;

            if !json {
                println!("mlog {id}: generation {generation}");
            }
            print_records(&records, json)?;
        }
        MlogCommands::Erase { id, mingen } => {
            let generation = pool.mlog_erase_byoid(parse_objid(&id)?, mingen)?;
            println!("Erased mlog {id}, generation {generation}");
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &args.config {
        Some(path) => MpoolConfig::load(path)?,
        None => MpoolConfig::default(),
    };
    debug!("Using config {:?}", config);

    match args.command {
        Commands::Create {
            name,
            mblock_capacity,
            mlog_capacity,
        } => {
            let params = DirPoolParams {
                mblock_capacity: parse_size(&mblock_capacity)?,
                mlog_capacity: parse_size(&mlog_capacity)?,
            };
            let mut rpt = DeviceReport::new();
            let media = DirPool::create(&args.path, &name, params, &mut rpt)
                .map_err(|e| anyhow::anyhow!("Failed to create pool: {e} ({rpt})"))?;
            println!(
                "Created pool {} ({}) at {}",
                media.name(),
                media.superblock().uuid,
                args.path.display()
            );
        }
        Commands::Info { json } => {
            let media = open_media(&args.path)?;
            let sb = media.superblock();
            let (mblocks, mlogs) = (media.mblock_ids(), media.mlog_ids());
            if json {
                let out = serde_json::json!({
                    "name": sb.name,
                    "uuid": sb.uuid.to_string(),
                    "version": sb.version,
                    "mblock_capacity": sb.mblock_capacity,
                    "mlog_capacity": sb.mlog_capacity,
                    "created_at": sb.created_at,
                    "mblocks": mblocks.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "mlogs": mlogs.iter().map(ToString::to_string).collect::<Vec<_>>(),
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("Pool {}", sb.name);
                println!("==========");
                println!("UUID:            {}", sb.uuid);
                println!("Version:         {}", sb.version);
                println!("mblock capacity: {}", sb.mblock_capacity);
                println!("mlog capacity:   {}", sb.mlog_capacity);
                println!("mblocks:         {}", mblocks.len());
                println!("mlogs:           {}", mlogs.len());
                for id in &mlogs {
                    println!("  {id}");
                }
            }
        }
        Commands::Mdc { action } => {
            let pool = open_pool(&args.path, &config)?;
            run_mdc(&pool, action)?;
            pool.close()?;
        }
        Commands::Mlog { action } => {
            let pool = open_pool(&args.path, &config)?;
            run_mlog(&pool, action)?;
            pool.close()?;
        }
    }

    Ok(())
}
