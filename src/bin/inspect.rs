//! lidstore Inspector
//!
//! Reads index files of a store directory without opening the store, so it
//! never truncates or otherwise modifies anything.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use lidstore::chunk::{FileChunk, IndexScan, NameId};
use lidstore::Result;
use tracing_subscriber::{fmt, EnvFilter};

/// lidstore Inspector
#[derive(Parser, Debug)]
#[command(name = "lidstore-inspect")]
#[command(about = "Inspect the on-disk files of a lidstore directory")]
#[command(version)]
struct Args {
    /// Store directory
    #[arg(short, long, default_value = "./lidstore_data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List file pairs in name order
    Files,

    /// Dump the chunk headers of one file pair
    Chunks {
        /// Name id of the file pair
        name_id: NameId,

        /// Also print every lid entry
        #[arg(short, long)]
        entries: bool,
    },

    /// Replay every index file and print where each lid lives
    Lids {
        /// Include removed lids
        #[arg(short, long)]
        removed: bool,
    },

    /// Check every file pair for torn or corrupt chunks
    Verify,
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,lidstore=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let args = Args::parse();

    let result = match &args.command {
        Commands::Files => files(&args.data_dir),
        Commands::Chunks { name_id, entries } => chunks(&args.data_dir, *name_id, *entries),
        Commands::Lids { removed } => lids(&args.data_dir, *removed),
        Commands::Verify => verify(&args.data_dir),
    };

    match result {
        Ok(true) => {}
        Ok(false) => process::exit(2),
        Err(e) => {
            tracing::error!("{}", e);
            process::exit(1);
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

fn files(dir: &Path) -> Result<bool> {
    println!(
        "{:>20}  {:>8}  {:>10}  {:>12}  {:>12}",
        "name_id", "chunks", "entries", "data_bytes", "last_serial"
    );
    for name_id in discover(dir)? {
        let scan = scan(dir, name_id)?;
        println!(
            "{:>20}  {:>8}  {:>10}  {:>12}  {:>12}",
            name_id,
            scan.chunks.len(),
            scan.entry_count(),
            scan.valid_data_len,
            scan.chunks.last().map(|c| c.meta.last_serial).unwrap_or(0)
        );
    }
    Ok(true)
}

fn chunks(dir: &Path, name_id: NameId, entries: bool) -> Result<bool> {
    let scan = scan(dir, name_id)?;
    println!(
        "header: magic={:?} version={} name_id={} ({} bytes)",
        String::from_utf8_lossy(&scan.header.magic),
        scan.header.version,
        scan.header.name_id,
        scan.header_len
    );
    for (chunk_id, chunk) in scan.chunks.iter().enumerate() {
        println!(
            "chunk {:>6}: serial={} entries={} offset={} size={}",
            chunk_id,
            chunk.meta.last_serial,
            chunk.meta.num_entries,
            chunk.meta.offset,
            chunk.meta.size
        );
        if entries {
            for entry in &chunk.entries {
                println!("    lid={} size={}", entry.lid, entry.size);
            }
        }
    }
    if scan.torn_tail {
        println!("torn tail after byte {}", scan.valid_index_len);
    }
    Ok(true)
}

fn lids(dir: &Path, removed: bool) -> Result<bool> {
    // lid -> (name_id, chunk_id, size)
    let mut table: BTreeMap<u32, (NameId, usize, u32)> = BTreeMap::new();
    for name_id in discover(dir)? {
        let scan = scan(dir, name_id)?;
        for (chunk_id, chunk) in scan.chunks.iter().enumerate() {
            for entry in &chunk.entries {
                table.insert(entry.lid, (name_id, chunk_id, entry.size));
            }
        }
    }

    for (lid, (name_id, chunk_id, size)) in &table {
        if *size == 0 && !removed {
            continue;
        }
        let state = if *size == 0 { "removed" } else { "live" };
        println!(
            "lid {:>10}: {:<7} name_id={} chunk={} size={}",
            lid, state, name_id, chunk_id, size
        );
    }
    Ok(true)
}

fn verify(dir: &Path) -> Result<bool> {
    let mut healthy = true;
    for name_id in discover(dir)? {
        match scan(dir, name_id) {
            Ok(scan) if scan.torn_tail => {
                healthy = false;
                println!(
                    "{:020}: torn tail ({} chunks intact, index valid to byte {})",
                    name_id,
                    scan.chunks.len(),
                    scan.valid_index_len
                );
            }
            Ok(scan) => println!(
                "{:020}: ok ({} chunks, {} entries)",
                name_id,
                scan.chunks.len(),
                scan.entry_count()
            ),
            Err(e) => {
                healthy = false;
                println!("{:020}: {}", name_id, e);
            }
        }
    }
    Ok(healthy)
}

// =============================================================================
// Helpers
// =============================================================================

/// Name ids of every index file, ascending
fn discover(dir: &Path) -> Result<Vec<NameId>> {
    let mut name_ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        if let Some(name_id) = FileChunk::parse_name_id(&entry?.path()) {
            name_ids.push(name_id);
        }
    }
    name_ids.sort_unstable();
    Ok(name_ids)
}

fn scan(dir: &Path, name_id: NameId) -> Result<IndexScan> {
    let (index_path, data_path) = FileChunk::paths(dir, name_id);
    let bytes = fs::read(&index_path)?;
    let data_len = fs::metadata(&data_path)?.len();
    IndexScan::parse(&index_path, &bytes, data_len)
}
