//! Checkpoint inspection tool for sluice channels.
//!
//! Opens a checkpoint file, deriving the capacity from the file length,
//! and dumps the header, the active-file reference counts, and every ring
//! slot. Intended for operators debugging a channel that refuses to start
//! or a log janitor that refuses to delete.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use sluice_channel::{queue, ChannelConfig, EventPointer, IndexQueue, SequenceOracle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Dump the header, refcounts, and ring slots of a channel checkpoint file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the checkpoint file
    checkpoint: PathBuf,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let file_len = fs::metadata(&args.checkpoint)
        .with_context(|| format!("cannot stat {}", args.checkpoint.display()))?
        .len();
    if file_len == 0 {
        bail!("checkpoint file {} is empty", args.checkpoint.display());
    }
    let Some(capacity) = queue::capacity_for(file_len) else {
        bail!(
            "{} is not a checkpoint file: unexpected size {file_len} bytes",
            args.checkpoint.display()
        );
    };

    let config = ChannelConfig::new("inspect", &args.checkpoint, capacity);
    let queue = IndexQueue::open(&config, Arc::new(SequenceOracle::new()))
        .with_context(|| format!("failed to open checkpoint {}", args.checkpoint.display()))?;

    println!("File reference counts:");
    for (file_id, count) in queue.active_file_counts() {
        println!("  file {file_id}: {count}");
    }
    println!("Queue capacity {}", queue.capacity());
    println!("Queue size {}", queue.size());
    println!("Queue head {}", queue.head());
    println!("Checkpoint write order id {}", queue.log_write_order_id());

    for (index, value) in queue.snapshot_ring().into_iter().enumerate() {
        if value == 0 {
            println!("{index}: {value:x} empty");
        } else {
            let pointer = EventPointer::from_u64(value);
            println!(
                "{index}: {value:x} fileID = {}, offset = {}",
                pointer.file_id(),
                pointer.offset()
            );
        }
    }

    Ok(())
}
