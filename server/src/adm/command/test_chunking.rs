use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::Parser;
use futures::StreamExt;
use tokio::fs::File;
use tokio::io::BufReader;

use granary::chunking::{chunk_stream, ChunkerParams};
use granary::hash::ContentHash;

use granary_server::config;

/// Test content-defined chunking on a set of files.
///
/// Chunks every file and reports the would-be deduplication ratio, so
/// the chunk size bounds can be tuned before committing to them. The
/// bounds come from the server configuration unless overridden.
///
/// Warning: changing the bounds of a live server orphans existing
/// cutpoints and the deduplication ratio will suffer until the old
/// chunks age out.
#[derive(Debug, Parser)]
pub struct TestChunking {
    /// Files to chunk.
    #[clap(required = true)]
    files: Vec<PathBuf>,

    /// Minimum chunk size, in bytes.
    #[clap(long)]
    min_size: Option<usize>,

    /// Average chunk size, in bytes.
    #[clap(long)]
    avg_size: Option<usize>,

    /// Maximum chunk size, in bytes.
    #[clap(long)]
    max_size: Option<usize>,
}

pub async fn run(sub: &TestChunking, config_path: Option<&Path>) -> Result<()> {
    let params = resolve_params(sub, config_path)?;

    let mut unique: HashSet<ContentHash> = HashSet::new();
    let mut unique_bytes = 0u64;
    let mut total_bytes = 0u64;
    let mut total_chunks = 0u64;

    for path in &sub.files {
        let file = File::open(path).await?;
        let mut chunks = Box::pin(chunk_stream(BufReader::new(file), params));

        let mut file_bytes = 0u64;
        let mut file_chunks = 0u64;

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            let digest = ContentHash::digest(&chunk.data);

            file_bytes += chunk.data.len() as u64;
            file_chunks += 1;

            if unique.insert(digest) {
                unique_bytes += chunk.data.len() as u64;
            }
        }

        total_bytes += file_bytes;
        total_chunks += file_chunks;

        println!(
            "{}: {} bytes in {} chunks",
            path.display(),
            file_bytes,
            file_chunks
        );
    }

    let ratio = if total_bytes == 0 {
        1.0
    } else {
        unique_bytes as f64 / total_bytes as f64
    };

    println!();
    println!(
        "{} chunks total, {} unique ({} of {} bytes, {:.1}% of the input)",
        total_chunks,
        unique.len(),
        unique_bytes,
        total_bytes,
        ratio * 100.0
    );

    Ok(())
}

fn resolve_params(sub: &TestChunking, config_path: Option<&Path>) -> Result<ChunkerParams> {
    if let (Some(min), Some(avg), Some(max)) = (sub.min_size, sub.avg_size, sub.max_size) {
        return Ok(ChunkerParams::new(min, avg, max)?);
    }

    let config_path = config_path.ok_or_else(|| {
        anyhow!(
            "Either specify --min-size/--avg-size/--max-size or point \
             --config at a server configuration"
        )
    })?;

    let config = config::load_config(config_path)?;
    let configured = config.chunker_params()?;

    Ok(ChunkerParams::new(
        sub.min_size.unwrap_or(configured.min_size),
        sub.avg_size.unwrap_or(configured.avg_size),
        sub.max_size.unwrap_or(configured.max_size),
    )?)
}
