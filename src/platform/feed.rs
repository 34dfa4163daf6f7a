use std::path::Path;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::RawUpdate;

/// Read newline-delimited JSON updates from `reader` and forward them.
///
/// Malformed lines are dropped. Returns once the reader hits EOF or the
/// receiving side has gone away; read errors are session failures.
pub async fn pump_updates<R>(reader: R, tx: mpsc::Sender<RawUpdate>) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0u64;

    while let Some(line) = lines
        .next_line()
        .await
        .context("Failed to read from update feed")?
    {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let update = match serde_json::from_str::<RawUpdate>(line) {
            Ok(update) => update,
            Err(e) => {
                debug!("Dropping malformed update ({}): {}", e, line);
                continue;
            }
        };

        if tx.send(update).await.is_err() {
            debug!("Update receiver closed, stopping feed");
            break;
        }
        forwarded += 1;
    }

    Ok(forwarded)
}

/// Pump updates from a file or FIFO, or from stdin when no path is given
pub async fn pump_from(path: Option<&Path>, tx: mpsc::Sender<RawUpdate>) -> Result<u64> {
    match path {
        Some(path) => {
            info!("Reading updates from {}", path.display());
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open update feed: {}", path.display()))?;
            pump_updates(BufReader::new(file), tx).await
        }
        None => {
            info!("Reading updates from stdin");
            pump_updates(BufReader::new(tokio::io::stdin()), tx).await
        }
    }
}

/// Collect the result of a spawned pump once the engine has returned.
///
/// After an interruption the pump may still be blocked on input, so it is
/// aborted. Otherwise the engine only stops after the pump dropped its
/// sender, and the pump's own result, including a read error, is awaited.
pub async fn join_pump(handle: JoinHandle<Result<u64>>, interrupted: bool) -> Result<u64> {
    if interrupted {
        handle.abort();
        return Ok(0);
    }
    handle.await.context("Update feed task panicked")?
}
