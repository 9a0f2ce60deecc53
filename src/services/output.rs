//! Result persistence: final snapshot plus an optional live append stream

use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::models::Verdict;
use crate::repository::ResultSet;

/// Write the snapshot as sorted `scheme://host:port` lines, replacing the file
#[instrument(skip(results), fields(count = results.len()))]
pub async fn write_snapshot(path: &Path, results: &ResultSet) -> Result<usize> {
    let urls = results.proxy_urls();
    let mut body = urls.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, body).await?;
    fs::rename(&tmp, path).await?;

    info!(path = %path.display(), "Saved {} proxies", urls.len());
    Ok(urls.len())
}

/// Appends each accepted verdict to a file as soon as it arrives
pub struct StreamWriter {
    path: PathBuf,
}

impl StreamWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Truncate the stream file so a new batch starts clean
    pub async fn reset(&self) -> Result<()> {
        fs::write(&self.path, b"").await?;
        Ok(())
    }

    /// Drain the channel until every sender is gone
    ///
    /// Returns the number of lines written.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<Verdict>) -> Result<usize> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        info!(path = %self.path.display(), "Streaming accepted proxies");

        let mut written = 0usize;
        while let Some(verdict) = rx.recv().await {
            let line = format!("{}\n", verdict.proxy_url());
            if let Err(e) = file.write_all(line.as_bytes()).await {
                warn!(path = %self.path.display(), "Stream append failed: {}", e);
                continue;
            }
            if let Err(e) = file.flush().await {
                warn!(path = %self.path.display(), "Stream flush failed: {}", e);
            }
            written += 1;
            debug!(endpoint = %verdict.identity(), "Streamed");
        }

        file.sync_all().await?;
        Ok(written)
    }
}
