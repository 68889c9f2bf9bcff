//! JSONL ping source
//!
//! [`PingTailReader`] follows a file of newline-delimited ping JSON, surviving
//! rotation (inode change) and truncation. [`forward_pings`] pumps its lines
//! into the ingestion channel until told to stop.

use super::ingestion::Delivery;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

/// Where a fresh reader starts in the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Replay the existing contents first
    Beginning,
    /// Only lines appended after `start`
    End,
}

pub struct PingTailReader {
    path: PathBuf,
    file: Option<BufReader<File>>,
    inode: Option<u64>,
    /// Bytes consumed from the current file
    position: u64,
    /// Trailing text not yet terminated by a newline
    partial: String,
    start_at: StartPosition,
    poll_interval: Duration,
}

impl PingTailReader {
    pub fn new(path: PathBuf, start_at: StartPosition) -> Self {
        Self {
            path,
            file: None,
            inode: None,
            position: 0,
            partial: String::new(),
            start_at,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn start(&mut self) -> std::io::Result<()> {
        self.open(self.start_at).await?;
        log::info!("📖 Started tailing: {}", self.path.display());
        Ok(())
    }

    async fn open(&mut self, at: StartPosition) -> std::io::Result<()> {
        let file = File::open(&self.path).await?;
        let metadata = file.metadata().await?;

        #[cfg(unix)]
        {
            self.inode = Some(metadata.ino());
        }

        let mut reader = BufReader::new(file);
        self.position = match at {
            StartPosition::Beginning => 0,
            StartPosition::End => reader.seek(SeekFrom::End(0)).await?,
        };
        if at == StartPosition::End {
            log::debug!("Skipping {} existing bytes", metadata.len());
        }
        self.partial.clear();
        self.file = Some(reader);
        Ok(())
    }

    /// Next complete, non-empty line, waiting for more data as needed
    pub async fn read_line(&mut self) -> std::io::Result<String> {
        loop {
            if self.detect_rotation().await? {
                log::info!("🔄 File rotation detected, reopening: {}", self.path.display());
                // A rotated file is new; read it from the top
                self.open(StartPosition::Beginning).await?;
            }

            let Some(reader) = self.file.as_mut() else {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "File not opened",
                ));
            };

            let mut chunk = String::new();
            let read = reader.read_line(&mut chunk).await?;
            if read == 0 {
                sleep(self.poll_interval).await;
                continue;
            }
            self.position += read as u64;
            self.partial.push_str(&chunk);

            if !self.partial.ends_with('\n') {
                // Writer is mid-line; wait for the rest
                continue;
            }

            let line = std::mem::take(&mut self.partial);
            let line = line.trim();
            if !line.is_empty() {
                return Ok(line.to_string());
            }
        }
    }

    /// Inode changed (unix) or the file shrank below what was consumed
    async fn detect_rotation(&self) -> std::io::Result<bool> {
        if self.file.is_none() {
            return Ok(false);
        }
        let metadata = tokio::fs::metadata(&self.path).await?;

        #[cfg(unix)]
        {
            if self.inode.is_some_and(|old| old != metadata.ino()) {
                return Ok(true);
            }
        }

        Ok(metadata.len() < self.position)
    }
}

/// Every non-empty line of a JSONL file
pub async fn read_ping_file(path: &Path) -> std::io::Result<Vec<String>> {
    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut out = Vec::new();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if !line.is_empty() {
            out.push(line.to_string());
        }
    }
    Ok(out)
}

/// Feed tailed lines into the ingestion channel until the channel closes or
/// the file becomes unreadable. Returns the number of lines forwarded.
/// Forward every line of the source into the ingestion channel.
///
/// Stops when `shutdown` flips to `true` (or its sender drops), when the
/// channel closes, or on a read error. The caller must stop this task before
/// waiting on the ingestion worker, which only drains once every sender,
/// including the one held here, is gone.
pub async fn forward_pings(
    mut reader: PingTailReader,
    tx: mpsc::Sender<Delivery>,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    if let Err(e) = reader.start().await {
        log::error!("❌ Cannot open ping source {}: {}", reader.path().display(), e);
        return 0;
    }

    let mut forwarded = 0u64;
    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            line = reader.read_line() => {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        log::error!("❌ Ping source read failed: {}", e);
                        break;
                    }
                };
                // A full channel must not hold up shutdown
                tokio::select! {
                    sent = tx.send(Delivery::unacknowledged(line)) => {
                        if sent.is_err() {
                            break;
                        }
                        forwarded += 1;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            _ = tx.closed() => break,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    log::info!("Ping source stopped after {} lines", forwarded);
    forwarded
}
