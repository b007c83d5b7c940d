//! Local stand-in for the managed stream: one JSON-lines file per shard, each
//! line one record payload. The 1-based line number is the record's sequence
//! number. Lines are taken as raw bytes, so a line that is not valid UTF-8
//! reaches the processor and fails to decode like any other bad payload.

use std::io;
use std::path::{Path, PathBuf};

use lib_analytics::RawRecord;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

pub const SHARD_FILE_EXTENSION: &str = "jsonl";

pub fn shard_path(replay_dir: &Path, shard_id: &str) -> PathBuf {
    replay_dir.join(format!("{shard_id}.{SHARD_FILE_EXTENSION}"))
}

/// Shard ids present in `replay_dir`, sorted.
pub async fn discover_shards(replay_dir: &Path) -> io::Result<Vec<String>> {
    let mut shards = Vec::new();
    let mut entries = tokio::fs::read_dir(replay_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == SHARD_FILE_EXTENSION) {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                shards.push(stem.to_string());
            }
        }
    }
    shards.sort();
    Ok(shards)
}

pub struct ShardReplay {
    shard_id: String,
    reader: BufReader<File>,
    line_number: u64,
}

impl ShardReplay {
    /// Opens the shard file and skips everything up to and including
    /// `resume_after`.
    pub async fn open(replay_dir: &Path, shard_id: &str, resume_after: Option<u64>) -> io::Result<Self> {
        let file = File::open(shard_path(replay_dir, shard_id)).await?;
        let mut replay = Self {
            shard_id: shard_id.to_string(),
            reader: BufReader::new(file),
            line_number: 0,
        };

        let skip = resume_after.unwrap_or(0);
        while replay.line_number < skip {
            if replay.read_line().await?.is_none() {
                break;
            }
            replay.line_number += 1;
        }
        if skip > 0 {
            log::info!("action=replay-resume shard={} after={}", shard_id, replay.line_number);
        }
        Ok(replay)
    }

    /// Next batch of at most `max_records` records. Empty at end of file.
    /// Blank lines are skipped but still consume a sequence number.
    pub async fn next_batch(&mut self, max_records: usize) -> io::Result<Vec<RawRecord>> {
        let mut batch = Vec::new();
        while batch.len() < max_records {
            let Some(line) = self.read_line().await? else {
                break;
            };
            self.line_number += 1;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            batch.push(RawRecord::new(
                self.line_number.to_string(),
                self.shard_id.clone(),
                line,
            ));
        }
        Ok(batch)
    }

    /// One line without its terminator, or `None` at end of file.
    async fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        if self.reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(None);
        }
        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }
        Ok(Some(line))
    }

    pub fn position(&self) -> u64 {
        self.line_number
    }
}
