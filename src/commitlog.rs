//! Write-ahead commit log
//!
//! Accepted writes are framed into segmented log files before the reply
//! goes out. Each entry carries a monotone sequence number and a crc32
//! over its payload; replay stops at the first corrupt frame, so a torn
//! tail write loses at most the final entry.

use crate::error::{Error, Result};
use crate::model::Record;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const MAGIC: &[u8; 4] = b"TGCL";
const VERSION: u8 = 1;
const HEADER_LEN: u64 = 5;
const FRAME_HEADER_LEN: usize = 16;
const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".log";

/// Commit log configuration.
#[derive(Debug, Clone)]
pub struct CommitLogConfig {
    /// Directory for segment files.
    pub dir: PathBuf,
    /// Maximum segment size before rotation.
    pub max_segment_size: u64,
}

impl CommitLogConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_segment_size: 64 * 1024 * 1024,
        }
    }
}

/// One logged write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitEntry {
    pub db: String,
    pub namespace: String,
    pub metric: String,
    pub record: Record,
}

/// Segmented write-ahead commit log.
#[derive(Debug)]
pub struct CommitLog {
    config: CommitLogConfig,
    segment_id: u64,
    segment_size: u64,
    file: fs::File,
    next_seq: u64,
}

impl CommitLog {
    /// Open or create the commit log under the configured directory.
    pub fn open(config: CommitLogConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let segments = list_segments(&config.dir)?;
        let (segment_id, path) = match segments.last() {
            Some((id, path)) => (*id, path.clone()),
            None => (1, config.dir.join(segment_name(1))),
        };

        let mut next_seq = 1;
        for (_, segment_path) in &segments {
            for (seq, _) in read_frames(segment_path)? {
                next_seq = next_seq.max(seq + 1);
            }
        }

        let exists = path.exists();
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        if !exists || file.metadata()?.len() == 0 {
            file.write_all(MAGIC)?;
            file.write_all(&[VERSION])?;
            file.sync_data()?;
        }
        let segment_size = file.metadata()?.len();
        debug!(segment_id, next_seq, dir = %config.dir.display(), "commit log opened");

        Ok(Self {
            config,
            segment_id,
            segment_size,
            file,
            next_seq,
        })
    }

    /// Append one entry, returning its sequence number. The frame is
    /// fsynced before returning, preserving write-ahead order.
    pub fn append(&mut self, entry: &CommitEntry) -> Result<u64> {
        if self.segment_size >= self.config.max_segment_size {
            self.rotate()?;
        }

        let payload = serde_json::to_vec(entry)?;
        let seq = self.next_seq;
        let crc = crc32fast::hash(&payload);

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&seq.to_be_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&crc.to_be_bytes());
        frame.extend_from_slice(&payload);

        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        self.segment_size += frame.len() as u64;
        self.next_seq += 1;
        Ok(seq)
    }

    /// Replay all entries across segments in sequence order.
    pub fn entries(&self) -> Result<Vec<(u64, CommitEntry)>> {
        let mut entries = Vec::new();
        for (_, path) in list_segments(&self.config.dir)? {
            for (seq, payload) in read_frames(&path)? {
                match serde_json::from_slice::<CommitEntry>(&payload) {
                    Ok(entry) => entries.push((seq, entry)),
                    Err(err) => {
                        warn!(seq, %err, "skipping undecodable commit log entry");
                    }
                }
            }
        }
        Ok(entries)
    }

    /// The sequence number the next append will receive.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Drop closed segments whose entries all precede `seq`. The active
    /// segment is never removed.
    pub fn truncate_before(&mut self, seq: u64) -> Result<usize> {
        let mut removed = 0;
        for (id, path) in list_segments(&self.config.dir)? {
            if id >= self.segment_id {
                continue;
            }
            let max_seq = read_frames(&path)?.last().map(|(s, _)| *s);
            if max_seq.map_or(true, |s| s < seq) {
                fs::remove_file(&path)?;
                removed += 1;
                debug!(segment = id, "commit log segment truncated");
            }
        }
        Ok(removed)
    }

    fn rotate(&mut self) -> Result<()> {
        self.segment_id += 1;
        let path = self.config.dir.join(segment_name(self.segment_id));
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(MAGIC)?;
        file.write_all(&[VERSION])?;
        file.sync_data()?;
        self.segment_size = file.metadata()?.len();
        self.file = file;
        debug!(segment_id = self.segment_id, "commit log segment rotated");
        Ok(())
    }
}

fn segment_name(id: u64) -> String {
    format!("{SEGMENT_PREFIX}{id:010}{SEGMENT_SUFFIX}")
}

fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(id) = name
            .strip_prefix(SEGMENT_PREFIX)
            .and_then(|rest| rest.strip_suffix(SEGMENT_SUFFIX))
            .and_then(|raw| raw.parse::<u64>().ok())
        {
            segments.push((id, path));
        }
    }
    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}

fn read_frames(path: &Path) -> Result<Vec<(u64, Vec<u8>)>> {
    let mut file = fs::File::open(path)?;
    let mut header = [0u8; HEADER_LEN as usize];
    if file.read_exact(&mut header).is_err() {
        return Ok(Vec::new());
    }
    if &header[0..4] != MAGIC {
        return Err(Error::Corrupt(format!(
            "bad commit log magic in {}",
            path.display()
        )));
    }
    if header[4] != VERSION {
        return Err(Error::Corrupt(format!(
            "unsupported commit log version {} in {}",
            header[4],
            path.display()
        )));
    }

    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut frames = Vec::new();
    let mut offset = 0usize;
    while offset + FRAME_HEADER_LEN <= buf.len() {
        let seq = u64::from_be_bytes(buf[offset..offset + 8].try_into().expect("slice length"));
        let len = u32::from_be_bytes(buf[offset + 8..offset + 12].try_into().expect("slice length")) as usize;
        let crc = u32::from_be_bytes(buf[offset + 12..offset + 16].try_into().expect("slice length"));
        let start = offset + FRAME_HEADER_LEN;
        if start + len > buf.len() {
            warn!(path = %path.display(), seq, "truncated commit log frame, stopping replay");
            break;
        }
        let payload = &buf[start..start + len];
        if crc32fast::hash(payload) != crc {
            warn!(path = %path.display(), seq, "crc mismatch, stopping replay");
            break;
        }
        frames.push((seq, payload.to_vec()));
        offset = start + len;
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(metric: &str, ts: i64) -> CommitEntry {
        CommitEntry {
            db: "db".into(),
            namespace: "ns".into(),
            metric: metric.into(),
            record: Record::new(ts, 1i64).with_tag("name", "John"),
        }
    }

    #[test]
    fn append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = CommitLog::open(CommitLogConfig::new(dir.path())).unwrap();

        let a = log.append(&entry("people", 2)).unwrap();
        let b = log.append(&entry("people", 4)).unwrap();
        assert!(b > a);

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1.record.timestamp, 2);
        assert_eq!(entries[1].1.record.timestamp, 4);
    }

    #[test]
    fn sequence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = CommitLog::open(CommitLogConfig::new(dir.path())).unwrap();
            log.append(&entry("people", 2)).unwrap();
        }
        let log = CommitLog::open(CommitLogConfig::new(dir.path())).unwrap();
        assert_eq!(log.next_seq(), 2);
    }

    #[test]
    fn torn_tail_stops_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path;
        {
            let mut log = CommitLog::open(CommitLogConfig::new(dir.path())).unwrap();
            log.append(&entry("people", 2)).unwrap();
            path = dir.path().join(segment_name(1));
        }
        // chop a few bytes off the tail
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        let mut tail = fs::OpenOptions::new().append(true).open(&path).unwrap();
        tail.write_all(&9u64.to_be_bytes()).unwrap();

        let log = CommitLog::open(CommitLogConfig::new(dir.path())).unwrap();
        assert!(log.entries().unwrap().is_empty());
    }

    #[test]
    fn rotation_starts_a_new_segment() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CommitLogConfig::new(dir.path());
        config.max_segment_size = 64;
        let mut log = CommitLog::open(config).unwrap();
        for ts in 0..5 {
            log.append(&entry("people", ts)).unwrap();
        }
        assert!(list_segments(dir.path()).unwrap().len() > 1);
        assert_eq!(log.entries().unwrap().len(), 5);
    }

    #[test]
    fn truncation_drops_only_closed_old_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CommitLogConfig::new(dir.path());
        config.max_segment_size = 64;
        let mut log = CommitLog::open(config).unwrap();
        for ts in 0..5 {
            log.append(&entry("people", ts)).unwrap();
        }
        let before = list_segments(dir.path()).unwrap().len();

        let removed = log.truncate_before(log.next_seq()).unwrap();
        assert!(removed > 0);
        assert_eq!(list_segments(dir.path()).unwrap().len(), before - removed);
        // the active segment survives and stays appendable
        log.append(&entry("people", 9)).unwrap();
    }
}
