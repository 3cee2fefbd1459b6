// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Append-only per-room JSONL log. Line position is the room's dense
//! `index` space, per the persisted-state contract in the wire schema.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use relay_proto::Post;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from reading or writing a room's log file.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A stored line wasn't valid JSON (the log file was corrupted or hand-edited).
    #[error("corrupt log entry at line {line}: {source}")]
    Corrupt {
        /// 0-based line number of the bad entry.
        line: u64,
        /// Underlying parse failure.
        source: serde_json::Error,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct LogEntry {
    server_time: i64,
    client_time: i64,
    name: String,
    data: serde_json::Value,
}

/// One append-only log file per room, opened lazily on first use.
pub struct RoomLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl RoomLog {
    /// Opens (creating if absent) `<data_dir>/<room>.jsonl`.
    ///
    /// # Errors
    /// Propagates I/O failures opening or creating the file.
    pub fn open(data_dir: &Path, room: &str) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(format!("{room}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Appends one post body, returning its assigned (dense) index.
    ///
    /// # Errors
    /// Propagates I/O failures while counting existing lines or appending.
    pub fn append(
        &self,
        server_time: i64,
        client_time: i64,
        name: String,
        data: serde_json::Value,
    ) -> Result<u64, StoreError> {
        let mut file = self.file.lock().unwrap();
        let index = Self::count_lines(&mut file)?;

        let entry = LogEntry {
            server_time,
            client_time,
            name,
            data,
        };
        let mut line = serde_json::to_string(&entry).map_err(|e| StoreError::Corrupt { line: index, source: e })?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(index)
    }

    fn count_lines(file: &mut File) -> Result<u64, StoreError> {
        file.seek(SeekFrom::Start(0))?;
        let mut count = 0u64;
        let mut buf = [0u8; 8192];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            count += buf[..n].iter().filter(|&&b| b == b'\n').count() as u64;
        }
        file.seek(SeekFrom::End(0))?;
        Ok(count)
    }

    /// Reads every post from `index = from` onward.
    ///
    /// # Errors
    /// Propagates I/O failures or a corrupt log line.
    pub fn read_from(&self, room: &str, from: u64) -> Result<Vec<Post>, StoreError> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(0))?;
        let reader = BufReader::new(&mut *file);

        let mut posts = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let index = i as u64;
            if index < from {
                continue;
            }
            let entry: LogEntry = serde_json::from_str(&line)
                .map_err(|e| StoreError::Corrupt { line: index, source: e })?;
            posts.push(Post {
                room: room.to_string(),
                index,
                server_time: entry.server_time,
                client_time: entry.client_time,
                name: entry.name,
                data: entry.data,
            });
        }
        file.seek(SeekFrom::End(0))?;
        Ok(posts)
    }

    /// Path of the backing file, for diagnostics.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn append_assigns_dense_sequential_indices() {
        let dir = tempfile::tempdir().unwrap();
        let log = RoomLog::open(dir.path(), "lobby").unwrap();
        let i0 = log.append(100, 100, "a".into(), json!(1)).unwrap();
        let i1 = log.append(200, 200, "b".into(), json!(2)).unwrap();
        assert_eq!(i0, 0);
        assert_eq!(i1, 1);
    }

    #[test]
    fn read_from_filters_by_index_and_round_trips_data() {
        let dir = tempfile::tempdir().unwrap();
        let log = RoomLog::open(dir.path(), "lobby").unwrap();
        log.append(100, 100, "a".into(), json!({"x": 1})).unwrap();
        log.append(200, 200, "b".into(), json!({"x": 2})).unwrap();
        log.append(300, 300, "c".into(), json!({"x": 3})).unwrap();

        let all = log.read_from("lobby", 0).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].index, 0);
        assert_eq!(all[0].name, "a");

        let tail = log.read_from("lobby", 1).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].name, "b");
    }

    #[test]
    fn log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = RoomLog::open(dir.path(), "lobby").unwrap();
            log.append(1, 1, "a".into(), json!(null)).unwrap();
        }
        let log = RoomLog::open(dir.path(), "lobby").unwrap();
        let i1 = log.append(2, 2, "b".into(), json!(null)).unwrap();
        assert_eq!(i1, 1);
    }
}
