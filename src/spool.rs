//! A last-resort write-ahead file for payloads whose publish retries ran
//! out.
//!
//! One UTF-8 record per line. A replay pass feeds every record to a send
//! callback and rewrites the file with only the records that still failed,
//! so the file drains as the broker recovers.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

const REPLAY_INTERVAL: Duration = Duration::from_secs(30);

/// An append-only line file guarded by an instance mutex.
pub struct Spool {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Spool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record, creating the file on first use.
    pub fn append(&self, record: &str) -> io::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)?;
        writeln!(file, "{record}")
    }

    /// Feed every spooled record to `send` and keep only the ones it could
    /// not deliver. `send` returns `true` when a record was sent.
    ///
    /// A missing spool file means there is nothing to replay.
    pub fn replay<F>(&self, mut send: F) -> io::Result<()>
    where
        F: FnMut(&str) -> bool,
    {
        let _guard = self.lock.lock().unwrap();
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        let remaining: Vec<&str> = contents
            .lines()
            .filter(|line| !line.is_empty())
            .filter(|line| !send(line))
            .collect();
        let rewritten = if remaining.is_empty() {
            String::new()
        } else {
            remaining.join("\n") + "\n"
        };
        fs::write(&self.path, rewritten)
    }

    /// Replay the spool every 30 seconds until the task is dropped.
    pub async fn run_replay<F>(&self, mut send: F)
    where
        F: FnMut(&str) -> bool + Send,
    {
        loop {
            tokio::time::sleep(REPLAY_INTERVAL).await;
            debug!(path = %self.path.display(), "replaying spool");
            if let Err(e) = self.replay(&mut send) {
                warn!(error = %e, path = %self.path.display(), "spool replay failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn scratch_spool() -> Spool {
        Spool::new(std::env::temp_dir().join(format!("burrow-spool-{}.txt", Uuid::new_v4())))
    }

    #[test]
    fn append_writes_one_record_per_line() {
        let spool = scratch_spool();

        spool.append("first").unwrap();
        spool.append("second").unwrap();

        let contents = fs::read_to_string(spool.path()).unwrap();
        assert_eq!(contents, "first\nsecond\n");
        fs::remove_file(spool.path()).unwrap();
    }

    #[test]
    fn replay_drops_sent_records_and_keeps_failed_ones() {
        let spool = scratch_spool();
        spool.append("keep").unwrap();
        spool.append("send").unwrap();
        spool.append("send-too").unwrap();

        let mut seen = Vec::new();
        spool
            .replay(|record| {
                seen.push(record.to_owned());
                record != "keep"
            })
            .unwrap();

        assert_eq!(seen, vec!["keep", "send", "send-too"]);
        let contents = fs::read_to_string(spool.path()).unwrap();
        assert_eq!(contents, "keep\n");
        fs::remove_file(spool.path()).unwrap();
    }

    #[test]
    fn replay_of_a_missing_file_is_a_no_op() {
        let spool = scratch_spool();

        spool.replay(|_| true).unwrap();

        assert!(!spool.path().exists());
    }

    #[test]
    fn replay_that_sends_everything_empties_the_file() {
        let spool = scratch_spool();
        spool.append("a").unwrap();
        spool.append("b").unwrap();

        spool.replay(|_| true).unwrap();

        assert_eq!(fs::read_to_string(spool.path()).unwrap(), "");
        fs::remove_file(spool.path()).unwrap();
    }
}
