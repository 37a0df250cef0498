use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;

use crate::prelude::*;
use crate::process::{ProcessRecord, ProcessSource};

pub const POLLING_INTERVAL: Duration = Duration::from_secs(1);

/// Signatures already written to the log.
///
/// In memory only and unbounded: the set grows for the life of the
/// run, and a restart re-logs every process currently running.
#[derive(Debug, Default)]
pub struct SeenSignatures(HashSet<String>);

impl SeenSignatures {
    pub fn contains(&self, signature: &str) -> bool {
        self.0.contains(signature)
    }

    /// Returns true when the signature was not known before.
    pub fn insert(&mut self, signature: String) -> bool {
        self.0.insert(signature)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Owns the run's log file, the deduplication set and the snapshot
/// source. One writer, one poller; nothing here is shared.
pub struct Monitor {
    source: Box<dyn ProcessSource>,
    seen: SeenSignatures,
    log_file: File,
    log_path: PathBuf,
}

impl Monitor {
    /// Opens the run's log file, writes a full snapshot to it and
    /// seeds the deduplication set from that snapshot.
    ///
    /// The file is named after the startup timestamp and stays the
    /// run's only log file; there is no mid-run rotation.
    pub async fn start(source: Box<dyn ProcessSource>, log_dir: &Path) -> Result<Self> {
        let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let log_path = log_dir.join(format!("processes-{timestamp}.log"));
        let log_file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&log_path)
            .await
            .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

        let mut monitor = Monitor {
            source,
            seen: SeenSignatures::default(),
            log_file,
            log_path,
        };

        let lines: Vec<String> = monitor
            .take_snapshot()
            .iter()
            .map(ProcessRecord::signature)
            .collect();
        monitor.append_lines(&lines).await?;
        for line in lines {
            monitor.seen.insert(line);
        }

        info!("Logging new processes to {}", monitor.log_path.display());
        Ok(monitor)
    }

    /// Polls until externally terminated or a log write fails. A
    /// failed write is fatal; there is no retry and no supervisor.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            sleep(POLLING_INTERVAL).await;
            let appended = self.poll_once().await?;
            if appended > 0 {
                debug!("Logged {} new processes", appended);
            }
        }
    }

    /// One snapshot-diff-append cycle. Returns the number of newly
    /// logged signatures.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let mut new_lines = Vec::new();
        for record in self.take_snapshot() {
            let signature = record.signature();
            if !self.seen.contains(&signature) {
                self.seen.insert(signature.clone());
                new_lines.push(signature);
            }
        }

        if !new_lines.is_empty() {
            self.append_lines(&new_lines).await?;
        }

        Ok(new_lines.len())
    }

    /// A snapshot failure only costs the current cycle.
    fn take_snapshot(&mut self) -> Vec<ProcessRecord> {
        match self.source.snapshot() {
            Ok(records) => records,
            Err(err) => {
                warn!("Failed to read the process table: {}", err);
                Vec::new()
            }
        }
    }

    async fn append_lines(&mut self, lines: &[String]) -> Result<()> {
        let mut chunk = String::new();
        for line in lines {
            chunk.push_str(line);
            chunk.push('\n');
        }

        self.log_file
            .write_all(chunk.as_bytes())
            .await
            .with_context(|| format!("Failed to write to log file {}", self.log_path.display()))?;
        self.log_file
            .flush()
            .await
            .with_context(|| format!("Failed to write to log file {}", self.log_path.display()))?;

        Ok(())
    }

    #[cfg(test)]
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    struct ScriptedSource {
        snapshots: VecDeque<Vec<ProcessRecord>>,
    }

    impl ScriptedSource {
        fn new(snapshots: Vec<Vec<ProcessRecord>>) -> Box<Self> {
            Box::new(ScriptedSource {
                snapshots: snapshots.into(),
            })
        }
    }

    impl ProcessSource for ScriptedSource {
        fn snapshot(&mut self) -> Result<Vec<ProcessRecord>> {
            self.snapshots
                .pop_front()
                .ok_or_else(|| anyhow!("script exhausted"))
        }
    }

    fn record(username: &str, pid: u32, ppid: u32, create_time: &str, cmdline: &str) -> ProcessRecord {
        ProcessRecord {
            username: username.to_string(),
            pid,
            ppid,
            create_time: create_time.to_string(),
            cmdline: cmdline.to_string(),
        }
    }

    fn init() -> ProcessRecord {
        record("root", 1, 0, "2025-01-01 00:00:00", "/sbin/init")
    }

    #[tokio::test]
    async fn test_initial_snapshot_is_written_and_seeded() {
        let dir = TempDir::new().unwrap();
        let source = ScriptedSource::new(vec![vec![init()]]);

        let monitor = Monitor::start(source, dir.path()).await.unwrap();

        let contents = tokio::fs::read_to_string(monitor.log_path()).await.unwrap();
        assert_eq!(contents, "root 1 0 2025-01-01 00:00:00 /sbin/init\n");
        assert_eq!(monitor.seen.len(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_poll_appends_nothing() {
        let dir = TempDir::new().unwrap();
        let source = ScriptedSource::new(vec![vec![init()], vec![init()]]);

        let mut monitor = Monitor::start(source, dir.path()).await.unwrap();
        let appended = monitor.poll_once().await.unwrap();

        assert_eq!(appended, 0);
        let contents = tokio::fs::read_to_string(monitor.log_path()).await.unwrap();
        assert_eq!(contents, "root 1 0 2025-01-01 00:00:00 /sbin/init\n");
    }

    #[tokio::test]
    async fn test_superset_snapshot_appends_only_the_new_lines_in_order() {
        let dir = TempDir::new().unwrap();
        let sshd = record("root", 42, 1, "2025-01-01 00:00:01", "/usr/sbin/sshd -D");
        let cron = record("root", 43, 1, "2025-01-01 00:00:02", "/usr/sbin/cron -f");
        let source = ScriptedSource::new(vec![
            vec![init()],
            vec![init(), sshd.clone(), cron.clone()],
        ]);

        let mut monitor = Monitor::start(source, dir.path()).await.unwrap();
        let appended = monitor.poll_once().await.unwrap();

        assert_eq!(appended, 2);
        assert_eq!(monitor.seen.len(), 3);
        let contents = tokio::fs::read_to_string(monitor.log_path()).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines,
            vec![
                "root 1 0 2025-01-01 00:00:00 /sbin/init",
                "root 42 1 2025-01-01 00:00:01 /usr/sbin/sshd -D",
                "root 43 1 2025-01-01 00:00:02 /usr/sbin/cron -f",
            ]
        );
    }

    #[tokio::test]
    async fn test_identical_signature_is_never_logged_twice() {
        let dir = TempDir::new().unwrap();
        let source = ScriptedSource::new(vec![
            vec![init()],
            vec![init()],
            vec![init()],
            vec![init()],
        ]);

        let mut monitor = Monitor::start(source, dir.path()).await.unwrap();
        for _ in 0..3 {
            assert_eq!(monitor.poll_once().await.unwrap(), 0);
        }

        let contents = tokio::fs::read_to_string(monitor.log_path()).await.unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_changed_cmdline_is_a_new_signature() {
        let dir = TempDir::new().unwrap();
        let execd = record("root", 1, 0, "2025-01-01 00:00:00", "/sbin/init --replaced");
        let source = ScriptedSource::new(vec![vec![init()], vec![execd.clone()]]);

        let mut monitor = Monitor::start(source, dir.path()).await.unwrap();
        let appended = monitor.poll_once().await.unwrap();

        assert_eq!(appended, 1);
        let contents = tokio::fs::read_to_string(monitor.log_path()).await.unwrap();
        assert!(contents.contains("/sbin/init --replaced"));
    }

    #[tokio::test]
    async fn test_failed_snapshot_is_treated_as_empty() {
        let dir = TempDir::new().unwrap();
        // The script runs out after the initial snapshot.
        let source = ScriptedSource::new(vec![vec![init()]]);

        let mut monitor = Monitor::start(source, dir.path()).await.unwrap();
        let appended = monitor.poll_once().await.unwrap();

        assert_eq!(appended, 0);
        assert_eq!(monitor.seen.len(), 1);
    }

    #[tokio::test]
    async fn test_log_file_is_named_after_the_startup_timestamp() {
        let dir = TempDir::new().unwrap();
        let source = ScriptedSource::new(vec![vec![]]);

        let monitor = Monitor::start(source, dir.path()).await.unwrap();

        let name = monitor.log_path().file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("processes-"));
        assert!(name.ends_with(".log"));
    }

    #[test]
    fn test_seen_signatures_set_semantics() {
        let mut seen = SeenSignatures::default();
        assert!(seen.is_empty());
        assert!(seen.insert("a".to_string()));
        assert!(!seen.insert("a".to_string()));
        assert!(seen.contains("a"));
        assert!(!seen.contains("b"));
        assert_eq!(seen.len(), 1);
    }
}
