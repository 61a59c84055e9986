//* A thin wrapper around the zfs command line tool
use crate::{SNAPSHOT_SEPARATOR, snapshot_sequence};
use std::fmt::{Display, Formatter};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

const ZFS: &str = "/usr/sbin/zfs";

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const ESTIMATE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

// Stderr from a send process can run to megabytes on a broken pool; keep
// the first and last windows only.
const STDERR_WINDOW: usize = 2500;

#[derive(Debug)]
pub enum ZfsError {
    CommandError(String),
    ChildError,
    Timeout(String),
    EstimateUnavailable,
}

impl Display for ZfsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ZfsError::CommandError(s) => write!(f, "ZFS command error: {}", s),
            ZfsError::ChildError => write!(f, "Failed to spawn ZFS child process"),
            ZfsError::Timeout(stage) => write!(f, "ZFS command timed out: {}", stage),
            ZfsError::EstimateUnavailable => write!(f, "unable to get send estimate"),
        }
    }
}

impl std::error::Error for ZfsError {}

/// List migration snapshots of a dataset, sorted by sequence number.
/// Returns short names only (the part after `@`). Snapshots outside the
/// migration naming scheme are ignored.
pub async fn list_sync_snapshots(
    dataset: &str,
) -> Result<Vec<String>, Box<dyn std::error::Error + Send + Sync>> {
    let output = Command::new(ZFS)
        .arg("list")
        .arg("-H")
        .arg("-r")
        .arg("-d")
        .arg("1")
        .arg("-t")
        .arg("snapshot")
        .arg("-o")
        .arg("name")
        .arg(dataset)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(ZfsError::CommandError(format!("zfs list: {}", stderr.trim())).into());
    }

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    Ok(parse_snapshot_list(&stdout, dataset))
}

fn parse_snapshot_list(stdout: &str, dataset: &str) -> Vec<String> {
    let mut names: Vec<String> = stdout
        .lines()
        .map(str::trim)
        .filter_map(|line| {
            let (ds, short) = line.split_once(SNAPSHOT_SEPARATOR)?;
            if ds != dataset {
                return None;
            }
            snapshot_sequence(short).map(|_| short.to_string())
        })
        .collect();
    names.sort_by_key(|short| snapshot_sequence(short));
    names
}

/// Create a recursive snapshot `<dataset>@<short_name>`.
pub async fn create_snapshot(
    dataset: &str,
    short_name: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let name = format!("{dataset}{SNAPSHOT_SEPARATOR}{short_name}");
    let run = Command::new(ZFS)
        .arg("snapshot")
        .arg("-r")
        .arg(&name)
        .output();

    let output = tokio::time::timeout(SNAPSHOT_TIMEOUT, run)
        .await
        .map_err(|_| ZfsError::Timeout(format!("zfs snapshot {}", name)))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(ZfsError::CommandError(format!(
            "zfs snapshot {}: {}",
            name,
            stderr.trim()
        ))
        .into());
    }
    Ok(())
}

/// Dry-run the given send invocation and return the byte estimate.
/// - `send_args`: the exact argument list a real send would use.
pub async fn estimate_send_size(
    send_args: &[String],
) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
    let run = Command::new(ZFS)
        .args(send_args)
        .arg("--dryrun")
        .arg("--parsable")
        .output();

    let output = tokio::time::timeout(ESTIMATE_TIMEOUT, run)
        .await
        .map_err(|_| ZfsError::Timeout("zfs send --dryrun".to_string()))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(ZfsError::CommandError(format!(
            "zfs send --dryrun: {}",
            stderr.trim()
        ))
        .into());
    }

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    parse_send_estimate(&stdout).ok_or_else(|| ZfsError::EstimateUnavailable.into())
}

fn parse_send_estimate(stdout: &str) -> Option<u64> {
    let line = stdout.lines().rev().find(|l| !l.trim().is_empty())?;
    let mut fields = line.split_whitespace();
    if fields.next() != Some("size") {
        return None;
    }
    let size: u64 = fields.next()?.parse().ok()?;
    Some(size)
}

/// Sliding window over a child's stderr: the first and last
/// `STDERR_WINDOW` bytes, with an ellipsis marking the elided middle.
#[derive(Debug, Default)]
pub struct StderrWindow {
    head: Vec<u8>,
    tail: Vec<u8>,
    elided: bool,
}

impl StderrWindow {
    fn push(&mut self, chunk: &[u8]) {
        let mut chunk = chunk;
        if self.head.len() < STDERR_WINDOW {
            let take = (STDERR_WINDOW - self.head.len()).min(chunk.len());
            self.head.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];
        }
        if chunk.is_empty() {
            return;
        }
        self.tail.extend_from_slice(chunk);
        if self.tail.len() > STDERR_WINDOW {
            let drop = self.tail.len() - STDERR_WINDOW;
            self.tail.drain(..drop);
            self.elided = true;
        }
    }

    pub fn excerpt(&self) -> String {
        let head = String::from_utf8_lossy(&self.head);
        if self.tail.is_empty() {
            return head.trim().to_string();
        }
        let tail = String::from_utf8_lossy(&self.tail);
        let sep = if self.elided { " ... " } else { "" };
        format!("{}{}{}", head, sep, tail).trim().to_string()
    }
}

/// A running `zfs send`, stdout exposed as a byte stream.
pub struct SendStream {
    child: Child,
    stderr_window: Arc<Mutex<StderrWindow>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl SendStream {
    /// Spawn `zfs <send_args...>` with piped stdout and stderr. Stderr is
    /// drained in the background so a chatty send can never block on it.
    pub fn spawn(send_args: &[String]) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let mut child = Command::new(ZFS)
            .args(send_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stderr = child.stderr.take().ok_or(ZfsError::ChildError)?;
        let stderr_window = Arc::new(Mutex::new(StderrWindow::default()));
        let window = Arc::clone(&stderr_window);
        let stderr_task = tokio::spawn(async move {
            let mut stderr = stderr;
            let mut buf = [0u8; 4096];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Ok(mut w) = window.lock() {
                            w.push(&buf[..n]);
                        }
                    }
                }
            }
        });

        Ok(SendStream {
            child,
            stderr_window,
            stderr_task: Some(stderr_task),
        })
    }

    pub fn stdout(&mut self) -> Result<ChildStdout, Box<dyn std::error::Error + Send + Sync>> {
        self.child.stdout.take().ok_or_else(|| ZfsError::ChildError.into())
    }

    /// Wait for the send process to exit. Status zero is necessary but not
    /// sufficient for a successful sync; the receiver must also confirm.
    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        let status = self.child.wait().await;
        if let Some(task) = self.stderr_task.take() {
            let _ = task.await;
        }
        status
    }

    pub fn stderr_excerpt(&self) -> String {
        self.stderr_window
            .lock()
            .map(|w| w.excerpt())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod test_zfs {
    use super::*;

    #[test]
    fn snapshot_list_sorts_numerically() {
        let stdout = "zones/X@vm-migration-2\nzones/X@vm-migration-10\nzones/X@vm-migration-1\n";
        assert_eq!(
            parse_snapshot_list(stdout, "zones/X"),
            vec!["vm-migration-1", "vm-migration-2", "vm-migration-10"]
        );
    }

    #[test]
    fn snapshot_list_drops_foreign_snapshots_and_children() {
        let stdout = "\
zones/X@vm-migration-1
zones/X@daily-2024-01-01
zones/X/data@vm-migration-1
zones/X@vm-migration-3
";
        assert_eq!(
            parse_snapshot_list(stdout, "zones/X"),
            vec!["vm-migration-1", "vm-migration-3"]
        );
    }

    #[test]
    fn estimate_takes_last_nonempty_line() {
        let stdout = "incremental\tvm-migration-1\tzones/X@vm-migration-2\t1024\nsize\t4096\n\n";
        assert_eq!(parse_send_estimate(stdout), Some(4096));
    }

    #[test]
    fn estimate_rejects_unexpected_output() {
        assert_eq!(parse_send_estimate(""), None);
        assert_eq!(parse_send_estimate("cannot open 'zones/X'"), None);
        assert_eq!(parse_send_estimate("size notanumber"), None);
    }

    #[test]
    fn stderr_window_keeps_both_ends() {
        let mut w = StderrWindow::default();
        w.push(&vec![b'a'; 2500]);
        w.push(&vec![b'b'; 5000]);
        w.push(&vec![b'c'; 2500]);
        let excerpt = w.excerpt();
        assert!(excerpt.starts_with("aaaa"));
        assert!(excerpt.ends_with("cccc"));
        assert!(excerpt.contains(" ... "));
        assert_eq!(excerpt.len(), 2500 + 5 + 2500);
    }

    #[test]
    fn stderr_window_short_output_is_verbatim() {
        let mut w = StderrWindow::default();
        w.push(b"cannot open 'zones/X': dataset does not exist\n");
        assert_eq!(w.excerpt(), "cannot open 'zones/X': dataset does not exist");
    }
}
