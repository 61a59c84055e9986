//* Shared worker state threaded through the control handlers
use crate::task::{MigrationTask, Vm};
use crate::watcher::Watcher;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const SYSINFO: &str = "/usr/bin/sysinfo";

#[derive(Debug)]
pub enum SetupError {
    AdminIp(String),
    Bind(String),
}

impl Display for SetupError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupError::AdminIp(s) => write!(f, "failed to resolve admin IP: {}", s),
            SetupError::Bind(s) => write!(f, "failed to bind control listener: {}", s),
        }
    }
}

impl std::error::Error for SetupError {}

/// Byte counters shared by the sync pipeline (writer) and the progress
/// watcher (reader). Plain atomics; there is one live sync per worker.
#[derive(Debug, Default)]
pub struct SyncProgress {
    current: AtomicU64,
    total: AtomicU64,
}

impl SyncProgress {
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    /// Refresh the bytes-sent counter. An estimate can undershoot the real
    /// stream size, so the total is raised whenever current passes it.
    pub fn update_current(&self, current: u64) {
        self.current.store(current, Ordering::Relaxed);
        if current > self.total.load(Ordering::Relaxed) {
            self.total.store(current, Ordering::Relaxed);
        }
    }

    /// Settle the counters after a fully successful sync so subscribers
    /// see current == total in the last broadcast.
    pub fn settle(&self) {
        self.current.store(self.total.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.current.store(0, Ordering::Relaxed);
        self.total.store(0, Ordering::Relaxed);
    }
}

/// Everything a control handler needs: the migration record, the VM
/// description, progress counters, the process-wide stop token and the
/// watcher singleton.
pub struct Worker {
    pub uuid: String,
    pub record: tokio::sync::Mutex<MigrationTask>,
    pub vm: Vm,
    pub progress: std::sync::Arc<SyncProgress>,
    pub stop: CancellationToken,
    pub watcher: tokio::sync::Mutex<Option<Watcher>>,
    pub sync_running: AtomicBool,
    /// Reserved throttle slot (bytes per second). Nothing sets it yet.
    pub rate_limit: Option<u64>,
}

impl Worker {
    pub fn new(uuid: String, record: MigrationTask, vm: Vm) -> Self {
        Worker {
            uuid,
            record: tokio::sync::Mutex::new(record),
            vm,
            progress: std::sync::Arc::new(SyncProgress::default()),
            stop: CancellationToken::new(),
            watcher: tokio::sync::Mutex::new(None),
            sync_running: AtomicBool::new(false),
            rate_limit: None,
        }
    }
}

/// Resolve the local management IP by asking the system inventory helper.
pub async fn admin_ip() -> Result<String, SetupError> {
    let output = Command::new(SYSINFO)
        .output()
        .await
        .map_err(|e| SetupError::AdminIp(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(SetupError::AdminIp(stderr.trim().to_string()));
    }

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    parse_admin_ip(&stdout).ok_or_else(|| SetupError::AdminIp("no Admin IP in sysinfo output".to_string()))
}

fn parse_admin_ip(sysinfo_json: &str) -> Option<String> {
    let parsed: serde_json::Value = serde_json::from_str(sysinfo_json).ok()?;
    parsed
        .get("Admin IP")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
}
