//* Records exchanged with the parent supervisor and dataset bookkeeping
use serde::{Deserialize, Serialize};

/// One past phase transition in the migration's history, as recorded by the
/// supervisor. Only `phase == "sync"` entries matter to this worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub phase: String,
    pub state: String,
}

pub const STATE_SUCCESS: &str = "success";
pub const STATE_RUNNING: &str = "running";
pub const STATE_WARNING: &str = "warning";

/// The migration record handed in by the supervisor. Immutable for the
/// duration of one sync command except for `num_sync_phases`, which is
/// advanced when a snapshot name collision forces skipping forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationTask {
    pub vm_uuid: String,
    pub target_vm_uuid: String,
    #[serde(default)]
    pub progress_history: Vec<ProgressEntry>,
    #[serde(default)]
    pub num_sync_phases: u64,
}

impl MigrationTask {
    /// Map a source dataset name to the name used on the target node.
    /// When the migration renames the VM, the source uuid substring is
    /// replaced by the target uuid; otherwise the name passes through.
    pub fn target_dataset(&self, dataset: &str) -> String {
        if self.vm_uuid != self.target_vm_uuid {
            dataset.replace(&self.vm_uuid, &self.target_vm_uuid)
        } else {
            dataset.to_string()
        }
    }

    /// Past sync phases that count towards resumability decisions.
    /// Warning states are bookkeeping noise and are skipped.
    pub fn sync_history(&self) -> Vec<&ProgressEntry> {
        self.progress_history
            .iter()
            .filter(|e| e.phase == "sync" && e.state != STATE_WARNING)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disk {
    pub zfs_filesystem: String,
}

/// The subset of the VM description this worker consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    #[serde(default)]
    pub uuid: String,
    pub zfs_filesystem: String,
    pub brand: String,
    #[serde(default)]
    pub disks: Vec<Disk>,
}

impl Vm {
    /// Datasets to migrate, in lexical order.
    ///
    /// The root dataset is always included. KVM disks live on independent
    /// zvol roots next to the zone root, so each one is added as a peer;
    /// for every other brand the disks are children of the root and a
    /// single recursive send captures them.
    pub fn sync_datasets(&self) -> Vec<String> {
        let mut datasets = vec![self.zfs_filesystem.clone()];
        if self.brand == "kvm" {
            for disk in &self.disks {
                datasets.push(disk.zfs_filesystem.clone());
            }
        }
        datasets.sort();
        datasets
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationAction {
    pub action: String,
    pub record: MigrationTask,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupPayload {
    #[serde(rename = "migrationTask")]
    pub migration_task: MigrationAction,
    pub vm: Vm,
}

/// The single message received from the parent supervisor at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupMessage {
    pub req_id: String,
    pub uuid: String,
    #[serde(rename = "timeoutSeconds", default = "default_timeout")]
    pub timeout_seconds: u64,
    pub payload: StartupPayload,
}

fn default_timeout() -> u64 {
    60
}
