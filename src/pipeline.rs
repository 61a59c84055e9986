//* Per-dataset sync pipeline and the orchestrator driving it
//*
//* Every dataset passes through two stages, each on a fresh receiver-link:
//* Collect (negotiate resumability, snapshot, estimate) and Stream (send
//* bytes, await confirmation). All Collects run before any Stream so the
//* transfer total is settled before user-visible progress starts moving.
use crate::link::ReceiverLink;
use crate::task::{MigrationTask, ProgressEntry, STATE_SUCCESS, Vm};
use crate::worker::SyncProgress;
use crate::zfs::{self, ZfsError};
use crate::{SNAPSHOT_SEPARATOR, snapshot_sequence, snapshot_short_name};
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const PROGRESS_TICK: Duration = Duration::from_millis(495);

/// Everything known about one dataset between Collect and Stream.
#[derive(Debug, Clone)]
pub struct DatasetContext {
    pub zfs_filesystem: String,
    pub target_filesystem: String,
    pub source_snapshot_names: Vec<String>,
    pub target_snapshot_names: Vec<String>,
    pub is_first_sync: bool,
    pub continue_last_sync: bool,
    pub token: Option<String>,
    pub prev_snapshot_name: String,
    pub snapshot_name: String,
    pub estimated_size: u64,
}

impl DatasetContext {
    /// The send invocation for this dataset. Deterministic: resuming a
    /// failed sync wins over everything, a first sync replicates the whole
    /// tree, anything else is an incremental between the previous and new
    /// migration snapshots.
    pub fn send_args(&self) -> Vec<String> {
        if self.continue_last_sync {
            if let Some(token) = &self.token {
                return vec!["send".to_string(), "-t".to_string(), token.clone()];
            }
        }
        if self.is_first_sync {
            vec![
                "send".to_string(),
                "--replicate".to_string(),
                format!(
                    "{}{}{}",
                    self.zfs_filesystem, SNAPSHOT_SEPARATOR, self.snapshot_name
                ),
            ]
        } else {
            vec![
                "send".to_string(),
                "-I".to_string(),
                format!(
                    "{}{}{}",
                    self.zfs_filesystem, SNAPSHOT_SEPARATOR, self.prev_snapshot_name
                ),
                format!(
                    "{}{}{}",
                    self.zfs_filesystem, SNAPSHOT_SEPARATOR, self.snapshot_name
                ),
            ]
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ResumePlan {
    is_first_sync: bool,
    continue_last_sync: bool,
}

/// Decide how to sync from the sync-phase history. The entry for the run
/// in progress is already present, so a single entry means nothing has
/// ever been synced; otherwise the second-to-last entry is the outcome of
/// the previous run.
fn resume_plan(sync_history: &[&ProgressEntry]) -> ResumePlan {
    if sync_history.len() <= 1 {
        return ResumePlan {
            is_first_sync: true,
            continue_last_sync: false,
        };
    }
    let previous = sync_history[sync_history.len() - 2];
    ResumePlan {
        is_first_sync: false,
        continue_last_sync: previous.state != STATE_SUCCESS,
    }
}

/// An empty resume token means the receiver kept nothing to continue
/// from: start over from scratch if the target holds no snapshots at all,
/// otherwise fall back to an ordinary incremental.
fn downgrade_empty_token(target_is_empty: bool) -> ResumePlan {
    ResumePlan {
        is_first_sync: target_is_empty,
        continue_last_sync: false,
    }
}

/// Pick the previous/new snapshot names, skipping forward past any new
/// name the target already holds. A pre-existing target snapshot implies
/// at least one prior successful sync, so skipping forward also clears
/// the first-sync flag.
fn plan_snapshot_names(
    record: &mut MigrationTask,
    target_snapshot_names: &[String],
    is_first_sync: &mut bool,
) -> (String, String) {
    let mut advanced = false;
    while target_snapshot_names
        .iter()
        .any(|name| *name == snapshot_short_name(record.num_sync_phases + 1))
    {
        record.num_sync_phases += 1;
        advanced = true;
    }
    if advanced {
        *is_first_sync = false;
    }
    (
        snapshot_short_name(record.num_sync_phases),
        snapshot_short_name(record.num_sync_phases + 1),
    )
}

fn is_numerically_ascending(names: &[String]) -> bool {
    let sequences: Vec<u64> = names
        .iter()
        .filter_map(|n| snapshot_sequence(n))
        .collect();
    sequences.windows(2).all(|w| w[0] < w[1])
}

/// Stage A: gather everything needed to stream one dataset.
pub async fn collect_sync_info(
    record: &mut MigrationTask,
    dataset: &str,
    host: &str,
    port: u16,
) -> Result<DatasetContext, Box<dyn std::error::Error + Send + Sync>> {
    let source_snapshot_names = zfs::list_sync_snapshots(dataset).await?;
    let target_filesystem = record.target_dataset(dataset);

    let mut link = ReceiverLink::connect(host, port).await?;
    let result = async {
        let target_snapshot_names = link.get_snapshot_names(&target_filesystem).await?;
        if !is_numerically_ascending(&target_snapshot_names) {
            warn!(
                "target snapshot list for {} is not in sequence order: {:?}",
                target_filesystem, target_snapshot_names
            );
        }

        let mut plan = resume_plan(&record.sync_history());
        let mut token = None;
        if plan.continue_last_sync {
            let t = link.get_resume_token(&target_filesystem).await?;
            if t.is_empty() {
                plan = downgrade_empty_token(target_snapshot_names.is_empty());
            } else {
                token = Some(t);
            }
        }

        let mut is_first_sync = plan.is_first_sync;
        let (prev_snapshot_name, snapshot_name) =
            plan_snapshot_names(record, &target_snapshot_names, &mut is_first_sync);

        let mut ctx = DatasetContext {
            zfs_filesystem: dataset.to_string(),
            target_filesystem: target_filesystem.clone(),
            source_snapshot_names,
            target_snapshot_names,
            is_first_sync,
            continue_last_sync: plan.continue_last_sync,
            token,
            prev_snapshot_name,
            snapshot_name,
            estimated_size: 0,
        };

        if ctx.source_snapshot_names.contains(&ctx.snapshot_name) {
            debug!(
                "snapshot {}@{} already exists",
                dataset, ctx.snapshot_name
            );
        } else {
            zfs::create_snapshot(dataset, &ctx.snapshot_name).await?;
            info!("created snapshot {}@{}", dataset, ctx.snapshot_name);
            ctx.source_snapshot_names.push(ctx.snapshot_name.clone());
            ctx.source_snapshot_names
                .sort_by_key(|short| snapshot_sequence(short));
        }

        ctx.estimated_size = zfs::estimate_send_size(&ctx.send_args()).await?;
        debug!(
            "dataset {}: estimated {} bytes (first_sync={}, continue={})",
            dataset, ctx.estimated_size, ctx.is_first_sync, ctx.continue_last_sync
        );
        Ok(ctx)
    }
    .await;

    link.close().await;
    result
}

fn spawn_progress_ticker(
    baseline: u64,
    bytes_sent: Arc<AtomicU64>,
    progress: Arc<SyncProgress>,
    stop: CancellationToken,
) -> (CancellationToken, JoinHandle<()>) {
    let done = CancellationToken::new();
    let ticker_done = done.clone();
    let handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(PROGRESS_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if stop.is_cancelled() {
                        break;
                    }
                    progress.update_current(baseline + bytes_sent.load(Ordering::Relaxed));
                }
                _ = ticker_done.cancelled() => break,
            }
        }
    });
    (done, handle)
}

/// Stage B: stream one dataset to the receiver and wait for its
/// confirmation. Success requires both a clean send exit and the
/// receiver's sync-success event.
pub async fn stream_dataset(
    ctx: &DatasetContext,
    host: &str,
    port: u16,
    progress: &Arc<SyncProgress>,
    stop: &CancellationToken,
    rate_limit: Option<u64>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut link = ReceiverLink::connect(host, port).await?;
    let result = async {
        link.begin_sync(&ctx.target_filesystem, ctx.is_first_sync).await?;

        let mut send = zfs::SendStream::spawn(&ctx.send_args())?;
        let stdout = send.stdout()?;

        let bytes_sent = Arc::new(AtomicU64::new(0));
        let baseline = progress.current();
        let (ticker_done, ticker) = spawn_progress_ticker(
            baseline,
            Arc::clone(&bytes_sent),
            Arc::clone(progress),
            stop.clone(),
        );

        let pumped = link.pump_stream(stdout, &bytes_sent, rate_limit).await;
        ticker_done.cancel();
        let _ = ticker.await;
        progress.update_current(baseline + bytes_sent.load(Ordering::Relaxed));
        pumped?;

        let status = send.wait().await?;
        if !status.success() {
            return Err(ZfsError::CommandError(format!(
                "zfs send exited with {}: {}",
                status,
                send.stderr_excerpt()
            ))
            .into());
        }

        link.wait_sync_success().await?;
        Ok(())
    }
    .await;

    link.close().await;
    result
}

/// Drive a full sync of the VM: all Collects, then all Streams, then ask
/// the receiver to shut down (best effort, even after a failure).
pub async fn run_sync(
    record: &mut MigrationTask,
    vm: &Vm,
    host: &str,
    port: u16,
    progress: &Arc<SyncProgress>,
    stop: &CancellationToken,
    rate_limit: Option<u64>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    progress.reset();
    let datasets = vm.sync_datasets();
    info!("sync of {} dataset(s): {:?}", datasets.len(), datasets);

    let result = run_stages(record, &datasets, host, port, progress, stop, rate_limit).await;

    match ReceiverLink::connect(host, port).await {
        Ok(mut link) => {
            if let Err(e) = link.stop().await {
                debug!("receiver shutdown: {}", e);
            }
            link.close().await;
        }
        Err(e) => debug!("receiver shutdown: {}", e),
    }

    result
}

async fn run_stages(
    record: &mut MigrationTask,
    datasets: &[String],
    host: &str,
    port: u16,
    progress: &Arc<SyncProgress>,
    stop: &CancellationToken,
    rate_limit: Option<u64>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut contexts = Vec::with_capacity(datasets.len());
    for dataset in datasets {
        if stop.is_cancelled() {
            return Err("sync stopped".into());
        }
        let ctx = collect_sync_info(record, dataset, host, port)
            .await
            .map_err(|e| format!("collect {}: {}", dataset, e))?;
        contexts.push(ctx);
    }

    let total: u64 = contexts.iter().map(|c| c.estimated_size).sum();
    progress.set_total(total);
    info!("estimated transfer size: {} bytes", total);

    for ctx in &contexts {
        if stop.is_cancelled() {
            return Err("sync stopped".into());
        }
        stream_dataset(ctx, host, port, progress, stop, rate_limit)
            .await
            .map_err(|e| format!("sync {}: {}", ctx.zfs_filesystem, e))?;
        info!("dataset {} synced", ctx.zfs_filesystem);
    }

    progress.settle();
    Ok(())
}

#[cfg(test)]
mod test_pipeline {
    use super::*;

    fn ctx() -> DatasetContext {
        DatasetContext {
            zfs_filesystem: "zones/X".to_string(),
            target_filesystem: "zones/X".to_string(),
            source_snapshot_names: vec![],
            target_snapshot_names: vec![],
            is_first_sync: false,
            continue_last_sync: false,
            token: None,
            prev_snapshot_name: "vm-migration-1".to_string(),
            snapshot_name: "vm-migration-2".to_string(),
            estimated_size: 0,
        }
    }

    fn entry(state: &str) -> ProgressEntry {
        ProgressEntry {
            phase: "sync".to_string(),
            state: state.to_string(),
        }
    }

    #[test]
    fn send_args_first_sync_replicates() {
        let mut c = ctx();
        c.is_first_sync = true;
        c.snapshot_name = "vm-migration-1".to_string();
        assert_eq!(c.send_args(), vec!["send", "--replicate", "zones/X@vm-migration-1"]);
    }

    #[test]
    fn send_args_incremental_spans_prev_to_new() {
        let c = ctx();
        assert_eq!(
            c.send_args(),
            vec!["send", "-I", "zones/X@vm-migration-1", "zones/X@vm-migration-2"]
        );
    }

    #[test]
    fn send_args_resume_uses_the_token() {
        let mut c = ctx();
        c.continue_last_sync = true;
        c.token = Some("1-abc-def".to_string());
        assert_eq!(c.send_args(), vec!["send", "-t", "1-abc-def"]);
    }

    #[test]
    fn single_history_entry_means_first_sync() {
        let history = vec![entry("running")];
        let refs: Vec<&ProgressEntry> = history.iter().collect();
        let plan = resume_plan(&refs);
        assert!(plan.is_first_sync);
        assert!(!plan.continue_last_sync);
    }

    #[test]
    fn failed_previous_run_continues() {
        let history = vec![entry("running"), entry("running")];
        let refs: Vec<&ProgressEntry> = history.iter().collect();
        let plan = resume_plan(&refs);
        assert!(!plan.is_first_sync);
        assert!(plan.continue_last_sync);
    }

    #[test]
    fn successful_previous_run_goes_incremental() {
        let history = vec![entry("success"), entry("running")];
        let refs: Vec<&ProgressEntry> = history.iter().collect();
        let plan = resume_plan(&refs);
        assert!(!plan.is_first_sync);
        assert!(!plan.continue_last_sync);
    }

    #[test]
    fn empty_token_downgrades_by_target_contents() {
        let fresh = downgrade_empty_token(true);
        assert!(fresh.is_first_sync);
        assert!(!fresh.continue_last_sync);

        let incremental = downgrade_empty_token(false);
        assert!(!incremental.is_first_sync);
        assert!(!incremental.continue_last_sync);
    }

    #[test]
    fn name_collision_skips_forward_and_clears_first_sync() {
        let mut record = MigrationTask {
            vm_uuid: "X".to_string(),
            target_vm_uuid: "X".to_string(),
            progress_history: vec![],
            num_sync_phases: 1,
        };
        let target = vec![
            "vm-migration-1".to_string(),
            "vm-migration-2".to_string(),
        ];
        let mut is_first = true;
        let (prev, new) = plan_snapshot_names(&mut record, &target, &mut is_first);
        assert_eq!(prev, "vm-migration-2");
        assert_eq!(new, "vm-migration-3");
        assert_eq!(record.num_sync_phases, 2);
        assert!(!is_first);
    }

    #[test]
    fn no_collision_keeps_the_plan() {
        let mut record = MigrationTask {
            vm_uuid: "X".to_string(),
            target_vm_uuid: "X".to_string(),
            progress_history: vec![],
            num_sync_phases: 1,
        };
        let target = vec!["vm-migration-1".to_string()];
        let mut is_first = false;
        let (prev, new) = plan_snapshot_names(&mut record, &target, &mut is_first);
        assert_eq!(prev, "vm-migration-1");
        assert_eq!(new, "vm-migration-2");
        assert_eq!(record.num_sync_phases, 1);
    }

    #[test]
    fn ascending_check_is_numeric() {
        let ordered = vec!["vm-migration-2".to_string(), "vm-migration-10".to_string()];
        assert!(is_numerically_ascending(&ordered));
        let disordered = vec!["vm-migration-3".to_string(), "vm-migration-1".to_string()];
        assert!(!is_numerically_ascending(&disordered));
    }
}
