//* Timer-driven fan-out of progress events to subscribed control sockets
//*
//* One watcher per worker, created on the first sync or watch command. It
//* doubles as a keep-alive: every 60th tick broadcasts even when no bytes
//* have moved, so supervisors can tell a stalled sync from a dead worker.
use crate::proto::{self, Event, Progress};
use crate::worker::SyncProgress;
use futures::future::join_all;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WATCH_TICK: Duration = Duration::from_secs(1);
const KEEPALIVE_TICKS: u64 = 60;

/// A control socket's outbound half, shared between the dispatcher (which
/// writes responses) and the watcher (which writes progress events).
pub type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

struct Subscriber {
    id: u64,
    writer: SharedWriter,
}

pub struct Watcher {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    next_id: AtomicU64,
    ended: CancellationToken,
    task: JoinHandle<()>,
}

/// Whether a tick broadcasts, and with which `store` flag. Keep-alive
/// ticks always broadcast and are the only ones the receiver persists.
fn broadcast_decision(progress_changed: bool, tick: u64) -> Option<bool> {
    if tick % KEEPALIVE_TICKS == 0 {
        Some(true)
    } else if progress_changed {
        Some(false)
    } else {
        None
    }
}

impl Watcher {
    pub fn start(progress: Arc<SyncProgress>, stop: CancellationToken) -> Self {
        let subscribers: Arc<Mutex<Vec<Subscriber>>> = Arc::new(Mutex::new(Vec::new()));
        let ended = CancellationToken::new();

        let tick_subscribers = Arc::clone(&subscribers);
        let tick_ended = ended.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(WATCH_TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut tick: u64 = 0;
            let mut last_current: u64 = 0;

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = tick_ended.cancelled() => return,
                }
                if stop.is_cancelled() {
                    return;
                }

                tick += 1;
                let current = progress.current();
                let decision = broadcast_decision(current != last_current, tick);
                last_current = current;

                if let Some(store) = decision {
                    let event = Event::Progress(Progress {
                        phase: "sync".to_string(),
                        state: "running".to_string(),
                        current_progress: current,
                        total_progress: progress.total(),
                        store,
                    });
                    broadcast(&tick_subscribers, &event).await;
                }
            }
        });

        Watcher {
            subscribers,
            next_id: AtomicU64::new(1),
            ended,
            task,
        }
    }

    pub async fn subscribe(&self, writer: SharedWriter) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .await
            .push(Subscriber { id, writer });
        id
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().await.retain(|s| s.id != id);
    }

    /// Stop the timer and destroy every subscribed socket.
    pub async fn end(&self) {
        self.ended.cancel();
        let mut subscribers = self.subscribers.lock().await;
        for subscriber in subscribers.drain(..) {
            let mut writer = subscriber.writer.lock().await;
            let _ = writer.shutdown().await;
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn broadcast(subscribers: &Arc<Mutex<Vec<Subscriber>>>, event: &Event) {
    let targets: Vec<(u64, SharedWriter)> = {
        let subscribers = subscribers.lock().await;
        subscribers
            .iter()
            .map(|s| (s.id, Arc::clone(&s.writer)))
            .collect()
    };
    if targets.is_empty() {
        return;
    }

    let writes = targets.iter().map(|(id, writer)| async move {
        let mut writer = writer.lock().await;
        match proto::write_event(&mut *writer, event).await {
            Ok(()) => None,
            Err(e) => {
                warn!("progress broadcast to subscriber {} failed: {}", id, e);
                Some(*id)
            }
        }
    });

    let failed: Vec<u64> = join_all(writes).await.into_iter().flatten().collect();
    if !failed.is_empty() {
        let mut subscribers = subscribers.lock().await;
        subscribers.retain(|s| !failed.contains(&s.id));
        debug!("dropped {} dead subscriber(s)", failed.len());
    }
}

#[cfg(test)]
mod test_watcher {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn keepalive_every_sixtieth_tick() {
        assert_eq!(broadcast_decision(false, 59), None);
        assert_eq!(broadcast_decision(false, 60), Some(true));
        assert_eq!(broadcast_decision(true, 60), Some(true));
        assert_eq!(broadcast_decision(false, 120), Some(true));
    }

    #[test]
    fn change_broadcasts_without_store() {
        assert_eq!(broadcast_decision(true, 7), Some(false));
        assert_eq!(broadcast_decision(false, 7), None);
    }

    #[tokio::test]
    async fn progress_reaches_subscribers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            lines.next_line().await.unwrap().unwrap()
        });

        let (server, _) = listener.accept().await.unwrap();
        let (_read, write) = server.into_split();

        let progress = Arc::new(SyncProgress::default());
        progress.set_total(100);
        let watcher = Watcher::start(Arc::clone(&progress), CancellationToken::new());
        watcher.subscribe(Arc::new(Mutex::new(write))).await;

        progress.update_current(42);
        let line = tokio::time::timeout(Duration::from_secs(5), client)
            .await
            .unwrap()
            .unwrap();
        let event: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(event["type"], "progress");
        assert_eq!(event["current_progress"], 42);
        assert_eq!(event["total_progress"], 100);

        watcher.end().await;
    }
}
