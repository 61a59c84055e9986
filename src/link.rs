//* One TCP connection to the receiver agent on the target node.
//*
//* The link carries line-delimited JSON control events in both directions.
//* After a `sync` request is acknowledged the outbound direction switches
//* to raw send-stream bytes; the inbound direction keeps carrying events
//* so the reader stays attached for the duration.
use crate::proto::{self, Event, Response};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const IDLE_POLL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub enum LinkError {
    Connect(String),
    Io(String),
    Timeout,
    UnexpectedEnd,
    Protocol(String),
    UnknownEventId(u64),
    Remote(String),
    Closed,
}

impl Display for LinkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::Connect(s) => write!(f, "failed to connect to receiver: {}", s),
            LinkError::Io(s) => write!(f, "receiver connection error: {}", s),
            LinkError::Timeout => write!(f, "receiver connection timed out"),
            LinkError::UnexpectedEnd => write!(f, "no sync-success received"),
            LinkError::Protocol(s) => write!(f, "receiver protocol error: {}", s),
            LinkError::UnknownEventId(id) => {
                write!(f, "response for unknown event id {}", id)
            }
            LinkError::Remote(s) => write!(f, "{}", s),
            LinkError::Closed => write!(f, "receiver connection closed"),
        }
    }
}

impl std::error::Error for LinkError {}

/// Asynchronous notifications the reader hands to the current stage.
#[derive(Debug)]
enum LinkNotice {
    SyncSuccess,
    Remote(String),
    Failed(LinkError),
}

/// Last-activity clock shared between the reader task and the byte pump.
/// Mirrors a socket idle timer: any traffic in either direction resets it.
#[derive(Clone)]
struct Activity(Arc<Mutex<Instant>>);

impl Activity {
    fn new() -> Self {
        Activity(Arc::new(Mutex::new(Instant::now())))
    }

    fn touch(&self) {
        if let Ok(mut at) = self.0.lock() {
            *at = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.0
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or(Duration::ZERO)
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

pub struct ReceiverLink {
    writer: OwnedWriteHalf,
    notices: mpsc::UnboundedReceiver<LinkNotice>,
    pending: PendingMap,
    failure: Arc<Mutex<Option<LinkError>>>,
    activity: Activity,
    next_event_id: u64,
    got_success: bool,
    reader_task: JoinHandle<()>,
}

impl ReceiverLink {
    pub async fn connect(host: &str, port: u16) -> Result<Self, LinkError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| LinkError::Connect(e.to_string()))?;
        let (read_half, writer) = stream.into_split();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let failure = Arc::new(Mutex::new(None));
        let activity = Activity::new();
        let (notice_tx, notices) = mpsc::unbounded_channel();

        let reader_task = tokio::spawn(read_loop(
            read_half,
            Arc::clone(&pending),
            Arc::clone(&failure),
            activity.clone(),
            notice_tx,
        ));

        Ok(ReceiverLink {
            writer,
            notices,
            pending,
            failure,
            activity,
            next_event_id: 0,
            got_success: false,
            reader_task,
        })
    }

    fn stored_failure(&self) -> LinkError {
        self.failure
            .lock()
            .ok()
            .and_then(|f| f.clone())
            .unwrap_or(LinkError::Closed)
    }

    /// Issue one request and wait for its correlated response. Asynchronous
    /// receiver errors arriving in the meantime fail the request instead.
    pub async fn request(
        &mut self,
        command: &str,
        args: Map<String, Value>,
    ) -> Result<Response, LinkError> {
        self.next_event_id += 1;
        let event_id = self.next_event_id;

        let (tx, mut rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(event_id, tx);
        }

        let event = Event::request(command, event_id, args);
        if let Err(e) = proto::write_event(&mut self.writer, &event).await {
            if let Ok(mut pending) = self.pending.lock() {
                pending.remove(&event_id);
            }
            return Err(LinkError::Io(e.to_string()));
        }

        tokio::select! {
            response = &mut rx => response.map_err(|_| self.stored_failure()),
            notice = self.notices.recv() => {
                if let Ok(mut pending) = self.pending.lock() {
                    pending.remove(&event_id);
                }
                match notice {
                    Some(LinkNotice::Remote(message)) => Err(LinkError::Remote(message)),
                    Some(LinkNotice::Failed(e)) => Err(e),
                    Some(LinkNotice::SyncSuccess) => {
                        Err(LinkError::Protocol("unexpected sync-success".to_string()))
                    }
                    None => Err(self.stored_failure()),
                }
            }
        }
    }

    /// Block until the receiver confirms the sync, or the link fails.
    /// A confirmation already observed while pumping bytes counts.
    pub async fn wait_sync_success(&mut self) -> Result<(), LinkError> {
        if self.got_success {
            return Ok(());
        }
        match self.notices.recv().await {
            Some(LinkNotice::SyncSuccess) => {
                self.got_success = true;
                Ok(())
            }
            Some(LinkNotice::Remote(message)) => Err(LinkError::Remote(message)),
            Some(LinkNotice::Failed(e)) => Err(e),
            None => Err(self.stored_failure()),
        }
    }

    /// Forward a send stream into the socket, counting bytes as they go.
    ///
    /// Reads and writes one bounded chunk at a time so OS pipe backpressure
    /// reaches the send process; nothing is buffered beyond `buf`. The
    /// optional `rate_limit` (bytes per second) is the reserved throttle
    /// hook; nothing configures it yet.
    ///
    /// Receiver events arriving mid-stream are handled here: an error
    /// aborts the pump, a confirmation is remembered for
    /// [`wait_sync_success`].
    pub async fn pump_stream<R: AsyncRead + Unpin>(
        &mut self,
        mut reader: R,
        bytes_sent: &AtomicU64,
        rate_limit: Option<u64>,
    ) -> Result<(), LinkError> {
        let mut buf = vec![0u8; 64 * 1024];
        let started = Instant::now();
        let mut sent: u64 = 0;

        loop {
            let n = tokio::select! {
                read = reader.read(&mut buf) => {
                    read.map_err(|e| LinkError::Io(format!("send stream read: {}", e)))?
                }
                notice = self.notices.recv() => {
                    match notice {
                        Some(LinkNotice::SyncSuccess) => {
                            self.got_success = true;
                            continue;
                        }
                        Some(LinkNotice::Remote(message)) => {
                            return Err(LinkError::Remote(message));
                        }
                        Some(LinkNotice::Failed(e)) => return Err(e),
                        None => return Err(self.stored_failure()),
                    }
                }
            };
            if n == 0 {
                break;
            }

            self.writer
                .write_all(&buf[..n])
                .await
                .map_err(|e| LinkError::Io(format!("socket write: {}", e)))?;
            self.activity.touch();
            sent += n as u64;
            bytes_sent.store(sent, Ordering::Relaxed);

            if let Some(limit) = rate_limit {
                let due = Duration::from_secs_f64(sent as f64 / limit as f64);
                let elapsed = started.elapsed();
                if due > elapsed {
                    tokio::time::sleep(due - elapsed).await;
                }
            }
        }

        self.writer
            .flush()
            .await
            .map_err(|e| LinkError::Io(format!("socket flush: {}", e)))?;
        Ok(())
    }

    pub async fn get_snapshot_names(&mut self, zfs_filesystem: &str) -> Result<Vec<String>, LinkError> {
        let mut args = Map::new();
        args.insert("zfsFilesystem".to_string(), json!(zfs_filesystem));
        let response = self.request("get-zfs-snapshot-names", args).await?;
        Ok(response.string_array("names"))
    }

    pub async fn get_resume_token(&mut self, zfs_filesystem: &str) -> Result<String, LinkError> {
        let mut args = Map::new();
        args.insert("zfsFilesystem".to_string(), json!(zfs_filesystem));
        let response = self.request("get-zfs-resume-token", args).await?;
        Ok(response.string_field("token").unwrap_or_default())
    }

    /// Ask the receiver to switch this connection to byte-consumption mode.
    /// Once acknowledged, everything written to the socket is the send
    /// stream and no further requests may be issued on this link.
    pub async fn begin_sync(
        &mut self,
        zfs_filesystem: &str,
        is_first_sync: bool,
    ) -> Result<(), LinkError> {
        let mut args = Map::new();
        args.insert("zfsFilesystem".to_string(), json!(zfs_filesystem));
        args.insert("isFirstSync".to_string(), json!(is_first_sync));
        self.request("sync", args).await?;
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<(), LinkError> {
        self.request("stop", Map::new()).await?;
        Ok(())
    }

    /// Half-close the outbound direction and tear the link down.
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
        self.reader_task.abort();
    }
}

impl Drop for ReceiverLink {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_loop(
    read_half: OwnedReadHalf,
    pending: PendingMap,
    failure: Arc<Mutex<Option<LinkError>>>,
    activity: Activity,
    notice_tx: mpsc::UnboundedSender<LinkNotice>,
) {
    let mut lines = BufReader::new(read_half).lines();
    let mut ended_successfully = false;

    let fail = |error: LinkError| {
        if let Ok(mut f) = failure.lock() {
            f.get_or_insert(error.clone());
        }
        // Dropping the waiters wakes every request() still in flight.
        if let Ok(mut pending) = pending.lock() {
            pending.clear();
        }
        let _ = notice_tx.send(LinkNotice::Failed(error));
    };

    loop {
        let line = match tokio::time::timeout(IDLE_POLL, lines.next_line()).await {
            Err(_) => {
                if activity.idle_for() >= IDLE_TIMEOUT {
                    fail(LinkError::Timeout);
                    return;
                }
                continue;
            }
            Ok(Err(e)) => {
                fail(LinkError::Io(e.to_string()));
                return;
            }
            Ok(Ok(None)) => {
                if !ended_successfully {
                    fail(LinkError::UnexpectedEnd);
                }
                return;
            }
            Ok(Ok(Some(line))) => line,
        };
        activity.touch();

        if line.trim().is_empty() {
            continue;
        }

        match proto::parse_event(&line) {
            Ok(Event::Response(response)) => {
                let waiter = pending
                    .lock()
                    .ok()
                    .and_then(|mut p| p.remove(&response.event_id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        fail(LinkError::UnknownEventId(response.event_id));
                        return;
                    }
                }
            }
            Ok(Event::Error(error)) => {
                let _ = notice_tx.send(LinkNotice::Remote(error.message));
            }
            Ok(Event::SyncSuccess(_)) => {
                ended_successfully = true;
                let _ = notice_tx.send(LinkNotice::SyncSuccess);
            }
            Ok(other) => {
                fail(LinkError::Protocol(format!(
                    "unexpected event from receiver: {:?}",
                    other
                )));
                return;
            }
            Err(e) => {
                fail(LinkError::Protocol(format!("malformed event: {}", e)));
                return;
            }
        }
    }
}

#[cfg(test)]
mod test_link {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Bind a loopback listener and run `script` against the first
    /// accepted connection.
    async fn mock_receiver<F, Fut>(script: F) -> u16
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            script(stream).await;
        });
        port
    }

    #[tokio::test]
    async fn request_response_roundtrip() {
        let port = mock_receiver(|stream| async move {
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(parsed["command"], "get-zfs-snapshot-names");
            assert_eq!(parsed["zfsFilesystem"], "zones/X");
            let id = parsed["eventId"].as_u64().unwrap();
            let reply = format!(
                "{{\"type\":\"response\",\"command\":\"get-zfs-snapshot-names\",\"eventId\":{},\"names\":[\"vm-migration-1\"]}}\n",
                id
            );
            write.write_all(reply.as_bytes()).await.unwrap();
        })
        .await;

        let mut link = ReceiverLink::connect("127.0.0.1", port).await.unwrap();
        let names = link.get_snapshot_names("zones/X").await.unwrap();
        assert_eq!(names, vec!["vm-migration-1"]);
        link.close().await;
    }

    #[tokio::test]
    async fn unknown_event_id_fails_the_link() {
        let port = mock_receiver(|stream| async move {
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let _ = lines.next_line().await.unwrap();
            write
                .write_all(b"{\"type\":\"response\",\"eventId\":999}\n")
                .await
                .unwrap();
            // Keep the socket open so the failure comes from the id check.
            let _ = lines.next_line().await;
        })
        .await;

        let mut link = ReceiverLink::connect("127.0.0.1", port).await.unwrap();
        let result = link.get_resume_token("zones/X").await;
        assert!(matches!(result, Err(LinkError::UnknownEventId(999))));
        link.close().await;
    }

    #[tokio::test]
    async fn remote_error_fails_a_pending_request() {
        let port = mock_receiver(|stream| async move {
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let _ = lines.next_line().await.unwrap();
            write
                .write_all(b"{\"type\":\"error\",\"message\":\"pool is suspended\"}\n")
                .await
                .unwrap();
            let _ = lines.next_line().await;
        })
        .await;

        let mut link = ReceiverLink::connect("127.0.0.1", port).await.unwrap();
        let result = link.begin_sync("zones/X", true).await;
        match result {
            Err(LinkError::Remote(message)) => assert_eq!(message, "pool is suspended"),
            other => panic!("expected remote error, got {:?}", other),
        }
        link.close().await;
    }

    #[tokio::test]
    async fn sync_success_is_delivered() {
        let port = mock_receiver(|stream| async move {
            let (_read, mut write) = stream.into_split();
            write
                .write_all(b"{\"type\":\"sync-success\"}\n")
                .await
                .unwrap();
        })
        .await;

        let mut link = ReceiverLink::connect("127.0.0.1", port).await.unwrap();
        link.wait_sync_success().await.unwrap();
        link.close().await;
    }

    #[tokio::test]
    async fn end_without_success_is_an_error() {
        let port = mock_receiver(|stream| async move {
            drop(stream);
        })
        .await;

        let mut link = ReceiverLink::connect("127.0.0.1", port).await.unwrap();
        let result = link.wait_sync_success().await;
        assert!(matches!(result, Err(LinkError::UnexpectedEnd)));
        link.close().await;
    }
}
