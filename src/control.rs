//* TCP control server driven by the parent supervisor
use crate::pipeline;
use crate::proto::{self, Event, Request};
use crate::task::MigrationTask;
use crate::watcher::{SharedWriter, Watcher};
use crate::worker::Worker;
use log::{debug, info, warn};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Accept supervisor connections until the stop token fires. Dropping the
/// listener on the way out is what actually closes the control port.
pub async fn serve(listener: TcpListener, worker: Arc<Worker>) {
    loop {
        tokio::select! {
            _ = worker.stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("control connection from {}", peer);
                    tokio::spawn(handle_connection(stream, Arc::clone(&worker)));
                }
                Err(e) => {
                    warn!("control accept failed: {}", e);
                    break;
                }
            }
        }
    }
    info!("control listener closed");
}

async fn handle_connection(stream: TcpStream, worker: Arc<Worker>) {
    let (read_half, write_half) = stream.into_split();
    let writer: SharedWriter = Arc::new(Mutex::new(write_half));
    let mut lines = BufReader::new(read_half).lines();
    let mut subscription: Option<u64> = None;

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let request = match proto::parse_event(&line) {
            Ok(Event::Request(request)) => request,
            Ok(other) => {
                warn!("control: ignoring non-request event: {:?}", other);
                continue;
            }
            Err(e) => {
                warn!("control: discarding malformed line: {}", e);
                continue;
            }
        };
        dispatch(request, &writer, &mut subscription, &worker).await;
    }

    // Socket is gone; stop feeding it progress events.
    if let Some(id) = subscription {
        if let Some(watcher) = worker.watcher.lock().await.as_ref() {
            watcher.unsubscribe(id).await;
        }
    }
}

async fn dispatch(
    request: Request,
    writer: &SharedWriter,
    subscription: &mut Option<u64>,
    worker: &Arc<Worker>,
) {
    debug!("control command: {} (event {})", request.command, request.event_id);
    match request.command.as_str() {
        "ping" => {
            let mut fields = Map::new();
            fields.insert("pid".to_string(), json!(std::process::id()));
            fields.insert("version".to_string(), json!(crate::VERSION));
            respond(writer, "ping", request.event_id, fields).await;
        }
        "set-record" => handle_set_record(request, writer, worker).await,
        "watch" => {
            *subscription = Some(subscribe(writer, worker).await);
            respond(writer, "watch", request.event_id, Map::new()).await;
        }
        "sync" => handle_sync(request, writer, subscription, worker).await,
        "stop" | "end" => {
            respond(writer, &request.command, request.event_id, Map::new()).await;
            shutdown(worker).await;
        }
        _ => {
            fail(
                writer,
                Some(request.command.as_str()),
                Some(request.event_id),
                "Not Implemented",
            )
            .await;
        }
    }
}

async fn handle_set_record(request: Request, writer: &SharedWriter, worker: &Arc<Worker>) {
    let record = request
        .args
        .get("record")
        .cloned()
        .ok_or_else(|| "set-record: missing record field".to_string())
        .and_then(|value| {
            serde_json::from_value::<MigrationTask>(value)
                .map_err(|e| format!("set-record: bad record: {}", e))
        });
    match record {
        Ok(record) => {
            *worker.record.lock().await = record;
            respond(writer, "set-record", request.event_id, Map::new()).await;
        }
        Err(message) => {
            fail(writer, Some("set-record"), Some(request.event_id), &message).await;
        }
    }
}

async fn handle_sync(
    request: Request,
    writer: &SharedWriter,
    subscription: &mut Option<u64>,
    worker: &Arc<Worker>,
) {
    let host = request
        .args
        .get("host")
        .and_then(Value::as_str)
        .map(str::to_string);
    let port = request
        .args
        .get("port")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok());
    let (Some(host), Some(port)) = (host, port) else {
        fail(
            writer,
            Some("sync"),
            Some(request.event_id),
            "sync requires host and port",
        )
        .await;
        return;
    };

    if worker.sync_running.swap(true, Ordering::SeqCst) {
        fail(
            writer,
            Some("sync"),
            Some(request.event_id),
            "sync already running",
        )
        .await;
        return;
    }

    *subscription = Some(subscribe(writer, worker).await);

    let writer = Arc::clone(writer);
    let worker = Arc::clone(worker);
    let event_id = request.event_id;
    tokio::spawn(async move {
        let result = {
            let mut record = worker.record.lock().await;
            pipeline::run_sync(
                &mut record,
                &worker.vm,
                &host,
                port,
                &worker.progress,
                &worker.stop,
                worker.rate_limit,
            )
            .await
        };
        worker.sync_running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                info!("sync finished");
                respond(&writer, "sync", event_id, Map::new()).await;
            }
            Err(e) => {
                warn!("sync failed: {}", e);
                fail(
                    &writer,
                    Some("sync"),
                    Some(event_id),
                    &format!("sync error: {}", e),
                )
                .await;
            }
        }

        // One sync per worker: report, then end ourselves.
        shutdown(&worker).await;
    });
}

async fn subscribe(writer: &SharedWriter, worker: &Arc<Worker>) -> u64 {
    let mut slot = worker.watcher.lock().await;
    let watcher = slot.get_or_insert_with(|| {
        Watcher::start(Arc::clone(&worker.progress), worker.stop.clone())
    });
    watcher.subscribe(Arc::clone(writer)).await
}

async fn shutdown(worker: &Arc<Worker>) {
    if let Some(watcher) = worker.watcher.lock().await.take() {
        watcher.end().await;
    }
    worker.stop.cancel();
}

async fn respond(writer: &SharedWriter, command: &str, event_id: u64, fields: Map<String, Value>) {
    let event = Event::response(command, event_id, fields);
    let mut writer = writer.lock().await;
    if let Err(e) = proto::write_event(&mut *writer, &event).await {
        warn!("control response write failed: {}", e);
    }
}

async fn fail(writer: &SharedWriter, command: Option<&str>, event_id: Option<u64>, message: &str) {
    let event = Event::error(command, event_id, message);
    let mut writer = writer.lock().await;
    if let Err(e) = proto::write_event(&mut *writer, &event).await {
        warn!("control error write failed: {}", e);
    }
}

#[cfg(test)]
mod test_control {
    use super::*;
    use crate::task::Vm;
    use tokio::io::AsyncWriteExt;

    fn test_worker() -> Arc<Worker> {
        let record = MigrationTask {
            vm_uuid: "AAA".to_string(),
            target_vm_uuid: "AAA".to_string(),
            progress_history: vec![],
            num_sync_phases: 0,
        };
        let vm = Vm {
            uuid: "AAA".to_string(),
            zfs_filesystem: "zones/AAA".to_string(),
            brand: "bhyve".to_string(),
            disks: vec![],
        };
        Arc::new(Worker::new("task-1".to_string(), record, vm))
    }

    async fn start_server(worker: Arc<Worker>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, worker));
        addr
    }

    async fn roundtrip(stream: &mut TcpStream, line: &str) -> serde_json::Value {
        let (read, mut write) = stream.split();
        write.write_all(line.as_bytes()).await.unwrap();
        write.write_all(b"\n").await.unwrap();
        let mut lines = BufReader::new(read).lines();
        let reply = lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    #[tokio::test]
    async fn ping_reports_pid_and_version() {
        let addr = start_server(test_worker()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let reply = roundtrip(
            &mut stream,
            r#"{"type":"request","command":"ping","eventId":1}"#,
        )
        .await;
        assert_eq!(reply["type"], "response");
        assert_eq!(reply["command"], "ping");
        assert_eq!(reply["eventId"], 1);
        assert_eq!(reply["pid"], std::process::id());
    }

    #[tokio::test]
    async fn unknown_command_is_not_implemented() {
        let addr = start_server(test_worker()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let reply = roundtrip(
            &mut stream,
            r#"{"type":"request","command":"teleport","eventId":2}"#,
        )
        .await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["message"], "Not Implemented");
        assert_eq!(reply["eventId"], 2);
    }

    #[tokio::test]
    async fn malformed_line_does_not_kill_the_connection() {
        let addr = start_server(test_worker()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"this is not json\n").await.unwrap();
        let reply = roundtrip(
            &mut stream,
            r#"{"type":"request","command":"ping","eventId":3}"#,
        )
        .await;
        assert_eq!(reply["command"], "ping");
    }

    #[tokio::test]
    async fn set_record_replaces_the_task() {
        let worker = test_worker();
        let addr = start_server(Arc::clone(&worker)).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let reply = roundtrip(
            &mut stream,
            r#"{"type":"request","command":"set-record","eventId":4,"record":{"vm_uuid":"AAA","target_vm_uuid":"BBB","num_sync_phases":3}}"#,
        )
        .await;
        assert_eq!(reply["type"], "response");
        let record = worker.record.lock().await;
        assert_eq!(record.target_vm_uuid, "BBB");
        assert_eq!(record.num_sync_phases, 3);
    }

    #[tokio::test]
    async fn stop_cancels_the_worker() {
        let worker = test_worker();
        let addr = start_server(Arc::clone(&worker)).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let reply = roundtrip(
            &mut stream,
            r#"{"type":"request","command":"stop","eventId":5}"#,
        )
        .await;
        assert_eq!(reply["type"], "response");
        assert_eq!(reply["command"], "stop");
        tokio::time::timeout(std::time::Duration::from_secs(1), worker.stop.cancelled())
            .await
            .unwrap();
    }
}
