use clap::Parser;
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};
use vmsync::logger::LogHandle;
use vmsync::task::StartupMessage;
use vmsync::worker::{SetupError, Worker, admin_ip};
use vmsync::{control, logger};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = vmsync::VERSION)]
struct Args {
    /// Directory for the worker log file; logs go to stderr when unset
    #[arg(long, env = "logdir")]
    logdir: Option<String>,

    /// Embed a timestamp in the log file name
    #[arg(long, env = "logtimestamp", default_value_t = false)]
    logtimestamp: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // The one message the parent sends us: task id, timeout and payload.
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut first_line = String::new();
    if stdin.read_line(&mut first_line).await.is_err() || first_line.trim().is_empty() {
        report_failure(None, "no startup message received from parent").await;
        std::process::exit(1);
    }
    let message: StartupMessage = match serde_json::from_str(&first_line) {
        Ok(message) => message,
        Err(e) => {
            report_failure(None, &format!("bad startup message: {}", e)).await;
            std::process::exit(1);
        }
    };

    let log_handle = match logger::init(args.logdir.as_deref(), args.logtimestamp, &message.uuid) {
        Ok(handle) => handle,
        Err(e) => {
            report_failure(
                Some(message.req_id.as_str()),
                &format!("failed to set up logging: {}", e),
            )
            .await;
            std::process::exit(1);
        }
    };

    if let Err(e) = run(message.clone(), stdin).await {
        log::error!("worker failed: {}", e);
        report_failure(Some(message.req_id.as_str()), &e.to_string()).await;
        dump_recent_log(&log_handle);
        std::process::exit(1);
    }
}

async fn run(
    message: StartupMessage,
    stdin: BufReader<tokio::io::Stdin>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    log::info!(
        "migration sync worker {} starting: task {} (timeout {}s)",
        vmsync::VERSION,
        message.uuid,
        message.timeout_seconds
    );

    let action = message.payload.migration_task.action;
    if action != "sync" {
        return Err(format!("unsupported action: {}", action).into());
    }

    let host = admin_ip().await?;
    let listener = TcpListener::bind((host.as_str(), 0))
        .await
        .map_err(|e| SetupError::Bind(e.to_string()))?;
    let port = listener.local_addr().map_err(|e| SetupError::Bind(e.to_string()))?.port();

    let worker = Arc::new(Worker::new(
        message.uuid,
        message.payload.migration_task.record,
        message.payload.vm,
    ));

    // From here on the supervisor drives us over the control socket.
    let reply = json!({
        "req_id": message.req_id,
        "host": host,
        "port": port,
        "pid": std::process::id(),
    });
    write_to_parent(&reply).await?;
    log::info!("control listener bound at {}:{}", host, port);

    // The parent closing its end of our stdin means it is gone; there is
    // nobody left to command us, so shut down.
    let stop = worker.stop.clone();
    tokio::spawn(async move {
        let mut stdin = stdin;
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        log::info!("parent disconnected");
        stop.cancel();
    });

    let stop = worker.stop.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        stop.cancel();
    });

    control::serve(listener, worker).await;
    log::info!("worker exiting");
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to setup SIGINT handler");

    select! {
        _ = sigterm.recv() => {
            log::info!("Received SIGTERM")
        },
        _ = sigint.recv() => {
            log::info!("Received SIGINT")
        },
    }
}

async fn write_to_parent(
    value: &serde_json::Value,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut stdout = tokio::io::stdout();
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    stdout.write_all(&line).await?;
    stdout.flush().await?;
    Ok(())
}

async fn report_failure(req_id: Option<&str>, message: &str) {
    let reply = json!({
        "req_id": req_id,
        "error": { "message": message },
    });
    let _ = write_to_parent(&reply).await;
}

fn dump_recent_log(handle: &Option<LogHandle>) {
    if let Some(handle) = handle {
        eprintln!("--- last log records ({}) ---", handle.path().display());
        for line in handle.recent() {
            eprintln!("{}", line);
        }
    }
}
