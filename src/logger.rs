//* Logging setup: a file stream at debug level plus an in-memory ring
//* buffer of the last records, dumped to stderr if the worker dies.
use chrono::Utc;
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

const RING_CAPACITY: usize = 100;

#[derive(Debug, Default)]
pub struct RingBuffer {
    entries: VecDeque<String>,
}

impl RingBuffer {
    fn push(&mut self, line: String) {
        if self.entries.len() == RING_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(line);
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }
}

struct FileLogger {
    file: Mutex<File>,
    ring: Arc<Mutex<RingBuffer>>,
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "[{}] {:5} {}: {}",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            record.level(),
            record.target(),
            record.args()
        );
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{}", line);
        }
        if let Ok(mut ring) = self.ring.lock() {
            ring.push(line);
        }
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

/// Handle kept by the bootstrap for crash-time dumps.
pub struct LogHandle {
    path: PathBuf,
    ring: Arc<Mutex<RingBuffer>>,
}

impl LogHandle {
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn recent(&self) -> Vec<String> {
        self.ring.lock().map(|r| r.entries()).unwrap_or_default()
    }
}

/// Install the process logger.
///
/// With `logdir` set, all records down to debug go to a file under it and
/// into the ring buffer; otherwise env_logger writes to stderr and no
/// handle is returned.
pub fn init(
    logdir: Option<&str>,
    logtimestamp: bool,
    uuid: &str,
) -> Result<Option<LogHandle>, Box<dyn std::error::Error + Send + Sync>> {
    let Some(logdir) = logdir else {
        env_logger::init();
        return Ok(None);
    };

    std::fs::create_dir_all(logdir)?;
    let filename = if logtimestamp {
        format!(
            "vmsync-{}-{}.log",
            Utc::now().format("%Y%m%dT%H%M%SZ"),
            uuid
        )
    } else {
        format!("vmsync-{}.log", uuid)
    };
    let path = PathBuf::from(logdir).join(filename);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;

    let ring = Arc::new(Mutex::new(RingBuffer::default()));
    let logger = FileLogger {
        file: Mutex::new(file),
        ring: Arc::clone(&ring),
    };
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(LevelFilter::Debug);

    Ok(Some(LogHandle { path, ring }))
}

#[cfg(test)]
mod test_logger {
    use super::*;

    #[test]
    fn ring_buffer_keeps_the_last_hundred() {
        let mut ring = RingBuffer::default();
        for i in 0..150 {
            ring.push(format!("line {}", i));
        }
        let entries = ring.entries();
        assert_eq!(entries.len(), RING_CAPACITY);
        assert_eq!(entries.first().unwrap(), "line 50");
        assert_eq!(entries.last().unwrap(), "line 149");
    }
}
