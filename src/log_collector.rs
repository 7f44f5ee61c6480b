//! Append-only, non-blocking build log.
//!
//! Every BuildRun owns one `LogCollector` writing `logs/<run_id>.log`. The binary
//! registers one more as the process-wide `log` backend.
//!
//! # Architecture
//!
//! ```text
//! stage bodies / tool output / log::info!()
//!     |
//! [LogCollector]  --> tail ring (status queries)
//!     |           --> listener channel (event subscribers, best effort)
//!     | (crossbeam unbounded channel)
//!     v
//! [writer thread] --> <path> (append, one write per line)
//! ```
//!
//! Lines are written as they arrive, so a killed process leaves a partial log.

use chrono::Local;
use crossbeam_channel::{unbounded, Sender};
use log::{Log, Metadata, Record};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Prefix marking milestone lines.
pub const PARSED_PREFIX: &str = "==>";

enum FlushAck {
    Async(tokio::sync::oneshot::Sender<()>),
    Blocking(std::sync::mpsc::Sender<()>),
}

enum LogMessage {
    Line(LogLine),
    /// Everything queued before the marker is on disk once it is acknowledged.
    Flush(FlushAck),
}

/// A log line with metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogLine {
    pub message: String,
    /// Milestone line rather than raw tool output.
    pub parsed: bool,
    pub timestamp: String,
}

impl LogLine {
    pub fn new(message: String) -> Self {
        LogLine {
            message,
            parsed: false,
            timestamp: Local::now().format("%H:%M:%S%.3f").to_string(),
        }
    }

    pub fn parsed(message: String) -> Self {
        LogLine {
            parsed: true,
            ..LogLine::new(message)
        }
    }

    /// The line as written to disk and kept in the tail.
    pub fn render(&self) -> String {
        if self.parsed {
            format!("[{}] {} {}", self.timestamp, PARSED_PREFIX, self.message)
        } else {
            format!("[{}] {}", self.timestamp, self.message)
        }
    }
}

/// Handle to one append-only log file. Cheap to clone.
#[derive(Clone)]
pub struct LogCollector {
    tx: Sender<LogMessage>,
    path: PathBuf,
    tail: Arc<Mutex<VecDeque<String>>>,
    tail_capacity: usize,
    listener: Option<tokio::sync::mpsc::UnboundedSender<LogLine>>,
    console: bool,
}

impl LogCollector {
    /// Open (creating parents) `path` for appending and start the writer thread.
    pub fn open(path: impl Into<PathBuf>, tail_capacity: usize) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;

        let (tx, rx) = unbounded::<LogMessage>();
        let thread_path = path.clone();

        // Plain OS thread: callers may sit on any runtime, or none.
        std::thread::Builder::new()
            .name("build-log-writer".to_string())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        LogMessage::Line(line) => {
                            let formatted = format!("{}\n", line.render());
                            if let Err(e) = file.write_all(formatted.as_bytes()) {
                                eprintln!(
                                    "[Log] Failed to append to {}: {}",
                                    thread_path.display(),
                                    e
                                );
                            }
                        }
                        LogMessage::Flush(ack) => {
                            let _ = file.flush();
                            let _ = file.sync_data();
                            match ack {
                                FlushAck::Async(tx) => {
                                    let _ = tx.send(());
                                }
                                FlushAck::Blocking(tx) => {
                                    let _ = tx.send(());
                                }
                            }
                        }
                    }
                }
            })?;

        Ok(LogCollector {
            tx,
            path,
            tail: Arc::new(Mutex::new(VecDeque::with_capacity(tail_capacity.min(1024)))),
            tail_capacity: tail_capacity.max(1),
            listener: None,
            console: false,
        })
    }

    /// Forward every line to `listener` as well. Delivery is best effort.
    pub fn with_listener(mut self, listener: tokio::sync::mpsc::UnboundedSender<LogLine>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Echo lines to stderr.
    pub fn with_console(mut self, console: bool) -> Self {
        self.console = console;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue a line. Never blocks on disk.
    pub fn log(&self, line: LogLine) {
        let rendered = line.render();
        if self.console {
            eprintln!("{}", rendered);
        }
        {
            let mut tail = self.tail.lock().unwrap_or_else(|p| p.into_inner());
            if tail.len() == self.tail_capacity {
                tail.pop_front();
            }
            tail.push_back(rendered);
        }
        if let Some(listener) = &self.listener {
            let _ = listener.send(line.clone());
        }
        let _ = self.tx.send(LogMessage::Line(line));
    }

    pub fn log_str(&self, message: impl Into<String>) {
        self.log(LogLine::new(message.into()));
    }

    /// Milestone line, prefixed with `==>` on disk.
    pub fn log_parsed(&self, message: impl Into<String>) {
        self.log(LogLine::parsed(message.into()));
    }

    /// Last `n` rendered lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        self.tail_reader().tail(n)
    }

    /// Read-only view of the tail that outlives the collector.
    pub fn tail_reader(&self) -> TailReader {
        TailReader {
            tail: Arc::clone(&self.tail),
        }
    }

    /// Resolve once every line queued before this call is on disk.
    pub async fn wait_for_empty(&self) -> Result<(), String> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.tx
            .send(LogMessage::Flush(FlushAck::Async(tx)))
            .map_err(|e| format!("Failed to send flush marker: {}", e))?;
        rx.await
            .map_err(|e| format!("Flush signal interrupted: {}", e))
    }

    /// Blocking variant of `wait_for_empty` for non-async callers.
    pub fn flush_blocking(&self) {
        let (tx, rx) = std::sync::mpsc::channel();
        if self.tx.send(LogMessage::Flush(FlushAck::Blocking(tx))).is_ok() {
            let _ = rx.recv();
        }
    }
}

/// Shared handle on a collector's tail ring. Does not keep the log file open.
#[derive(Clone)]
pub struct TailReader {
    tail: Arc<Mutex<VecDeque<String>>>,
}

impl TailReader {
    pub fn tail(&self, n: usize) -> Vec<String> {
        let tail = self.tail.lock().unwrap_or_else(|p| p.into_inner());
        let skip = tail.len().saturating_sub(n);
        tail.iter().skip(skip).cloned().collect()
    }
}

/// Wires `log::info!()` and friends into a collector.
impl Log for LogCollector {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = format!("[{}] {}", record.level(), record.args());
        if record.target() == "parsed" {
            self.log_parsed(message);
        } else {
            self.log_str(message);
        }
    }

    fn flush(&self) {
        self.flush_blocking();
    }
}

/// Register a collector writing to `path` as the process logger.
pub fn init_global_logger(
    path: impl Into<PathBuf>,
    level: log::LevelFilter,
    console: bool,
) -> Result<LogCollector, String> {
    let collector = LogCollector::open(path, 64)
        .map_err(|e| format!("Failed to open process log: {}", e))?
        .with_console(console);
    log::set_boxed_logger(Box::new(collector.clone()))
        .map_err(|e| format!("Failed to register logger: {}", e))?;
    log::set_max_level(level);
    Ok(collector)
}
