/// Log Source - tail files through rotation, or receive forwarded lines
///
/// File mode seeks to the end on startup (warm state comes from the DB,
/// not the file), blocks on filesystem notifications, detects rotation by
/// inode change, and consumes zero CPU while no dashboard client is
/// connected. Network mode reads newline-terminated frames from a remote
/// forwarder with capped-backoff reconnects.

use notify::{RecursiveMode, Watcher};
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, watch};

/// Retry delay after a failed file open
const OPEN_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Retry delay after a read error
const READ_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Unrecoverable open errors are logged at most this often
const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(60);
/// Reconnect backoff ceiling for network sources
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Gate the broadcaster toggles on first-connect / last-disconnect. The
/// file tailer thread parks here while no client is watching.
pub struct ClientGate {
    active: Mutex<bool>,
    cond: Condvar,
}

impl ClientGate {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn set_active(&self, active: bool) {
        if let Ok(mut state) = self.active.lock() {
            *state = active;
            self.cond.notify_all();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().map(|state| *state).unwrap_or(false)
    }

    /// Block until the gate opens or the timeout passes; returns the state.
    pub fn wait_active(&self, timeout: Duration) -> bool {
        let Ok(state) = self.active.lock() else {
            return false;
        };
        if *state {
            return true;
        }
        match self.cond.wait_timeout(state, timeout) {
            Ok((state, _)) => *state,
            Err(_) => false,
        }
    }
}

impl Default for ClientGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn inode_of(path: &str) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).ok().map(|m| m.ino())
}

#[cfg(not(unix))]
fn inode_of(_path: &str) -> Option<u64> {
    None
}

fn read_new_lines(
    reader: &mut BufReader<File>,
    node_name: &str,
    line_tx: &mpsc::Sender<String>,
) -> std::io::Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            return Ok(());
        }
        // Partial final lines (no newline yet) are left for the next wake;
        // rewind so the bytes are re-read once the writer finishes them.
        if !line.ends_with('\n') {
            reader.seek_relative(-(read as i64))?;
            return Ok(());
        }
        crate::metrics::LINES_RECEIVED
            .with_label_values(&[node_name])
            .inc();
        if line_tx.blocking_send(line.trim_end().to_string()).is_err() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "ingest channel closed",
            ));
        }
    }
}

/// Spawn the tailer thread for a file-backed node. Lines are delivered in
/// arrival order to `line_tx`.
pub fn spawn_file_tailer(
    node_name: String,
    path: String,
    gate: std::sync::Arc<ClientGate>,
    line_tx: mpsc::Sender<String>,
    shutdown: watch::Receiver<bool>,
) {
    std::thread::Builder::new()
        .name(format!("tailer-{}", node_name))
        .spawn(move || {
            tracing::info!(node = node_name.as_str(), path = path.as_str(), "file tailer started");
            let mut last_error_log = Instant::now() - ERROR_LOG_INTERVAL;

            while !*shutdown.borrow() {
                // Idle until a client is watching
                if !gate.wait_active(Duration::from_millis(500)) {
                    continue;
                }

                let file = match File::open(&path) {
                    Ok(file) => file,
                    Err(e) => {
                        if last_error_log.elapsed() >= ERROR_LOG_INTERVAL {
                            tracing::warn!(
                                node = node_name.as_str(),
                                "cannot open log file '{}': {}",
                                path,
                                e
                            );
                            last_error_log = Instant::now();
                        }
                        std::thread::sleep(OPEN_RETRY_DELAY);
                        continue;
                    }
                };
                let opened_inode = inode_of(&path);
                let mut reader = BufReader::new(file);
                if reader.seek(SeekFrom::End(0)).is_err() {
                    std::thread::sleep(OPEN_RETRY_DELAY);
                    continue;
                }

                // Watch the parent directory so rotation (new inode at the
                // same path) wakes us too.
                let directory = Path::new(&path)
                    .parent()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| std::path::PathBuf::from("."));
                let (fs_tx, fs_rx) = std::sync::mpsc::channel::<()>();
                let mut watcher = match notify::recommended_watcher(
                    move |_res: Result<notify::Event, notify::Error>| {
                        let _ = fs_tx.send(());
                    },
                ) {
                    Ok(w) => w,
                    Err(e) => {
                        tracing::warn!(node = node_name.as_str(), "cannot create watcher: {}", e);
                        std::thread::sleep(READ_RETRY_DELAY);
                        continue;
                    }
                };
                if let Err(e) = watcher.watch(&directory, RecursiveMode::NonRecursive) {
                    tracing::warn!(
                        node = node_name.as_str(),
                        "cannot watch '{}': {}",
                        directory.display(),
                        e
                    );
                    std::thread::sleep(READ_RETRY_DELAY);
                    continue;
                }

                // Catch up anything written between open and watch start
                if let Err(e) = read_new_lines(&mut reader, &node_name, &line_tx) {
                    tracing::warn!(node = node_name.as_str(), "read error: {}", e);
                    std::thread::sleep(READ_RETRY_DELAY);
                    continue;
                }

                // Active tail loop
                loop {
                    if *shutdown.borrow() || !gate.is_active() {
                        break;
                    }
                    // Wake on fs events; poll slowly otherwise
                    let _ = fs_rx.recv_timeout(Duration::from_millis(500));
                    while fs_rx.try_recv().is_ok() {}

                    if *shutdown.borrow() || !gate.is_active() {
                        break;
                    }

                    // Rotation: inode changed or the path is briefly gone
                    match inode_of(&path) {
                        Some(current) if Some(current) == opened_inode => {}
                        Some(_) => {
                            tracing::info!(node = node_name.as_str(), "log rotation detected, re-opening");
                            break;
                        }
                        None => {
                            tracing::warn!(node = node_name.as_str(), "log file disappeared, re-opening");
                            break;
                        }
                    }

                    if let Err(e) = read_new_lines(&mut reader, &node_name, &line_tx) {
                        tracing::warn!(node = node_name.as_str(), "read error: {}", e);
                        std::thread::sleep(READ_RETRY_DELAY);
                        break;
                    }
                }
            }
            tracing::info!(node = node_name.as_str(), "file tailer shut down");
        })
        .expect("failed to spawn tailer thread");
}

/// Strip the forwarder's leading unix-seconds token if present
fn strip_forwarder_timestamp(line: &str) -> &str {
    match line.split_once(' ') {
        Some((first, rest)) if first.parse::<f64>().is_ok() => rest,
        _ => line,
    }
}

/// Spawn the reader task for a network-forwarded node.
pub fn spawn_network_source(
    node_name: String,
    host: String,
    port: u16,
    line_tx: mpsc::Sender<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let addr = format!("{}:{}", host, port);
        let mut backoff = Duration::from_secs(1);

        loop {
            if *shutdown.borrow() {
                break;
            }
            let stream = tokio::select! {
                result = tokio::net::TcpStream::connect(&addr) => result,
                _ = shutdown.changed() => break,
            };
            let stream = match stream {
                Ok(stream) => {
                    tracing::info!(node = node_name.as_str(), addr = addr.as_str(), "connected to log forwarder");
                    backoff = Duration::from_secs(1);
                    stream
                }
                Err(e) => {
                    tracing::warn!(
                        node = node_name.as_str(),
                        "connect to {} failed: {}, retrying in {:?}",
                        addr,
                        e,
                        backoff
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => break,
                    }
                    backoff = (backoff * 2).min(MAX_RECONNECT_DELAY);
                    continue;
                }
            };

            let mut lines = tokio::io::BufReader::new(stream).lines();
            loop {
                tokio::select! {
                    maybe_line = lines.next_line() => {
                        match maybe_line {
                            Ok(Some(line)) => {
                                crate::metrics::LINES_RECEIVED
                                    .with_label_values(&[node_name.as_str()])
                                    .inc();
                                let payload = strip_forwarder_timestamp(&line).to_string();
                                if line_tx.send(payload).await.is_err() {
                                    return;
                                }
                            }
                            Ok(None) => {
                                tracing::warn!(node = node_name.as_str(), "forwarder closed connection");
                                break;
                            }
                            Err(e) => {
                                tracing::warn!(node = node_name.as_str(), "forwarder read error: {}", e);
                                break;
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        }
        tracing::info!(node = node_name.as_str(), "network source shut down");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_gate_open_close() {
        let gate = ClientGate::new();
        assert!(!gate.is_active());
        gate.set_active(true);
        assert!(gate.is_active());
        assert!(gate.wait_active(Duration::from_millis(1)));
        gate.set_active(false);
        assert!(!gate.wait_active(Duration::from_millis(5)));
    }

    #[test]
    fn test_strip_forwarder_timestamp() {
        assert_eq!(
            strip_forwarder_timestamp("1736330400.5 2025-01-08T10:00:00Z\tINFO\trest"),
            "2025-01-08T10:00:00Z\tINFO\trest"
        );
        assert_eq!(strip_forwarder_timestamp("no timestamp here"), "no timestamp here");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tailer_delivers_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.log");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "old line before start").unwrap();
        file.sync_all().unwrap();

        let gate = std::sync::Arc::new(ClientGate::new());
        gate.set_active(true);
        let (line_tx, mut line_rx) = mpsc::channel(64);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        spawn_file_tailer(
            "t".to_string(),
            path.to_str().unwrap().to_string(),
            std::sync::Arc::clone(&gate),
            line_tx,
            shutdown_rx,
        );

        // Give the tailer time to open and seek to the end
        tokio::time::sleep(Duration::from_millis(400)).await;
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "fresh line").unwrap();
        file.sync_all().unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), line_rx.recv())
            .await
            .expect("tailer should deliver the appended line")
            .unwrap();
        // The pre-existing line was skipped by the seek-to-end policy
        assert_eq!(received, "fresh line");
    }
}
