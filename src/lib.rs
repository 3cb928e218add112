pub mod gateway;

use std::io;
use std::path::Path;

/// Where and how to write logs.
#[derive(Debug, Clone, Default)]
pub struct LogOptions<'a> {
    /// Log to this file (rotated on startup) instead of stderr.
    pub file: Option<&'a Path>,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
}

/// Initialize the tracing subscriber.
///
/// Logs go to stderr by default, since stdout carries the gateway's own
/// protocol. With a log file:
/// 1. Rotates existing logs (gateway.log → gateway.log.1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh file with a line-flushing writer for crash resilience.
///
/// `RUST_LOG` overrides the default `mcp_gateway=info,warn` filter.
pub fn init_tracing(options: LogOptions<'_>) -> io::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcp_gateway=info,warn"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    let init_result = match (options.file, options.json) {
        (Some(path), json) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            rotate_log_file(path, 3);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let writer = FlushingWriter::new(file);
            let builder = builder.with_writer(writer).with_ansi(false);
            if json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
        (None, true) => builder.with_writer(io::stderr).json().try_init(),
        (None, false) => builder.with_writer(io::stderr).try_init(),
    };
    init_result.map_err(|e| io::Error::other(format!("tracing already initialized: {e}")))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?options.file.map(|p| p.display().to_string()),
        pid = std::process::id(),
        "=== mcp-gateway starting ==="
    );
    Ok(())
}

/// Rotate log files: `gateway.log` → `gateway.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    // Shift: .{n-1} → .{n}
    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Keeps each log line on disk even if the gateway is killed mid-shutdown.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| io::Error::other(format!("lock poisoned: {e}")))?;
        let n = io::Write::write(&mut *f, buf)?;
        io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| io::Error::other(format!("lock poisoned: {e}")))?;
        io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
