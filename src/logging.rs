//! Tracing setup for the proxy binary and embedding hosts.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Log file name inside the log directory.
pub const LOG_FILE_NAME: &str = "mcp-proxy.log";

/// Where logs go and how they look.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Write to `<dir>/mcp-proxy.log` instead of stderr.
    pub log_dir: Option<PathBuf>,
    /// One JSON object per line.
    pub json: bool,
    /// Rotated files to keep (`.1` … `.N`).
    pub keep_files: u32,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            log_dir: None,
            json: false,
            keep_files: 3,
        }
    }
}

/// Platform data directory for the proxy.
///
/// - macOS: `~/Library/Application Support/mcp-proxy/`
/// - Linux: `$XDG_DATA_HOME/mcp-proxy/` (fallback `~/.local/share/mcp-proxy/`)
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-proxy\`
///
/// Falls back to `~/.mcp-proxy/` when none of the above resolve.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-proxy");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-proxy")
}

/// Default filter when `RUST_LOG` is unset: this crate at `level`, others at warn.
pub fn default_directive(level: &str) -> String {
    format!("mcp_proxy={level},warn")
}

/// Install the global subscriber. Returns the log file path when logging to a file.
///
/// `RUST_LOG` overrides `level`. With a log directory, existing logs are
/// rotated first and the new file is flushed after every line.
pub fn init_tracing(level: &str, options: &LogOptions) -> std::io::Result<Option<PathBuf>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(level)));

    let (writer, log_path, ansi) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let log_path = dir.join(LOG_FILE_NAME);
            rotate_log_file(&log_path, options.keep_files);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)?;
            (BoxMakeWriter::new(FlushingWriter::new(file)), Some(log_path), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), None, true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(false);
    let installed = if options.json {
        builder.json().try_init()
    } else {
        builder.with_ansi(ansi).try_init()
    };
    installed.map_err(|e| std::io::Error::other(format!("tracing already initialized: {e}")))?;

    let destination = log_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "stderr".into());
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %destination,
        pid = std::process::id(),
        "=== mcp-proxy starting ==="
    );
    Ok(log_path)
}

/// Rotate log files: `mcp-proxy.log` → `.1` → `.2` → … → `.{keep}`.
///
/// The oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
pub fn rotate_log_file(base_path: &Path, keep: u32) {
    if keep == 0 {
        let _ = std::fs::remove_file(base_path);
        return;
    }
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

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

/// Wraps a file and flushes after every write so lines survive a crash.
#[derive(Clone)]
pub struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    pub fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = f.write(buf)?;
        f.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        f.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_shifts_and_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join(LOG_FILE_NAME);
        std::fs::write(&base, "current").unwrap();
        std::fs::write(format!("{}.1", base.display()), "one").unwrap();
        std::fs::write(format!("{}.2", base.display()), "two").unwrap();

        rotate_log_file(&base, 2);

        assert!(!base.exists());
        let one = std::fs::read_to_string(format!("{}.1", base.display())).unwrap();
        let two = std::fs::read_to_string(format!("{}.2", base.display())).unwrap();
        assert_eq!(one, "current");
        assert_eq!(two, "one");
    }

    #[test]
    fn test_rotate_missing_files_ok() {
        let dir = tempfile::tempdir().unwrap();
        rotate_log_file(&dir.path().join("absent.log"), 3);
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"line one\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\n");
    }

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive("debug"), "mcp_proxy=debug,warn");
        assert!(data_dir().ends_with("mcp-proxy") || data_dir().ends_with(".mcp-proxy"));
    }
}
