//! Shared logging setup for Gridex binaries.
//!
//! Installs a `tracing` subscriber with two layers: a size-rotated log file
//! under the Gridex home directory and a filtered stderr layer.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "gridex_coordinator=info,gridex_worker=info,gridex_db=info";
const KEPT_LOG_FILES: usize = 5;
const MAX_LOG_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Initialize tracing for a binary. `verbose` raises the stderr layer to
/// the same filter as the file layer instead of warnings only.
pub fn init_logging(app_name: &str, verbose: bool) -> Result<()> {
    let log_dir = ensure_logs_dir()?;
    let writer = RotatingWriter::open(log_dir, app_name)?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let stderr_filter = if verbose {
        file_filter.clone()
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(stderr_filter),
        )
        .init();

    Ok(())
}

/// Gridex home directory: `$GRIDEX_HOME` or `~/.gridex`.
pub fn gridex_home() -> PathBuf {
    if let Ok(home) = std::env::var("GRIDEX_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".gridex")
}

pub fn logs_dir() -> PathBuf {
    gridex_home().join("logs")
}

fn ensure_logs_dir() -> Result<PathBuf> {
    let dir = logs_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    Ok(dir)
}

/// Append-only log writer that rotates `name.log` -> `name.log.1` .. `.N`
/// once the active file crosses the size cap.
#[derive(Clone)]
struct RotatingWriter {
    inner: Arc<Mutex<RotatingState>>,
}

struct RotatingState {
    dir: PathBuf,
    name: String,
    file: File,
    written: u64,
}

impl RotatingWriter {
    fn open(dir: PathBuf, name: &str) -> Result<Self> {
        let name = sanitize(name);
        let path = dir.join(format!("{name}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            inner: Arc::new(Mutex::new(RotatingState {
                dir,
                name,
                file,
                written,
            })),
        })
    }
}

impl RotatingState {
    fn active_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.name))
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{index}", self.name))
    }

    fn rotate(&mut self) -> io::Result<()> {
        let _ = self.file.flush();

        let oldest = self.rotated_path(KEPT_LOG_FILES - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for index in (1..KEPT_LOG_FILES - 1).rev() {
            let src = self.rotated_path(index);
            if src.exists() {
                fs::rename(&src, self.rotated_path(index + 1))?;
            }
        }
        fs::rename(self.active_path(), self.rotated_path(1))?;

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.active_path())?;
        self.written = 0;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > MAX_LOG_FILE_BYTES {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

struct RotatingGuard {
    inner: Arc<Mutex<RotatingState>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingGuard;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for RotatingGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        state.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        state.file.flush()
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
