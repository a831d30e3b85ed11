use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

/// Keeps the log file open for the life of the process.
pub struct LogGuard {
    file: Option<Arc<Mutex<File>>>,
}

impl LogGuard {
    pub fn has_file(&self) -> bool {
        self.file.is_some()
    }
}

struct MultiWriter {
    stderr_enabled: bool,
    file: Option<Arc<Mutex<File>>>,
}

/// Installs the global subscriber. Stdout belongs to the bridge, so logs go
/// to the file and optionally stderr.
pub fn init_logging(log_dir: &str, instance: &str, stderr_enabled: bool) -> Option<LogGuard> {
    let level = env::var("TABMUX_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match open_log_file(log_dir, instance) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter {
        stderr_enabled,
        file: file.clone(),
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stderr_enabled {
            let _ = io::stderr().write_all(buf);
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stderr_enabled {
            let _ = io::stderr().flush();
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str, instance: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("tabmux-agent-{}.log", sanitize_component(instance)));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

pub fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
