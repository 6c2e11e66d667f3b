use std::env;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::Subscriber;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, Registry, prelude::*};

use crate::config::{Config, LogFormat};

/// Target tag of the per-task and summary records in the run log.
pub const RECORD_TARGET: &str = "benchmark::record";

/// How often a log file name is retried with a suffix before giving up.
const MAX_NAME_ATTEMPTS: u32 = 100;

/// The JSON-lines run log shared by records and diagnostics.
///
/// Records are written directly so their payload stays nested JSON. Diagnostics reach the same
/// writer through [`run_log_layer`]. Every line is written with a single call under the lock, so
/// lines from concurrent tasks never interleave.
#[derive(Clone)]
pub struct RunLog {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl fmt::Debug for RunLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLog").finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct Record<'a, T> {
    timestamp_us: i64,
    target: &'static str,
    message: &'a str,
    #[serde(flatten)]
    fields: &'a T,
}

impl RunLog {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// A run log that discards everything.
    pub fn sink() -> Self {
        Self::new(io::sink())
    }

    /// Creates `<dir>/<unix seconds>.log`.
    ///
    /// Existing files are never truncated. If the name is taken, a numeric suffix is appended.
    pub fn create(dir: &Path) -> Result<(Self, PathBuf)> {
        fs::create_dir_all(dir).context("failed to create log directory")?;
        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = match attempt {
                0 => format!("{timestamp}.log"),
                n => format!("{timestamp}-{n}.log"),
            };
            let path = dir.join(name);

            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((Self::new(file), path)),
                Err(error) if error.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(error) => return Err(error).context("failed to create log file"),
            }
        }

        anyhow::bail!("no free log file name for timestamp {timestamp}")
    }

    /// Appends one record line with `message` and the fields of `fields` at the top level.
    pub fn record<T: Serialize>(&self, message: &str, fields: &T) -> crate::Result<()> {
        let record = Record {
            timestamp_us: unix_micros(),
            target: RECORD_TARGET,
            message,
            fields,
        };

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        self.lock().write_all(&line)?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn Write + Send>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A locked handle on the [`RunLog`] for a single diagnostic line.
pub struct RunLogWriter<'a>(MutexGuard<'a, Box<dyn Write + Send>>);

impl Write for RunLogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<'a> MakeWriter<'a> for RunLog {
    type Writer = RunLogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RunLogWriter(self.lock())
    }
}

pub(crate) fn unix_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as i64)
        .unwrap_or_default()
}

/// Writes diagnostics of this crate at INFO and above, and of dependencies at WARN and above, as
/// JSON lines into `run_log`.
pub fn run_log_layer<S>(run_log: RunLog) -> impl Layer<S> + Send + Sync
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .json()
        .flatten_event(true)
        .with_ansi(false)
        .with_writer(run_log)
        .with_filter(
            Targets::new()
                .with_default(LevelFilter::WARN)
                .with_target("benchmark", LevelFilter::INFO),
        )
}

/// Installs the global subscriber and creates the run log.
///
/// Console output goes to stderr in the configured format. Diagnostics are also written to the
/// run log at `<log_dir>/<unix seconds>.log`, which is returned along with its path.
pub fn init_tracing(config: &Config) -> Result<(RunLog, PathBuf)> {
    let (run_log, path) = RunLog::create(&config.log_dir)?;

    let console = tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(true);
    let console: Box<dyn Layer<Registry> + Send + Sync> = match resolve_format(config) {
        LogFormat::Json => console.json().boxed(),
        LogFormat::Simplified => console.with_ansi(false).boxed(),
        LogFormat::Pretty | LogFormat::Auto => console.compact().with_ansi(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(console.with_filter(console_filter(config.logging.level)?))
        .with(run_log_layer(run_log.clone()))
        .init();

    Ok((run_log, path))
}

fn resolve_format(config: &Config) -> LogFormat {
    match config.logging.format {
        LogFormat::Auto if std::io::stderr().is_terminal() => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        format => format,
    }
}

/// Uses `RUST_LOG` literally if set, otherwise the configured level.
fn console_filter(level: LevelFilter) -> Result<EnvFilter> {
    let directives = match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(value) if !value.is_empty() => value,
        _ => level.to_string(),
    };

    Ok(EnvFilter::try_new(directives)?)
}

/// Reads a run log back as one JSON value per line.
#[cfg(test)]
pub(crate) fn read_run_log(path: &Path) -> Vec<serde_json::Value> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}
