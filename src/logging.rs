use std::io;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

// Held for the process lifetime so the non-blocking writer keeps draining;
// `flush` takes it down on the fatal path.
static GUARD: OnceLock<Mutex<Option<WorkerGuard>>> = OnceLock::new();

pub fn init(cfg: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            EnvFilter::try_new(match cfg.level.trim().to_ascii_lowercase().as_str() {
                "debug" => "debug",
                "warn" => "warn",
                "error" => "error",
                _ => "info",
            })
        })
        .context("logging: init filter")?;

    let (writer, guard) = make_writer(cfg.output.trim())?;

    let fmt = cfg.format.trim().to_ascii_lowercase();
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(fmt == "text")
        .with_target(false)
        .with_file(cfg.add_source)
        .with_line_number(cfg.add_source);
    let layer = if fmt == "json" {
        layer.json().boxed()
    } else {
        layer.boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging: {e}"))?;

    GUARD
        .get_or_init(|| Mutex::new(None))
        .lock()
        .expect("logging guard lock")
        .replace(guard);
    Ok(())
}

/// Drops the writer guard, flushing anything still buffered. Used right
/// before a fatal exit.
pub fn flush() {
    if let Some(m) = GUARD.get() {
        if let Ok(mut g) = m.lock() {
            g.take();
        }
    }
}

fn make_writer(
    output: &str,
) -> anyhow::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    match output {
        "" | "stderr" => Ok(tracing_appender::non_blocking(io::stderr())),
        "stdout" => Ok(tracing_appender::non_blocking(io::stdout())),
        "discard" => Ok(tracing_appender::non_blocking(io::sink())),
        path => {
            let p = Path::new(path);
            if let Some(parent) = p.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("logging: mkdir {}", parent.display()))?;
                }
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .with_context(|| format!("logging: open {}", p.display()))?;
            Ok(tracing_appender::non_blocking(file))
        }
    }
}
