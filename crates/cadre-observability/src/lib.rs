mod ring;

pub use ring::{DebugRing, DebugRingConfig, FanoutMetrics, FanoutMetricsSnapshot, RingEvent};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Daily-rolled engine log files are named
/// `cadre-engine.<YYYY-MM-DD>.jsonl`.
pub const LOG_FILE_PREFIX: &str = "cadre-engine";
pub const LOG_FILE_SUFFIX: &str = "jsonl";

#[derive(Debug, Clone)]
pub struct LoggingOptions {
    pub logs_dir: PathBuf,
    pub retention_days: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub logs_dir: String,
    pub file_prefix: String,
    pub retention_days: u64,
    pub pruned_files: usize,
    pub initialized_at: DateTime<Utc>,
}

/// Structured operational event. Every field is optional except the event
/// name and component so call sites stay terse.
#[derive(Debug, Clone, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub correlation_id: Option<&'a str>,
    pub thread_id: Option<&'a str>,
    pub run_id: Option<&'a str>,
    pub agent_id: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

impl<'a> ObservabilityEvent<'a> {
    pub fn new(event: &'a str, component: &'a str) -> Self {
        Self {
            event,
            component,
            correlation_id: None,
            thread_id: None,
            run_id: None,
            agent_id: None,
            status: None,
            error_code: None,
            detail: None,
        }
    }
}

pub fn emit_event(level: Level, event: ObservabilityEvent<'_>) {
    macro_rules! log_at {
        ($mac:ident) => {
            tracing::$mac!(
                target: "cadre.obs",
                component = event.component,
                event = event.event,
                correlation_id = event.correlation_id.unwrap_or(""),
                thread_id = event.thread_id.unwrap_or(""),
                run_id = event.run_id.unwrap_or(""),
                agent_id = event.agent_id.unwrap_or(""),
                status = event.status.unwrap_or(""),
                error_code = event.error_code.unwrap_or(""),
                detail = event.detail.unwrap_or(""),
                "observability_event"
            )
        };
    }
    match level {
        Level::ERROR => log_at!(error),
        Level::WARN => log_at!(warn),
        Level::DEBUG => log_at!(debug),
        Level::TRACE => log_at!(trace),
        _ => log_at!(info),
    }
}

/// Replace sensitive text with a length + hash marker before it reaches logs.
pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!(
        "[redacted len={} hash={}]",
        trimmed.len(),
        short_hash(trimmed)
    )
}

pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Initialize engine tracing: a compact console layer plus a daily-rolling
/// JSONL file layer under `logs_dir`, after pruning files past retention.
/// `LOG_LEVEL` (then `RUST_LOG`) drives the filter; `info` is the fallback.
/// The returned guard must stay alive for the process lifetime or buffered
/// file output is lost.
pub fn init_engine_logging(
    options: &LoggingOptions,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(&options.logs_dir)?;
    let pruned_files = prune_stale_logs(&options.logs_dir, options.retention_days)?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .build(&options.logs_dir)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);
    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(true);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    let info = LoggingInitInfo {
        logs_dir: options.logs_dir.display().to_string(),
        file_prefix: LOG_FILE_PREFIX.to_string(),
        retention_days: options.retention_days,
        pruned_files,
        initialized_at: Utc::now(),
    };
    Ok((guard, info))
}

fn env_filter() -> EnvFilter {
    if let Ok(level) = std::env::var("LOG_LEVEL") {
        if !level.trim().is_empty() {
            if let Ok(filter) = EnvFilter::try_new(level.trim()) {
                return filter;
            }
        }
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Delete engine log files whose modification time is past the retention
/// window. Selection goes by mtime, not by parsing dates out of file
/// names, so renamed or hand-rotated files age out the same way. Only
/// files matching the engine's own prefix and suffix are touched.
pub fn prune_stale_logs(logs_dir: &Path, retention_days: u64) -> anyhow::Result<usize> {
    let cutoff = SystemTime::now() - Duration::from_secs(retention_days * 24 * 60 * 60);
    let suffix = format!(".{LOG_FILE_SUFFIX}");

    let mut pruned = 0usize;
    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(LOG_FILE_PREFIX) || !name.ends_with(&suffix) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let Ok(modified) = meta.modified() else { continue };
        if modified < cutoff && fs::remove_file(entry.path()).is_ok() {
            pruned += 1;
        }
    }
    Ok(pruned)
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redaction_hides_agent_credentials() {
        let raw = "OPENAI_API_KEY=sk-cadre-agent-0042";
        let redacted = redact_text(raw);
        assert!(redacted.starts_with("[redacted len="));
        assert!(redacted.contains("hash="));
        assert!(!redacted.contains("sk-cadre-agent-0042"));
        // Same secret, same marker: operators can correlate occurrences.
        assert_eq!(redacted, redact_text(raw));
        assert_eq!(redact_text("   "), "");
    }

    #[test]
    fn prune_removes_only_aged_engine_logs() {
        let dir = tempfile::tempdir().unwrap();
        let engine_log = dir.path().join("cadre-engine.2026-07-01.jsonl");
        let foreign_log = dir.path().join("agent-transcript.2020-01-01.jsonl");
        let wrong_suffix = dir.path().join("cadre-engine.2020-01-01.log");
        std::fs::write(&engine_log, "{}\n").unwrap();
        std::fs::write(&foreign_log, "{}\n").unwrap();
        std::fs::write(&wrong_suffix, "{}\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(25));

        // Zero retention ages everything out immediately.
        let pruned = prune_stale_logs(dir.path(), 0).unwrap();
        assert_eq!(pruned, 1);
        assert!(!engine_log.exists());
        assert!(foreign_log.exists());
        assert!(wrong_suffix.exists());
    }

    #[test]
    fn prune_keeps_files_inside_the_retention_window() {
        let dir = tempfile::tempdir().unwrap();
        let engine_log = dir.path().join("cadre-engine.2026-08-01.jsonl");
        std::fs::write(&engine_log, "{}\n").unwrap();

        let pruned = prune_stale_logs(dir.path(), 14).unwrap();
        assert_eq!(pruned, 0);
        assert!(engine_log.exists());
    }

    #[test]
    fn canonical_logs_dir_joins_logs_folder() {
        let root = PathBuf::from("/var/lib/cadre");
        assert_eq!(
            canonical_logs_dir_from_root(&root),
            PathBuf::from("/var/lib/cadre").join("logs")
        );
    }
}
