//! Structured logging module for Quantum Storytelling
//!
//! Emits `tracing` events tagged with a category field:
//! - TENSOR: profile reads, merges and replacements
//! - GENERATION: single-shot generation tasks
//! - CHORUS: debate, structure, parallel threads, weave
//! - CALIBRATION: conversational profile refinement
//! - SEARCH: semantic search
//! - STORY: story persistence
//! - ERROR: errors that were absorbed or mapped at the boundary
//!
//! Console output always; a daily file under the configured log directory when set.

use chrono::{Local, Utc};
use once_cell::sync::Lazy;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Error, Result};

const DEFAULT_FILTER: &str = "quantum_storytelling=info,tower_http=info";
const LOG_FILE_PREFIX: &str = "quantum-storytelling-";
const LOG_RETENTION_DAYS: i64 = 7;

/// Log categories for structured logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    Tensor,
    Generation,
    Chorus,
    Calibration,
    Search,
    Story,
    Error,
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Tensor => "TENSOR",
            LogCategory::Generation => "GENERATION",
            LogCategory::Chorus => "CHORUS",
            LogCategory::Calibration => "CALIBRATION",
            LogCategory::Search => "SEARCH",
            LogCategory::Story => "STORY",
            LogCategory::Error => "ERROR",
        }
    }
}

/// Directory the file layer writes to, if any
static LOG_DIR: Lazy<Mutex<Option<PathBuf>>> = Lazy::new(|| Mutex::new(None));

fn log_file_name() -> String {
    format!("{}{}.log", LOG_FILE_PREFIX, Local::now().format("%Y-%m-%d"))
}

/// Install the global subscriber. Safe to call once per process.
pub fn init_logging(log_dir: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let file_layer = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .map_err(|e| Error::Config(format!("cannot create log dir {}: {}", dir.display(), e)))?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(log_file_name()))
                .map_err(|e| Error::Config(format!("cannot open log file: {}", e)))?;
            if let Ok(mut slot) = LOG_DIR.lock() {
                *slot = Some(dir.to_path_buf());
            }
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {}", e)))?;

    log(LogCategory::Story, None, "Quantum Storytelling logging initialized");
    Ok(())
}

/// Log a message with category and optional user context
pub fn log(category: LogCategory, user_id: Option<&str>, message: &str) {
    let user = user_id.map(|id| &id[..id.char_indices().nth(12).map(|(i, _)| i).unwrap_or(id.len())]);
    match (category, user) {
        (LogCategory::Error, Some(user)) => {
            tracing::error!(category = category.as_str(), user, "{}", message)
        }
        (LogCategory::Error, None) => tracing::error!(category = category.as_str(), "{}", message),
        (_, Some(user)) => tracing::info!(category = category.as_str(), user, "{}", message),
        (_, None) => tracing::info!(category = category.as_str(), "{}", message),
    }
}

pub fn log_tensor(user_id: Option<&str>, message: &str) {
    log(LogCategory::Tensor, user_id, message);
}

pub fn log_generation(user_id: Option<&str>, message: &str) {
    log(LogCategory::Generation, user_id, message);
}

pub fn log_chorus(user_id: Option<&str>, message: &str) {
    log(LogCategory::Chorus, user_id, message);
}

pub fn log_calibration(user_id: Option<&str>, message: &str) {
    log(LogCategory::Calibration, user_id, message);
}

pub fn log_search(user_id: Option<&str>, message: &str) {
    log(LogCategory::Search, user_id, message);
}

pub fn log_story(user_id: Option<&str>, message: &str) {
    log(LogCategory::Story, user_id, message);
}

/// Log an error
pub fn log_error(user_id: Option<&str>, message: &str) {
    log(LogCategory::Error, user_id, message);
}

/// Clean up old log files in the configured directory (keep last 7 days)
pub fn cleanup_old_logs() -> std::io::Result<usize> {
    let dir = LOG_DIR.lock().ok().and_then(|slot| slot.clone());
    match dir {
        Some(dir) => cleanup_logs_in(&dir, LOG_RETENTION_DAYS),
        None => Ok(0),
    }
}

fn cleanup_logs_in(log_dir: &Path, keep_days: i64) -> std::io::Result<usize> {
    let mut deleted = 0;

    if !log_dir.exists() {
        return Ok(0);
    }

    let cutoff = Utc::now() - chrono::Duration::days(keep_days);

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_ours = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(LOG_FILE_PREFIX) && n.ends_with(".log"))
            .unwrap_or(false);
        if !is_ours {
            continue;
        }

        if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
            let modified_time: chrono::DateTime<Utc> = modified.into();
            if modified_time < cutoff && fs::remove_file(&path).is_ok() {
                deleted += 1;
            }
        }
    }

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_category_labels() {
        assert_eq!(LogCategory::Chorus.as_str(), "CHORUS");
        assert_eq!(LogCategory::Error.as_str(), "ERROR");
    }

    #[test]
    fn test_log_file_name_is_dated() {
        let name = log_file_name();
        assert!(name.starts_with(LOG_FILE_PREFIX));
        assert!(name.ends_with(".log"));
    }

    #[test]
    fn test_cleanup_removes_only_stale_log_files() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("quantum-storytelling-2020-01-01.log");
        let fresh = dir.path().join(log_file_name());
        let foreign = dir.path().join("notes.txt");
        for path in [&stale, &fresh, &foreign] {
            File::create(path).unwrap();
        }
        let old = SystemTime::now() - Duration::from_secs(30 * 24 * 3600);
        File::options().write(true).open(&stale).unwrap().set_modified(old).unwrap();
        File::options().write(true).open(&foreign).unwrap().set_modified(old).unwrap();

        let deleted = cleanup_logs_in(dir.path(), 7).unwrap();

        assert_eq!(deleted, 1);
        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(foreign.exists());
    }

    #[test]
    fn test_log_without_subscriber_does_not_panic() {
        log_tensor(Some("user_123_quantum_long_identifier"), "merged creative_voice");
        log_error(None, "provider timeout");
    }
}
