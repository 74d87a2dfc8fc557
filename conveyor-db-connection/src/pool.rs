use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info, warn};

use crate::config::DbConnectionConfig;
use crate::error::DbConnectionError;
use crate::utils::{config_metadata, sanitize_database_url};

pub type DbPool = SqlitePool;

// SQLite memory database patterns for efficient checking
pub const SQLITE_MEMORY_PATTERNS: &[&[u8]] = &[b":memory:", b"mode=memory"];

/// Whether `url` names an in-memory SQLite database.
pub fn is_memory_url(url: &str) -> bool {
    let url_bytes = url.as_bytes();
    SQLITE_MEMORY_PATTERNS.iter().any(|&pattern| {
        url_bytes
            .windows(pattern.len())
            .any(|w| w.eq_ignore_ascii_case(pattern))
    })
}

/// Creates the SQLite pool described by `config`.
///
/// File databases (and their parent directory) are created if missing and
/// opened in WAL mode so several processes can share them. An in-memory
/// database lives only as long as its connection, so its pool is pinned to a
/// single connection that is never recycled.
pub async fn create_pool(config: &DbConnectionConfig) -> Result<DbPool, DbConnectionError> {
    config.validate()?;
    debug!(config = %config_metadata(config), "creating database pool");
    let url = config.url.trim();
    let display_url = sanitize_database_url(url);
    let memory = is_memory_url(url);

    let mut connect = SqliteConnectOptions::from_str(url)?
        .busy_timeout(config.busy_timeout())
        .foreign_keys(true);

    let mut opts = SqlitePoolOptions::new().acquire_timeout(config.connect_timeout());
    if memory {
        if config.max_connections > 1 {
            debug!(url = %display_url, "in-memory database: limiting pool to one connection");
        }
        opts = opts
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    } else {
        ensure_sqlite_db_file_exists(url)?;
        connect = connect
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        opts = opts
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .idle_timeout(config.idle_timeout());
    }

    match opts.connect_with(connect).await {
        Ok(pool) => {
            info!(
                url = %display_url,
                max_connections = if memory { 1 } else { config.max_connections },
                "database pool created"
            );
            Ok(pool)
        }
        Err(err) => {
            warn!(url = %display_url, error = %err, "failed to create database pool");
            Err(err.into())
        }
    }
}

/// Extract the file path from a SQLite connection URL.
/// Returns None for in-memory databases or empty paths.
pub(crate) fn sqlite_file_path(url: &str) -> Option<&str> {
    if is_memory_url(url) {
        return None;
    }

    let mut path = url;
    path = path
        .strip_prefix("sqlite://")
        .or_else(|| path.strip_prefix("sqlite:"))
        .unwrap_or(path);
    path = path.strip_prefix("file:").unwrap_or(path);

    if let Some(idx) = path.find('?') {
        path = &path[..idx];
    }

    let path = path.trim();
    if path.is_empty() {
        return None;
    }

    // On Windows: strip leading slash before drive letter ("/C:/...")
    if path.len() > 2 && path.starts_with('/') && path.as_bytes().get(2) == Some(&b':') {
        Some(&path[1..])
    } else {
        Some(path)
    }
}

fn ensure_sqlite_db_file_exists(database_url: &str) -> Result<(), DbConnectionError> {
    use std::fs::create_dir_all;
    use std::path::Path;

    let Some(clean_path) = sqlite_file_path(database_url) else {
        return Ok(());
    };

    let db_path = Path::new(clean_path);
    if let Some(parent) = db_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty() && !p.exists())
    {
        create_dir_all(parent).map_err(|e| {
            DbConnectionError::FileCreation(format!(
                "failed to create parent directory '{}': {e}",
                parent.display()
            ))
        })?;
    }
    Ok(())
}
