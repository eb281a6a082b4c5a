//! Local SQLite database layer.
//!
//! Uses rusqlite with WAL mode. Holds the three persisted slots the engine
//! needs: the store snapshot and the client identity (both in
//! `local_settings`) and the ordered mutation queue (`sync_queue`).

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

/// Shared database handle. One per engine instance.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

pub const CATEGORY_STORE: &str = "store";
pub const CATEGORY_CLIENT: &str = "client";
pub const KEY_SNAPSHOT: &str = "snapshot";
pub const KEY_CLIENT_ID: &str = "client_id";

/// Open the database at `path`.
///
/// Creates the parent directory if needed, sets pragmas and runs pending
/// migrations. On corruption or open failure, deletes the file and retries
/// once.
pub fn init(path: &Path) -> SyncResult<DbState> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| SyncError::Persistence(format!("Failed to create data dir: {e}")))?;
    }

    info!("Opening database at {}", path.display());

    let conn = match open_and_migrate(path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if path.exists() {
                let _ = fs::remove_file(path);
                let _ = fs::remove_file(path.with_extension("db-wal"));
                let _ = fs::remove_file(path.with_extension("db-shm"));
            }
            open_and_migrate(path).map_err(|e| {
                SyncError::Persistence(format!("Database open failed after retry: {e}"))
            })?
        }
    };

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: path.to_path_buf(),
    })
}

/// Fresh in-memory database with the full schema. Nothing survives drop.
pub fn open_in_memory() -> SyncResult<DbState> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

fn open_and_migrate(path: &Path) -> SyncResult<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    run_migrations(&conn)?;
    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> SyncResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: settings slots.
fn migrate_v1(conn: &Connection) -> SyncResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )?;
    Ok(())
}

/// Migration v2: ordered mutation queue.
fn migrate_v2(conn: &Connection) -> SyncResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sync_queue (
            seq INTEGER PRIMARY KEY,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            enqueued_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings slots
// ---------------------------------------------------------------------------

pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> SyncResult<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// Stable per-instance identity, generated on first use and reused after.
pub fn get_or_create_client_id(db: &DbState) -> SyncResult<String> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| SyncError::Persistence(e.to_string()))?;
    if let Some(existing) = get_setting(&conn, CATEGORY_CLIENT, KEY_CLIENT_ID) {
        if !existing.trim().is_empty() {
            return Ok(existing);
        }
    }
    let id = format!("c_{}", Uuid::new_v4().simple());
    set_setting(&conn, CATEGORY_CLIENT, KEY_CLIENT_ID, &id)?;
    info!(client_id = %id, "generated new client identity");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_create_tables() {
        let db = open_in_memory().expect("open");
        let conn = db.conn.lock().unwrap();
        let tables = table_names(&conn);
        assert!(tables.contains(&"local_settings".to_string()));
        assert!(tables.contains(&"sync_queue".to_string()));

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let db = open_in_memory().expect("open");
        let conn = db.conn.lock().unwrap();
        run_migrations(&conn).expect("second run");
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, CURRENT_SCHEMA_VERSION as i64);
    }

    #[test]
    fn test_setting_roundtrip_and_overwrite() {
        let db = open_in_memory().expect("open");
        let conn = db.conn.lock().unwrap();
        assert!(get_setting(&conn, "store", "snapshot").is_none());
        set_setting(&conn, "store", "snapshot", "{}").unwrap();
        set_setting(&conn, "store", "snapshot", "{\"lastUpdated\":5}").unwrap();
        assert_eq!(
            get_setting(&conn, "store", "snapshot").as_deref(),
            Some("{\"lastUpdated\":5}")
        );
    }

    #[test]
    fn test_client_id_is_stable() {
        let db = open_in_memory().expect("open");
        let first = get_or_create_client_id(&db).unwrap();
        let second = get_or_create_client_id(&db).unwrap();
        assert!(first.starts_with("c_"));
        assert_eq!(first, second);
    }

    #[test]
    fn test_init_recovers_from_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.db");
        fs::write(&path, vec![0x5a_u8; 4096]).unwrap();

        let db = init(&path).expect("init should recreate the file");
        let conn = db.conn.lock().unwrap();
        assert!(table_names(&conn).contains(&"sync_queue".to_string()));
    }

    #[test]
    fn test_client_id_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("orders.db");
        let first = {
            let db = init(&path).unwrap();
            get_or_create_client_id(&db).unwrap()
        };
        let db = init(&path).unwrap();
        assert_eq!(get_or_create_client_id(&db).unwrap(), first);
    }
}
