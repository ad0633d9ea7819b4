use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, error, info};

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    CREATE TABLE IF NOT EXISTS secrets (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

pub fn init_db(state_dir: &str) -> Result<Connection> {
    debug!("Initializing database in: {}", state_dir);
    if !Path::new(state_dir).exists() {
        info!("Creating state directory: {}", state_dir);
        fs::create_dir_all(state_dir).context("create state dir")?;
    }
    let db_path = Path::new(state_dir).join("delivery-ops.db");
    let conn = Connection::open(&db_path).context("open sqlite db")?;

    if let Err(e) = conn.execute_batch(SCHEMA) {
        error!("Failed to initialize database schema: {}", e);
        return Err(e.into());
    }

    info!("Database initialized successfully at {:?}", db_path);
    Ok(conn)
}

/// Same schema as [`init_db`], without touching the filesystem.
pub fn init_memory_db() -> Result<Connection> {
    let conn = Connection::open_in_memory().context("open in-memory sqlite db")?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

// --- Secrets (obfuscated at rest) ---

const SECRET_KEY_XOR: &[u8] = b"delivery-ops-secret-pad";

fn obfuscate(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    for (i, &b) in bytes.iter().enumerate() {
        result.push(b ^ SECRET_KEY_XOR[i % SECRET_KEY_XOR.len()]);
    }
    hex::encode(result)
}

fn deobfuscate(input: &str) -> Result<String> {
    let bytes = hex::decode(input).context("decode hex secret")?;
    let mut result = Vec::with_capacity(bytes.len());
    for (i, &b) in bytes.iter().enumerate() {
        result.push(b ^ SECRET_KEY_XOR[i % SECRET_KEY_XOR.len()]);
    }
    String::from_utf8(result).context("parse utf8 secret")
}

pub fn set_secret(conn: &Connection, key: &str, value: &str) -> Result<()> {
    let val = obfuscate(value);
    conn.execute(
        "INSERT OR REPLACE INTO secrets (key, value) VALUES (?, ?)",
        params![key, val],
    )?;
    Ok(())
}

pub fn get_secret(conn: &Connection, key: &str) -> Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT value FROM secrets WHERE key = ?")?;
    let mut rows = stmt.query(params![key])?;
    if let Some(row) = rows.next()? {
        let val: String = row.get(0)?;
        Ok(Some(deobfuscate(&val)?))
    } else {
        Ok(None)
    }
}

/// Returns true when a secret was actually removed.
pub fn delete_secret(conn: &Connection, key: &str) -> Result<bool> {
    let changed = conn.execute("DELETE FROM secrets WHERE key = ?", params![key])?;
    Ok(changed > 0)
}

// --- Settings (non-secret config) ---

pub fn set_setting(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)",
        params![key, value],
    )?;
    Ok(())
}

pub fn load_all_settings(conn: &Connection) -> Result<HashMap<String, String>> {
    let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut map = HashMap::new();
    for row in rows {
        let (k, v) = row?;
        map.insert(k, v);
    }
    Ok(map)
}

pub fn has_settings(conn: &Connection) -> Result<bool> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM settings", [], |row| row.get(0))?;
    Ok(count > 0)
}
