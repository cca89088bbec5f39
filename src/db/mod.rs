use std::path::Path;

use anyhow::{Context, Result};
use tokio_rusqlite::{Connection, rusqlite};

pub mod jobs;

pub async fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .await
        .with_context(|| format!("Failed to open database at {}", path.display()))?;
    migrate(&conn).await?;
    Ok(conn)
}

pub async fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()
        .await
        .context("Failed to open in-memory database")?;
    migrate(&conn).await?;
    Ok(conn)
}

async fn migrate(conn: &Connection) -> Result<()> {
    conn.call(|conn| {
        // SQLite leaves foreign keys off unless asked
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok::<(), rusqlite::Error>(())
    })
    .await
    .context("Failed to apply database schema")?;

    Ok(())
}
