use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::PathBuf;

use crate::config;

pub type DbPool = Pool<SqliteConnectionManager>;

pub fn init_db(state_dir: PathBuf) -> Result<DbPool> {
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("failed to create {}", state_dir.display()))?;
    let db_path = state_dir.join("sysconf.db");
    let mgr = SqliteConnectionManager::file(&db_path);
    let pool = Pool::new(mgr)?;
    prepare(&pool)?;
    Ok(pool)
}

/// Single-connection pool over a private in-memory database.
pub fn init_in_memory() -> Result<DbPool> {
    let pool = Pool::builder()
        .max_size(1)
        .build(SqliteConnectionManager::memory())?;
    prepare(&pool)?;
    Ok(pool)
}

fn prepare(pool: &DbPool) -> Result<()> {
    let conn = pool.get()?;
    apply_migrations(&conn)?;
    config::seed_defaults(&conn)?;
    Ok(())
}

pub fn apply_migrations(conn: &Connection) -> Result<()> {
    let migrations: &[(&str, &str)] = &[
        (
            "0001_init.sql",
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../migrations/0001_init.sql"
            )),
        ),
        (
            "0002_identity.sql",
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../migrations/0002_identity.sql"
            )),
        ),
    ];

    for (name, sql) in migrations {
        conn.execute_batch(sql)
            .with_context(|| format!("failed to apply migration {name}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn init_creates_database_and_seeds_settings() {
        let tmp = TempDir::new().unwrap();
        let pool = init_db(tmp.path().join("state")).unwrap();
        assert!(tmp.path().join("state/sysconf.db").exists());

        let conn = pool.get().unwrap();
        let settings = config::get_settings(&conn).unwrap();
        assert_eq!(settings, config::SystemSettings::default());
    }

    #[test]
    fn migrations_can_be_reapplied() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        apply_migrations(&conn).unwrap();
    }
}
