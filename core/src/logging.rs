use r2d2_sqlite::rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::{json, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::change::TransactionPhase;
use crate::errors::ReconcileError;
use crate::reconcile::PassSummary;

const MODULE: &str = "reconcile";

pub fn log_event(
    conn: &Connection,
    level: &str,
    code: Option<&str>,
    module: &str,
    message: &str,
    explain: Option<&str>,
    data: Option<Value>,
) -> rusqlite::Result<()> {
    let id = Uuid::new_v4().to_string();
    let ts = OffsetDateTime::now_utc().unix_timestamp();
    let data_str = data.map(|v| v.to_string());
    conn.execute(
        "INSERT INTO event_log (id, ts, level, code, module, message, explain, data) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![id, ts, level, code, module, message, explain, data_str],
    )?;
    Ok(())
}

/// Audit record of a pass that ran to completion.
pub fn record_pass(conn: &Connection, summary: &PassSummary) -> rusqlite::Result<()> {
    let level = if summary.skipped.is_empty() { "info" } else { "warn" };
    let message = format!(
        "{} {} pass: {} applied, {} skipped{}",
        summary.adapter,
        summary.phase.as_str(),
        summary.applied,
        summary.skipped.len(),
        if summary.stored { ", stored" } else { "" }
    );
    log_event(
        conn,
        level,
        None,
        MODULE,
        &message,
        None,
        serde_json::to_value(summary).ok(),
    )
}

/// Audit record of a failed pass, tagged with the error's catalogue code.
pub fn record_failure(
    conn: &Connection,
    subtree: &str,
    phase: TransactionPhase,
    err: &ReconcileError,
) -> rusqlite::Result<()> {
    log_event(
        conn,
        "error",
        Some(err.code()),
        MODULE,
        &err.to_string(),
        Some(err.explain()),
        Some(json!({ "subtree": subtree, "phase": phase.as_str() })),
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub id: String,
    pub ts: i64,
    pub level: String,
    pub code: Option<String>,
    pub module: String,
    pub message: String,
    pub explain: Option<String>,
    pub data: Option<Value>,
}

/// Newest first.
pub fn recent_events(
    conn: &Connection,
    module: &str,
    limit: usize,
) -> rusqlite::Result<Vec<EventRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, ts, level, code, module, message, explain, data FROM event_log
         WHERE module = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![module, limit as i64], |row| {
        let data: Option<String> = row.get(7)?;
        Ok(EventRecord {
            id: row.get(0)?,
            ts: row.get(1)?,
            level: row.get(2)?,
            code: row.get(3)?,
            module: row.get(4)?,
            message: row.get(5)?,
            explain: row.get(6)?,
            data: data.and_then(|raw| serde_json::from_str(&raw).ok()),
        })
    })?;

    let mut events = Vec::new();
    for row in rows {
        events.push(row?);
    }
    Ok(events)
}
