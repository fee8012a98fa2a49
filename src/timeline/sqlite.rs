//! SQLite timeline sink.
//!
//! Uses `rusqlite` synchronously on the timeline worker thread.
//! WAL mode is enabled so the database can be inspected while the proxy runs.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{CallStatus, ProxyCallEvent, TimelineError, TimelineEvent, TimelineSink};

/// Persists timeline events into three tables:
/// `proxy_calls`, `discovery_events` and `connection_events`.
pub struct SqliteTimelineSink {
    conn: Connection,
}

impl SqliteTimelineSink {
    /// Open (or create) the timeline database at `path`.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TimelineError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let sink = Self { conn };
        sink.create_tables()?;
        Ok(sink)
    }

    fn create_tables(&self) -> Result<(), TimelineError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS proxy_calls (
                call_id TEXT PRIMARY KEY,
                tool_name TEXT NOT NULL,
                server_name TEXT NOT NULL,
                original_name TEXT NOT NULL,
                parameters TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                duration_ms INTEGER,
                result TEXT,
                error TEXT,
                status TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_calls_server
                ON proxy_calls(server_name, start_time);

            CREATE TABLE IF NOT EXISTS discovery_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                server_name TEXT NOT NULL,
                tools_discovered INTEGER NOT NULL,
                success INTEGER NOT NULL,
                error TEXT,
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS connection_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                server_name TEXT NOT NULL,
                event_type TEXT NOT NULL,
                success INTEGER NOT NULL,
                error TEXT,
                timestamp TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    fn upsert_call(&self, call: &ProxyCallEvent) -> Result<(), TimelineError> {
        let result = call.result.as_ref().map(serde_json::to_string).transpose()?;
        self.conn.execute(
            "INSERT OR REPLACE INTO proxy_calls
                (call_id, tool_name, server_name, original_name, parameters,
                 start_time, end_time, duration_ms, result, error, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                call.call_id,
                call.tool_name,
                call.server_name,
                call.original_name,
                serde_json::to_string(&call.parameters)?,
                call.start_time.to_rfc3339(),
                call.end_time.map(|t| t.to_rfc3339()),
                call.duration_ms.map(|d| d as i64),
                result,
                call.error,
                call.status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Look up one call by id.
    pub fn get_call(&self, call_id: &str) -> Result<Option<ProxyCallEvent>, TimelineError> {
        let call = self
            .conn
            .query_row(
                "SELECT call_id, tool_name, server_name, original_name, parameters,
                        start_time, end_time, duration_ms, result, error, status
                 FROM proxy_calls WHERE call_id = ?1",
                params![call_id],
                row_to_call,
            )
            .optional()?;
        Ok(call)
    }

    /// Most recent calls first.
    pub fn recent_calls(&self, limit: usize) -> Result<Vec<ProxyCallEvent>, TimelineError> {
        let mut stmt = self.conn.prepare(
            "SELECT call_id, tool_name, server_name, original_name, parameters,
                    start_time, end_time, duration_ms, result, error, status
             FROM proxy_calls ORDER BY start_time DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_call)?;
        let mut calls = Vec::new();
        for row in rows {
            calls.push(row?);
        }
        Ok(calls)
    }

    /// Row counts per table: `(calls, discovery, connection)`.
    pub fn counts(&self) -> Result<(u64, u64, u64), TimelineError> {
        let count = |table: &str| -> Result<u64, rusqlite::Error> {
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get::<_, i64>(0)
                })
                .map(|n| n.max(0) as u64)
        };
        Ok((
            count("proxy_calls")?,
            count("discovery_events")?,
            count("connection_events")?,
        ))
    }
}

impl TimelineSink for SqliteTimelineSink {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn record(&mut self, event: &TimelineEvent) -> Result<(), TimelineError> {
        match event {
            TimelineEvent::CallStarted(call) | TimelineEvent::CallFinished(call) => {
                self.upsert_call(call)
            }
            TimelineEvent::Discovery(d) => {
                self.conn.execute(
                    "INSERT INTO discovery_events
                        (server_name, tools_discovered, success, error, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        d.server_name,
                        d.tools_discovered as i64,
                        d.success,
                        d.error,
                        d.timestamp.to_rfc3339(),
                    ],
                )?;
                Ok(())
            }
            TimelineEvent::Connection(c) => {
                self.conn.execute(
                    "INSERT INTO connection_events
                        (server_name, event_type, success, error, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        c.server_name,
                        c.event_type,
                        c.success,
                        c.error,
                        c.timestamp.to_rfc3339(),
                    ],
                )?;
                Ok(())
            }
        }
    }
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

fn parse_json(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn row_to_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProxyCallEvent> {
    let start: String = row.get(5)?;
    let end: Option<String> = row.get(6)?;
    let duration: Option<i64> = row.get(7)?;
    let status: String = row.get(10)?;
    Ok(ProxyCallEvent {
        call_id: row.get(0)?,
        tool_name: row.get(1)?,
        server_name: row.get(2)?,
        original_name: row.get(3)?,
        parameters: parse_json(row.get(4)?).unwrap_or(serde_json::Value::Null),
        start_time: parse_time(&start),
        end_time: end.as_deref().map(parse_time),
        duration_ms: duration.map(|d| d.max(0) as u64),
        result: parse_json(row.get(8)?),
        error: row.get(9)?,
        status: CallStatus::parse(&status),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
