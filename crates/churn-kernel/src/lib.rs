use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use churn_events::{AuditEvent, EventKind, EventStore, StoreError};
use rusqlite::{params, Connection};

const DEFAULT_BUSY_MS: u64 = 5000;

/// SQLite-backed audit store. Each call opens its own connection, so a
/// `Kernel` can be cloned freely into blocking tasks.
#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
    busy_timeout: Duration,
}

/// Busy timeout (default 5000ms; override with CHURN_SQLITE_BUSY_MS).
fn busy_timeout_from_env() -> Duration {
    let busy_ms: u64 = std::env::var("CHURN_SQLITE_BUSY_MS")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(DEFAULT_BUSY_MS);
    Duration::from_millis(busy_ms)
}

impl Kernel {
    pub fn open(dir: &Path) -> Result<Self> {
        Self::open_with_busy_timeout(dir, busy_timeout_from_env())
    }

    /// Every connection this kernel opens waits at most `busy_timeout` on a
    /// locked database.
    pub fn open_with_busy_timeout(dir: &Path, busy_timeout: Duration) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let kernel = Self {
            db_path: dir.join("audit.sqlite"),
            busy_timeout,
        };
        let conn = kernel.conn()?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init_schema(&conn)?;
        Ok(kernel)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS audit_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              client_id TEXT NOT NULL,
              timestamp INTEGER NOT NULL,
              event_type TEXT NOT NULL,
              message TEXT NOT NULL,
              topic TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_client ON audit_events(client_id);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout
    }

    pub fn append_event(&self, event: &AuditEvent) -> Result<i64> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "INSERT INTO audit_events(client_id,timestamp,event_type,message,topic) VALUES (?,?,?,?,?)",
        )?;
        stmt.execute(params![
            event.client_id,
            event.timestamp,
            event.event_type.as_str(),
            event.message,
            event.topic,
        ])?;
        Ok(conn.last_insert_rowid())
    }

    pub fn events_for_client(&self, client_id: &str) -> Result<Vec<AuditEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT client_id,timestamp,event_type,message,topic FROM audit_events WHERE client_id=? ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![client_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let kind: String = row.get(2)?;
            let event_type =
                EventKind::parse(&kind).ok_or_else(|| anyhow!("unknown event type {kind}"))?;
            out.push(AuditEvent {
                client_id: row.get(0)?,
                timestamp: row.get(1)?,
                event_type,
                message: row.get(3)?,
                topic: row.get(4)?,
            });
        }
        Ok(out)
    }

    pub fn count_events(&self) -> Result<i64> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM audit_events", [], |r| r.get(0))?;
        Ok(n)
    }

    // ---------------- Async wrappers (spawn_blocking) ----------------

    pub async fn append_event_async(&self, event: &AuditEvent) -> Result<i64> {
        let k = self.clone();
        let event = event.clone();
        tokio::task::spawn_blocking(move || k.append_event(&event))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn events_for_client_async(&self, client_id: &str) -> Result<Vec<AuditEvent>> {
        let k = self.clone();
        let client_id = client_id.to_string();
        tokio::task::spawn_blocking(move || k.events_for_client(&client_id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }
}

#[async_trait::async_trait]
impl EventStore for Kernel {
    async fn put_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.append_event_async(event)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn query_client(&self, client_id: &str) -> Result<Vec<AuditEvent>, StoreError> {
        self.events_for_client_async(client_id)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}
