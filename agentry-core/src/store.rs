//! SQLite persistence layer.
//!
//! A single `Store` owns the connection behind a mutex; domain modules write
//! their own parameterized SQL through `with_conn` / `with_tx`. The schema is
//! created by idempotent migrations at open. Every mutable entity table
//! carries a `team_id` column, and tenant-scoped reads go through
//! [`Store::owned_by_team`] so cross-tenant lookups surface as misses rather
//! than permission errors.

use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EngineError, Result, StoreError};

/// Shared persistence handle. Cheap to clone behind an `Arc`.
pub struct Store {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(StoreError::Database)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        info!(path = %path.display(), "Store opened");
        Ok(store)
    }

    /// Open an in-memory database. Used by tests and ephemeral deployments.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(StoreError::Database)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Run a closure with the connection. Keep the closure short; the
    /// connection is a process-wide shared resource.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        f(&conn).map_err(EngineError::from)
    }

    /// Run a closure inside a transaction. Rolls back on error.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction().map_err(StoreError::Database)?;
        let value = f(&tx).map_err(EngineError::from)?;
        tx.commit().map_err(StoreError::Database)?;
        Ok(value)
    }

    /// Check that the row `id` in `table` belongs to `team_id`.
    ///
    /// Returns `false` both when the row is missing and when it belongs to
    /// another tenant; callers translate `false` into `NotFound`.
    pub fn owned_by_team(&self, table: &str, id: &Uuid, team_id: &Uuid) -> Result<bool> {
        debug_assert!(
            OWNED_TABLES.contains(&table),
            "ownership check on unknown table {table}"
        );
        let sql = format!("SELECT 1 FROM {table} WHERE id = ?1 AND team_id = ?2");
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            stmt.exists(rusqlite::params![id.to_string(), team_id.to_string()])
        })
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(StoreError::Database)?;
        // journal_mode reports the resulting mode as a row; read it rather
        // than fighting the statement API.
        let _mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(StoreError::Database)?;

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(StoreError::Database)?;

        if version < 1 {
            debug!("Applying schema migration v1");
            conn.execute_batch(SCHEMA_V1)
                .map_err(|e| StoreError::Migration {
                    message: e.to_string(),
                })?;
            conn.pragma_update(None, "user_version", 1)
                .map_err(StoreError::Database)?;
        }
        Ok(())
    }
}

/// Tables that participate in the ownership check.
const OWNED_TABLES: &[&str] = &[
    "agents",
    "tasks",
    "goals",
    "measurable_goals",
    "approvals",
    "chat_channels",
    "sor_tables",
    "kb_documents",
];

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS teams (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS team_members (
    team_id     TEXT NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    user_id     TEXT NOT NULL,
    role        TEXT NOT NULL CHECK (role IN ('admin', 'member', 'viewer')),
    created_at  TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (team_id, user_id)
);

CREATE TABLE IF NOT EXISTS subscriptions (
    team_id     TEXT PRIMARY KEY REFERENCES teams(id) ON DELETE CASCADE,
    plan        TEXT NOT NULL,
    active      INTEGER NOT NULL DEFAULT 1,
    renews_at   TEXT
);

CREATE TABLE IF NOT EXISTS credits (
    team_id     TEXT PRIMARY KEY REFERENCES teams(id) ON DELETE CASCADE,
    balance     INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS credit_ledger (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    team_id         TEXT NOT NULL,
    amount          INTEGER NOT NULL,
    reason          TEXT NOT NULL,
    correlation_id  TEXT NOT NULL,
    created_at      TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_ledger_team ON credit_ledger(team_id, created_at);

CREATE TABLE IF NOT EXISTS agents (
    id                  TEXT PRIMARY KEY,
    team_id             TEXT NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    name                TEXT NOT NULL,
    status              TEXT NOT NULL DEFAULT 'stopped'
                        CHECK (status IN ('stopped', 'running', 'error')),
    department          TEXT,
    model_id            TEXT NOT NULL,
    fallback_endpoint   TEXT,
    fallback_model      TEXT,
    system_prompt       TEXT NOT NULL DEFAULT '',
    proactive           INTEGER NOT NULL DEFAULT 0,
    heartbeat_seconds   INTEGER NOT NULL DEFAULT 3600
                        CHECK (heartbeat_seconds BETWEEN 60 AND 86400),
    active_hours_start  INTEGER NOT NULL DEFAULT 0 CHECK (active_hours_start BETWEEN 0 AND 23),
    active_hours_end    INTEGER NOT NULL DEFAULT 0 CHECK (active_hours_end BETWEEN 0 AND 23),
    template_id         TEXT,
    created_at          TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at          TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_agents_team ON agents(team_id);

CREATE TABLE IF NOT EXISTS tasks (
    id                  TEXT PRIMARY KEY,
    team_id             TEXT NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    title               TEXT NOT NULL,
    description         TEXT NOT NULL DEFAULT '',
    status              TEXT NOT NULL DEFAULT 'backlog'
                        CHECK (status IN ('backlog', 'todo', 'in_progress', 'review', 'done')),
    priority            TEXT NOT NULL DEFAULT 'medium'
                        CHECK (priority IN ('low', 'medium', 'high', 'urgent')),
    assigned_agent_id   TEXT,
    parent_task_id      TEXT,
    deadline            TEXT,
    created_at          TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at          TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_tasks_team ON tasks(team_id, status);

CREATE TABLE IF NOT EXISTS task_dependencies (
    task_id     TEXT NOT NULL,
    depends_on  TEXT NOT NULL,
    PRIMARY KEY (task_id, depends_on)
);

CREATE TABLE IF NOT EXISTS goals (
    id          TEXT PRIMARY KEY,
    team_id     TEXT NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    title       TEXT NOT NULL,
    status      TEXT NOT NULL DEFAULT 'active',
    target_date TEXT,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS goal_tasks (
    goal_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    PRIMARY KEY (goal_id, task_id)
);

CREATE TABLE IF NOT EXISTS measurable_goals (
    id              TEXT PRIMARY KEY,
    team_id         TEXT NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    metric_name     TEXT NOT NULL,
    current_value   REAL NOT NULL DEFAULT 0,
    target_value    REAL NOT NULL,
    unit            TEXT NOT NULL DEFAULT '',
    deadline        TEXT,
    status          TEXT NOT NULL DEFAULT 'active'
                    CHECK (status IN ('active', 'achieved', 'missed', 'paused')),
    created_at      TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS approvals (
    id            TEXT PRIMARY KEY,
    team_id       TEXT NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    agent_id      TEXT NOT NULL,
    action_type   TEXT NOT NULL,
    action_detail TEXT NOT NULL,
    risk_level    TEXT NOT NULL CHECK (risk_level IN ('low', 'medium', 'high', 'critical')),
    status        TEXT NOT NULL DEFAULT 'pending'
                  CHECK (status IN ('pending', 'approved', 'rejected')),
    created_at    TEXT NOT NULL DEFAULT (datetime('now')),
    resolved_at   TEXT
);
CREATE INDEX IF NOT EXISTS idx_approvals_agent ON approvals(agent_id, status);

CREATE TABLE IF NOT EXISTS chat_channels (
    id           TEXT PRIMARY KEY,
    team_id      TEXT NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    name         TEXT NOT NULL,
    channel_type TEXT NOT NULL CHECK (channel_type IN ('dm', 'group', 'task_thread')),
    created_at   TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (team_id, name)
);

CREATE TABLE IF NOT EXISTS chat_messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    channel_id  TEXT NOT NULL REFERENCES chat_channels(id) ON DELETE CASCADE,
    team_id     TEXT NOT NULL,
    sender_kind TEXT NOT NULL CHECK (sender_kind IN ('user', 'agent', 'system')),
    sender_id   TEXT NOT NULL,
    content     TEXT NOT NULL,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_messages_channel ON chat_messages(channel_id, id);

CREATE TABLE IF NOT EXISTS notifications (
    id          TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL,
    team_id     TEXT NOT NULL,
    kind        TEXT NOT NULL,
    body        TEXT NOT NULL,
    channel_id  TEXT,
    read        INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id, read);

CREATE TABLE IF NOT EXISTS kb_documents (
    id          TEXT PRIMARY KEY,
    team_id     TEXT NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    filename    TEXT NOT NULL,
    format      TEXT NOT NULL,
    status      TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'processing', 'ready', 'failed')),
    summary     TEXT NOT NULL DEFAULT '',
    overview    TEXT NOT NULL DEFAULT '',
    chunk_count INTEGER NOT NULL DEFAULT 0,
    error       TEXT,
    created_at  TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS kb_chunks (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    document_id TEXT NOT NULL REFERENCES kb_documents(id) ON DELETE CASCADE,
    team_id     TEXT NOT NULL,
    seq         INTEGER NOT NULL,
    content     TEXT NOT NULL,
    token_count INTEGER NOT NULL,
    embedding   TEXT
);
CREATE INDEX IF NOT EXISTS idx_chunks_team ON kb_chunks(team_id);
CREATE INDEX IF NOT EXISTS idx_chunks_doc ON kb_chunks(document_id, seq);

CREATE TABLE IF NOT EXISTS kb_memories (
    id          TEXT PRIMARY KEY,
    team_id     TEXT NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    agent_id    TEXT NOT NULL,
    content     TEXT NOT NULL,
    embedding   TEXT,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS sor_tables (
    id          TEXT PRIMARY KEY,
    team_id     TEXT NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    name        TEXT NOT NULL,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_sor_name ON sor_tables(team_id, lower(name));

CREATE TABLE IF NOT EXISTS sor_columns (
    table_id    TEXT NOT NULL REFERENCES sor_tables(id) ON DELETE CASCADE,
    position    INTEGER NOT NULL,
    name        TEXT NOT NULL,
    PRIMARY KEY (table_id, position)
);

CREATE TABLE IF NOT EXISTS sor_rows (
    id          TEXT PRIMARY KEY,
    table_id    TEXT NOT NULL REFERENCES sor_tables(id) ON DELETE CASCADE,
    team_id     TEXT NOT NULL,
    data        TEXT NOT NULL,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS sor_permissions (
    agent_id    TEXT NOT NULL,
    table_id    TEXT NOT NULL REFERENCES sor_tables(id) ON DELETE CASCADE,
    can_read    INTEGER NOT NULL DEFAULT 0,
    can_write   INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (agent_id, table_id)
);

CREATE TABLE IF NOT EXISTS credentials (
    team_id     TEXT NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
    service_id  TEXT NOT NULL,
    cred_type   TEXT NOT NULL DEFAULT 'api_key',
    blob        TEXT NOT NULL,
    created_at  TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at  TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (team_id, service_id)
);

CREATE TABLE IF NOT EXISTS agent_skills (
    agent_id    TEXT NOT NULL,
    skill_name  TEXT NOT NULL,
    PRIMARY KEY (agent_id, skill_name)
);

CREATE TABLE IF NOT EXISTS activity_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    team_id     TEXT NOT NULL,
    agent_id    TEXT,
    event_type  TEXT NOT NULL,
    detail      TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_activity_team ON activity_log(team_id, id);
"#;
