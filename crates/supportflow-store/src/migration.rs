//! Schema migration system.
//!
//! Migrations are static SQL strings keyed by version number. The applied
//! version is tracked in a `_migrations` table so each one runs once.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

struct Migration {
    version: u32,
    description: &'static str,
    /// May contain multiple statements separated by `;`.
    sql: &'static str,
}

/// All migrations in order. Append only.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "automation schema: rules, rule_schedules, rule_executions",
        sql: r#"
            CREATE TABLE rules (
                id               TEXT PRIMARY KEY,
                name             TEXT NOT NULL,
                description      TEXT,
                status           TEXT NOT NULL DEFAULT 'draft'
                                 CHECK(status IN ('draft','active','paused','disabled')),
                trigger_type     TEXT NOT NULL
                                 CHECK(trigger_type IN ('keyword','time_based','message_count','user_status',
                                                        'conversation_inactive','escalation','custom_event',
                                                        'scheduled_execution')),
                trigger_config   TEXT NOT NULL DEFAULT '{}',
                conditions       TEXT,
                actions          TEXT NOT NULL DEFAULT '[]',
                priority         INTEGER NOT NULL DEFAULT 0,
                cooldown_minutes INTEGER NOT NULL DEFAULT 0,
                max_executions   INTEGER,
                execution_count  INTEGER NOT NULL DEFAULT 0,
                last_executed_at INTEGER,
                created_at       INTEGER NOT NULL,
                updated_at       INTEGER NOT NULL
            );
            CREATE INDEX idx_rules_status_priority ON rules(status, priority DESC);

            CREATE TABLE rule_schedules (
                id              TEXT PRIMARY KEY,
                rule_id         TEXT NOT NULL REFERENCES rules(id) ON DELETE CASCADE,
                cron_expression TEXT NOT NULL,
                timezone        TEXT NOT NULL DEFAULT 'UTC',
                is_active       BOOLEAN NOT NULL DEFAULT 1,
                last_run_at     INTEGER,
                run_count       INTEGER NOT NULL DEFAULT 0,
                created_at      INTEGER NOT NULL,
                updated_at      INTEGER NOT NULL
            );
            CREATE INDEX idx_rule_schedules_rule ON rule_schedules(rule_id);

            -- No foreign key: audit records outlive the rules they describe.
            CREATE TABLE rule_executions (
                id                TEXT PRIMARY KEY,
                rule_id           TEXT NOT NULL,
                trigger_type      TEXT NOT NULL,
                trigger_data      TEXT NOT NULL,
                actions           TEXT NOT NULL,
                results           TEXT NOT NULL,
                status            TEXT NOT NULL CHECK(status IN ('success','partial','failed')),
                error_message     TEXT,
                execution_time_ms INTEGER NOT NULL,
                user_id           TEXT,
                conversation_id   TEXT,
                message_id        TEXT,
                created_at        INTEGER NOT NULL
            );
            CREATE INDEX idx_rule_executions_rule ON rule_executions(rule_id, created_at DESC);
        "#,
    },
    Migration {
        version: 2,
        description: "support read-model: users, operators, conversations, messages, engine_state",
        sql: r#"
            CREATE TABLE users (
                id               TEXT PRIMARY KEY,
                display_name     TEXT,
                platform         TEXT NOT NULL,
                platform_address TEXT NOT NULL,
                status           TEXT NOT NULL DEFAULT 'new',
                tags             TEXT NOT NULL DEFAULT '[]',
                metadata         TEXT NOT NULL DEFAULT '{}',
                created_at       INTEGER NOT NULL,
                updated_at       INTEGER NOT NULL
            );

            CREATE TABLE operators (
                id           TEXT PRIMARY KEY,
                name         TEXT NOT NULL,
                role         TEXT,
                is_active    BOOLEAN NOT NULL DEFAULT 1,
                is_available BOOLEAN NOT NULL DEFAULT 1,
                created_at   INTEGER NOT NULL
            );

            CREATE TABLE conversations (
                id                   TEXT PRIMARY KEY,
                user_id              TEXT NOT NULL REFERENCES users(id),
                assigned_operator_id TEXT REFERENCES operators(id),
                status               TEXT NOT NULL DEFAULT 'open'
                                     CHECK(status IN ('open','pending','closed')),
                tags                 TEXT NOT NULL DEFAULT '[]',
                metadata             TEXT NOT NULL DEFAULT '{}',
                assigned_at          INTEGER,
                last_message_at      INTEGER,
                created_at           INTEGER NOT NULL,
                updated_at           INTEGER NOT NULL
            );
            CREATE INDEX idx_conversations_user ON conversations(user_id);
            CREATE INDEX idx_conversations_operator ON conversations(assigned_operator_id, status);

            CREATE TABLE messages (
                id              TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                sender          TEXT NOT NULL CHECK(sender IN ('user','operator','bot')),
                content         TEXT NOT NULL,
                metadata        TEXT NOT NULL DEFAULT '{}',
                created_at      INTEGER NOT NULL
            );
            CREATE INDEX idx_messages_conversation ON messages(conversation_id, created_at);

            CREATE TABLE operator_assignments (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                operator_id     TEXT NOT NULL REFERENCES operators(id),
                assigned_at     INTEGER NOT NULL
            );
            CREATE INDEX idx_operator_assignments_time ON operator_assignments(assigned_at);

            CREATE TABLE engine_state (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
        "#,
    },
];

// ── public API ───────────────────────────────────────────────────────

/// Run all pending migrations against `conn`.
///
/// Synchronous; call it from `spawn_blocking` or via
/// [`Database::run_migrations`](crate::Database::run_migrations).
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        debug!(current_version = current, "database schema is up to date");
        return Ok(());
    }

    info!(
        current_version = current,
        pending = pending.len(),
        "running pending migrations"
    );

    for migration in pending {
        apply(conn, migration)?;
    }

    info!(
        new_version = MIGRATIONS.last().map(|m| m.version).unwrap_or(0),
        "all migrations applied"
    );
    Ok(())
}

/// Return the latest applied migration version, or 0 if none.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to read current version: {e}"),
    })
}

// ── internals ────────────────────────────────────────────────────────

fn ensure_migrations_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to create _migrations table: {e}"),
    })
}

/// Apply one migration inside an explicit transaction.
fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    info!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );

    // `conn.transaction()` needs `&mut Connection`; drive it by hand.
    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| StoreError::Migration {
            version: migration.version,
            message: format!("failed to begin transaction: {e}"),
        })?;

    let result = (|| -> StoreResult<()> {
        conn.execute_batch(migration.sql)
            .map_err(|e| StoreError::Migration {
                version: migration.version,
                message: format!("SQL execution failed: {e}"),
            })?;

        conn.execute(
            "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                migration.version,
                migration.description,
                chrono::Utc::now().timestamp()
            ],
        )
        .map_err(|e| StoreError::Migration {
            version: migration.version,
            message: format!("failed to record migration: {e}"),
        })?;

        Ok(())
    })();

    match &result {
        Ok(()) => {
            conn.execute_batch("COMMIT;")
                .map_err(|e| StoreError::Migration {
                    version: migration.version,
                    message: format!("failed to commit: {e}"),
                })?;
            info!(version = migration.version, "migration applied");
        }
        Err(err) => {
            warn!(version = migration.version, %err, "migration failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
        }
    }

    result
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        conn
    }

    /// Update when adding migrations.
    const LATEST_VERSION: u32 = 2;

    #[test]
    fn migrations_are_ordered() {
        for window in MIGRATIONS.windows(2) {
            assert!(
                window[1].version > window[0].version,
                "migration versions must be strictly increasing: {} >= {}",
                window[0].version,
                window[1].version,
            );
        }
    }

    #[test]
    fn run_all_on_fresh_db() {
        let conn = setup_conn();
        run_all(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), LATEST_VERSION);
    }

    #[test]
    fn run_all_is_idempotent() {
        let conn = setup_conn();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), LATEST_VERSION);
    }

    #[test]
    fn migrations_create_all_tables() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE '\\_%' ESCAPE '\\' ORDER BY name",
                )
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .map(|r| r.unwrap())
                .collect()
        };

        for expected in [
            "rules",
            "rule_schedules",
            "rule_executions",
            "users",
            "operators",
            "conversations",
            "messages",
            "operator_assignments",
            "engine_state",
        ] {
            assert!(
                tables.contains(&expected.to_string()),
                "missing table {expected}"
            );
        }
    }

    #[test]
    fn rules_check_constraints_reject_unknown_tags() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        let bad_status = conn.execute(
            "INSERT INTO rules (id, name, status, trigger_type, created_at, updated_at) \
             VALUES ('r1', 'x', 'archived', 'keyword', 0, 0)",
            [],
        );
        assert!(bad_status.is_err());

        let bad_trigger = conn.execute(
            "INSERT INTO rules (id, name, status, trigger_type, created_at, updated_at) \
             VALUES ('r2', 'x', 'draft', 'webhook', 0, 0)",
            [],
        );
        assert!(bad_trigger.is_err());
    }

    #[test]
    fn deleting_a_rule_cascades_to_its_schedules() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        conn.execute(
            "INSERT INTO rules (id, name, trigger_type, created_at, updated_at) \
             VALUES ('r1', 'nightly', 'scheduled_execution', 0, 0)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO rule_schedules (id, rule_id, cron_expression, created_at, updated_at) \
             VALUES ('s1', 'r1', '0 3 * * *', 0, 0)",
            [],
        )
        .unwrap();

        conn.execute("DELETE FROM rules WHERE id = 'r1'", []).unwrap();

        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM rule_schedules", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }
}
