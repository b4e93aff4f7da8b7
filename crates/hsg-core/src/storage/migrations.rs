//! Schema migrations
//!
//! Named SQL scripts with `{m} {v} {w} ...` table placeholders, resolved per
//! backend and recorded in `_migrations(name, applied_at)` so re-running is
//! idempotent. SQLite and Postgres carry separate scripts because the column
//! types differ (BLOB vs BYTEA/vector), but names and placeholders match.

use super::Tables;

/// One migration script
#[derive(Debug, Clone)]
pub struct Migration {
    /// File-style name, also the `_migrations` primary key
    pub name: &'static str,
    /// SQL with table placeholders
    pub up: &'static str,
}

// ============================================================================
// SQLITE
// ============================================================================

pub const SQLITE_MIGRATIONS: &[Migration] = &[
    Migration {
        name: "001_core.sql",
        up: SQLITE_001_CORE,
    },
    Migration {
        name: "002_waypoints.sql",
        up: SQLITE_002_WAYPOINTS,
    },
    Migration {
        name: "003_observability.sql",
        up: SQLITE_003_OBSERVABILITY,
    },
];

const SQLITE_001_CORE: &str = r#"
CREATE TABLE IF NOT EXISTS {m} (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL DEFAULT 'anonymous',
    segment INTEGER NOT NULL DEFAULT 0,
    content TEXT NOT NULL,
    simhash TEXT NOT NULL,
    primary_sector TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    last_seen_at INTEGER NOT NULL,
    salience REAL NOT NULL DEFAULT 0.4,
    decay_lambda REAL NOT NULL DEFAULT 0.02,
    version INTEGER NOT NULL DEFAULT 1,
    mean_dim INTEGER,
    mean_vec BLOB,
    compressed_vec BLOB,
    feedback_score REAL NOT NULL DEFAULT 0,
    generated_summary TEXT
);

CREATE INDEX IF NOT EXISTS idx_mem_sector ON {m}(primary_sector);
CREATE INDEX IF NOT EXISTS idx_mem_user ON {m}(user_id);
CREATE INDEX IF NOT EXISTS idx_mem_last_seen ON {m}(last_seen_at);
CREATE INDEX IF NOT EXISTS idx_mem_simhash ON {m}(simhash);
CREATE INDEX IF NOT EXISTS idx_mem_segment ON {m}(segment);

CREATE TABLE IF NOT EXISTS {v} (
    id TEXT NOT NULL,
    sector TEXT NOT NULL,
    user_id TEXT,
    v BLOB NOT NULL,
    dim INTEGER NOT NULL,
    PRIMARY KEY (id, sector)
);

CREATE INDEX IF NOT EXISTS idx_vec_user ON {v}(user_id);
CREATE INDEX IF NOT EXISTS idx_vec_sector ON {v}(sector);

CREATE TABLE IF NOT EXISTS {u} (
    id TEXT PRIMARY KEY,
    summary TEXT NOT NULL DEFAULT '',
    reflection_count INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    metadata TEXT
);
"#;

const SQLITE_002_WAYPOINTS: &str = r#"
CREATE TABLE IF NOT EXISTS {w} (
    src_id TEXT NOT NULL,
    dst_id TEXT NOT NULL,
    user_id TEXT NOT NULL DEFAULT 'anonymous',
    weight REAL NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (src_id, dst_id, user_id)
);

CREATE INDEX IF NOT EXISTS idx_wp_src ON {w}(src_id);
CREATE INDEX IF NOT EXISTS idx_wp_dst ON {w}(dst_id);
"#;

const SQLITE_003_OBSERVABILITY: &str = r#"
CREATE TABLE IF NOT EXISTS {s} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 1,
    ts INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_stats_ts ON {s}(ts);

CREATE TABLE IF NOT EXISTS {el} (
    id TEXT NOT NULL,
    model TEXT NOT NULL,
    status TEXT NOT NULL,
    ts INTEGER NOT NULL,
    err TEXT,
    user_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_el_id ON {el}(id);
CREATE INDEX IF NOT EXISTS idx_el_status ON {el}(status);

CREATE TABLE IF NOT EXISTS {lm} (
    user_id TEXT PRIMARY KEY,
    weights TEXT NOT NULL,
    biases TEXT NOT NULL,
    version INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS {ml} (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    status TEXT NOT NULL,
    ts INTEGER NOT NULL,
    details TEXT NOT NULL DEFAULT '{}'
);
"#;

// ============================================================================
// POSTGRES
// ============================================================================

#[cfg(feature = "postgres")]
pub const POSTGRES_MIGRATIONS: &[Migration] = &[
    Migration {
        name: "001_core.sql",
        up: PG_001_CORE,
    },
    Migration {
        name: "002_waypoints.sql",
        up: PG_002_WAYPOINTS,
    },
    Migration {
        name: "003_observability.sql",
        up: PG_003_OBSERVABILITY,
    },
];

#[cfg(feature = "postgres")]
const PG_001_CORE: &str = r#"
CREATE EXTENSION IF NOT EXISTS vector;

CREATE TABLE IF NOT EXISTS {m} (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL DEFAULT 'anonymous',
    segment BIGINT NOT NULL DEFAULT 0,
    content TEXT NOT NULL,
    simhash TEXT NOT NULL,
    primary_sector TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL,
    last_seen_at BIGINT NOT NULL,
    salience DOUBLE PRECISION NOT NULL DEFAULT 0.4,
    decay_lambda DOUBLE PRECISION NOT NULL DEFAULT 0.02,
    version BIGINT NOT NULL DEFAULT 1,
    mean_dim BIGINT,
    mean_vec BYTEA,
    compressed_vec BYTEA,
    feedback_score DOUBLE PRECISION NOT NULL DEFAULT 0,
    generated_summary TEXT
);

CREATE INDEX IF NOT EXISTS idx_mem_sector ON {m}(primary_sector);
CREATE INDEX IF NOT EXISTS idx_mem_user ON {m}(user_id);
CREATE INDEX IF NOT EXISTS idx_mem_last_seen ON {m}(last_seen_at);
CREATE INDEX IF NOT EXISTS idx_mem_simhash ON {m}(simhash);
CREATE INDEX IF NOT EXISTS idx_mem_segment ON {m}(segment);

-- Typeless vector column: cold copies have smaller dims than live ones.
-- An ANN index can be added per deployment once dims are fixed.
CREATE TABLE IF NOT EXISTS {v} (
    id TEXT NOT NULL,
    sector TEXT NOT NULL,
    user_id TEXT,
    v vector NOT NULL,
    dim BIGINT NOT NULL,
    PRIMARY KEY (id, sector)
);

CREATE INDEX IF NOT EXISTS idx_vec_user ON {v}(user_id);
CREATE INDEX IF NOT EXISTS idx_vec_sector ON {v}(sector);

CREATE TABLE IF NOT EXISTS {u} (
    id TEXT PRIMARY KEY,
    summary TEXT NOT NULL DEFAULT '',
    reflection_count BIGINT NOT NULL DEFAULT 0,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL,
    metadata TEXT
);
"#;

#[cfg(feature = "postgres")]
const PG_002_WAYPOINTS: &str = r#"
CREATE TABLE IF NOT EXISTS {w} (
    src_id TEXT NOT NULL,
    dst_id TEXT NOT NULL,
    user_id TEXT NOT NULL DEFAULT 'anonymous',
    weight DOUBLE PRECISION NOT NULL,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL,
    PRIMARY KEY (src_id, dst_id, user_id)
);

CREATE INDEX IF NOT EXISTS idx_wp_src ON {w}(src_id);
CREATE INDEX IF NOT EXISTS idx_wp_dst ON {w}(dst_id);
"#;

#[cfg(feature = "postgres")]
const PG_003_OBSERVABILITY: &str = r#"
CREATE TABLE IF NOT EXISTS {s} (
    id BIGSERIAL PRIMARY KEY,
    type TEXT NOT NULL,
    count BIGINT NOT NULL DEFAULT 1,
    ts BIGINT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_stats_ts ON {s}(ts);

CREATE TABLE IF NOT EXISTS {el} (
    id TEXT NOT NULL,
    model TEXT NOT NULL,
    status TEXT NOT NULL,
    ts BIGINT NOT NULL,
    err TEXT,
    user_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_el_id ON {el}(id);
CREATE INDEX IF NOT EXISTS idx_el_status ON {el}(status);

CREATE TABLE IF NOT EXISTS {lm} (
    user_id TEXT PRIMARY KEY,
    weights TEXT NOT NULL,
    biases TEXT NOT NULL,
    version BIGINT NOT NULL,
    updated_at BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS {ml} (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    status TEXT NOT NULL,
    ts BIGINT NOT NULL,
    details TEXT NOT NULL DEFAULT '{}'
);
"#;

// ============================================================================
// SQLITE APPLY
// ============================================================================

/// Apply pending SQLite migrations, returning how many ran.
pub fn apply_sqlite(conn: &rusqlite::Connection, tables: &Tables) -> rusqlite::Result<u32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (name TEXT PRIMARY KEY, applied_at INTEGER NOT NULL)",
        [],
    )?;

    let mut applied = 0;
    for migration in SQLITE_MIGRATIONS {
        let done: bool = conn
            .query_row(
                "SELECT 1 FROM _migrations WHERE name = ?1",
                [migration.name],
                |_| Ok(true),
            )
            .unwrap_or(false);
        if done {
            continue;
        }
        tracing::info!("[db] applying migration {}", migration.name);
        conn.execute_batch(&tables.resolve(migration.up))?;
        conn.execute(
            "INSERT INTO _migrations (name, applied_at) VALUES (?1, ?2)",
            rusqlite::params![migration.name, chrono::Utc::now().timestamp_millis()],
        )?;
        applied += 1;
    }
    Ok(applied)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_sqlite_idempotent() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let tables = Tables::sqlite();
        let first = apply_sqlite(&conn, &tables).unwrap();
        assert_eq!(first as usize, SQLITE_MIGRATIONS.len());
        let second = apply_sqlite(&conn, &tables).unwrap();
        assert_eq!(second, 0);

        // Tables exist after migration
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM waypoints", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }
}
