use ::duckdb::Connection;
use tracing::info;

struct Migration {
    version: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "0001_cache_tables",
        sql: r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    payload BLOB NOT NULL,
    created_at_ms BIGINT NOT NULL,
    expires_at_ms BIGINT NOT NULL,
    source TEXT NOT NULL,
    stale BOOLEAN NOT NULL DEFAULT FALSE,
    hit_count BIGINT NOT NULL DEFAULT 0
);

CREATE SEQUENCE IF NOT EXISTS history_entries_id START 1;

CREATE TABLE IF NOT EXISTS history_entries (
    id BIGINT PRIMARY KEY DEFAULT nextval('history_entries_id'),
    dataset TEXT NOT NULL,
    reference_date TEXT NOT NULL,
    payload BLOB NOT NULL,
    source TEXT NOT NULL,
    collected_at_ms BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS indicators (
    product TEXT NOT NULL,
    date TEXT NOT NULL,
    value DOUBLE NOT NULL,
    unit TEXT,
    region TEXT,
    source TEXT NOT NULL,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY(product, date)
);
"#,
    },
    Migration {
        version: "0002_indexes",
        sql: r#"
CREATE INDEX IF NOT EXISTS idx_cache_entries_source ON cache_entries(source);
CREATE INDEX IF NOT EXISTS idx_history_entries_dataset_date ON history_entries(dataset, reference_date);
CREATE INDEX IF NOT EXISTS idx_indicators_source_date ON indicators(source, date);
"#,
    },
];

pub fn apply_migrations(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    )?;

    for migration in MIGRATIONS {
        let applied_count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?",
            [migration.version],
            |row| row.get(0),
        )?;

        if applied_count == 0 {
            connection.execute_batch(migration.sql)?;
            connection.execute(
                "INSERT INTO schema_migrations (version) VALUES (?)",
                [migration.version],
            )?;
            info!(version = migration.version, "applied warehouse migration");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let connection = Connection::open_in_memory().expect("open");
        apply_migrations(&connection).expect("first run");
        apply_migrations(&connection).expect("second run");

        let applied: i64 = connection
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .expect("count");
        assert_eq!(applied, MIGRATIONS.len() as i64);
    }
}
