//! SQL migration definitions for the experiment database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: experiments",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per executed metrics-producing stage. Never updated.
CREATE TABLE IF NOT EXISTS experiments (
    id           TEXT PRIMARY KEY,
    stage        TEXT NOT NULL,
    fingerprint  TEXT NOT NULL,
    recorded_at  TEXT NOT NULL,
    params_json  TEXT NOT NULL,
    metrics_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_experiments_recorded_at ON experiments(recorded_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Per-metric rows for ranking queries",
            sql: r#"
CREATE TABLE IF NOT EXISTS experiment_metrics (
    experiment_id TEXT NOT NULL REFERENCES experiments(id) ON DELETE CASCADE,
    name          TEXT NOT NULL,
    value         REAL NOT NULL,
    PRIMARY KEY (experiment_id, name)
);

CREATE INDEX IF NOT EXISTS idx_experiment_metrics_name ON experiment_metrics(name, value);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
