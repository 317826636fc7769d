//! Experiment tracking on an embedded libSQL database.
//!
//! The runner appends one [`Experiment`] every time a metrics-producing stage
//! executes. Entries are never updated or deleted; the CLI reads them back to
//! list runs and rank them by a metric.
//!
//! **Access rules:**
//! - `spamflow repro`: read-write via [`Storage::open`]
//! - `spamflow experiments`: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, Row, params};
use serde::Serialize;
use uuid::Uuid;

use spamflow_shared::{MetricsReport, Result, SpamflowError};

/// One recorded evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Experiment {
    /// UUID v7, so ids sort by creation time.
    pub id: String,
    pub stage: String,
    pub fingerprint: String,
    pub recorded_at: DateTime<Utc>,
    /// Consumed parameter values, keyed by dotted name.
    pub params: serde_json::Value,
    pub metrics: MetricsReport,
}

/// Input for [`Storage::record_experiment`].
#[derive(Debug, Clone)]
pub struct NewExperiment<'a> {
    pub stage: &'a str,
    pub fingerprint: &'a str,
    pub params: &'a serde_json::Value,
    pub metrics: &'a MetricsReport,
}

fn storage_err(e: impl std::fmt::Display) -> SpamflowError {
    SpamflowError::Storage(e.to_string())
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| SpamflowError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SpamflowError::InputMissing {
                path: path.to_path_buf(),
            });
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        SpamflowError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // table doesn't exist yet
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(SpamflowError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Experiments
    // -----------------------------------------------------------------------

    /// Append an experiment and its metric rows. Returns the stored entry.
    pub async fn record_experiment(&self, new: &NewExperiment<'_>) -> Result<Experiment> {
        self.check_writable()?;

        let experiment = Experiment {
            id: Uuid::now_v7().to_string(),
            stage: new.stage.to_string(),
            fingerprint: new.fingerprint.to_string(),
            recorded_at: Utc::now(),
            params: new.params.clone(),
            metrics: new.metrics.clone(),
        };
        let params_json = serde_json::to_string(&experiment.params).map_err(storage_err)?;
        let metrics_json = serde_json::to_string(&experiment.metrics).map_err(storage_err)?;

        let tx = self.conn.transaction().await.map_err(storage_err)?;
        tx.execute(
            "INSERT INTO experiments
                 (id, stage, fingerprint, recorded_at, params_json, metrics_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                experiment.id.as_str(),
                experiment.stage.as_str(),
                experiment.fingerprint.as_str(),
                experiment.recorded_at.to_rfc3339(),
                params_json,
                metrics_json
            ],
        )
        .await
        .map_err(storage_err)?;
        for (name, value) in &experiment.metrics {
            tx.execute(
                "INSERT INTO experiment_metrics (experiment_id, name, value) VALUES (?1, ?2, ?3)",
                params![experiment.id.as_str(), name.as_str(), *value],
            )
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;

        tracing::debug!(id = %experiment.id, stage = %experiment.stage, "recorded experiment");
        Ok(experiment)
    }

    /// Most recent experiments first.
    pub async fn list_experiments(&self, limit: usize) -> Result<Vec<Experiment>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, stage, fingerprint, recorded_at, params_json, metrics_json
                 FROM experiments ORDER BY recorded_at DESC, id DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(experiment_from_row(&row)?);
        }
        Ok(results)
    }

    /// Fetch one experiment by id.
    pub async fn get_experiment(&self, id: &str) -> Result<Option<Experiment>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, stage, fingerprint, recorded_at, params_json, metrics_json
                 FROM experiments WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(experiment_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Experiments ranked by `metric`, highest first.
    pub async fn best_by_metric(&self, metric: &str, limit: usize) -> Result<Vec<Experiment>> {
        let mut rows = self
            .conn
            .query(
                "SELECT e.id, e.stage, e.fingerprint, e.recorded_at, e.params_json, e.metrics_json
                 FROM experiments e
                 JOIN experiment_metrics m ON m.experiment_id = e.id
                 WHERE m.name = ?1
                 ORDER BY m.value DESC, e.recorded_at DESC
                 LIMIT ?2",
                params![metric, limit as i64],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(experiment_from_row(&row)?);
        }
        Ok(results)
    }

    /// Total number of recorded experiments.
    pub async fn count_experiments(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM experiments", params![])
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(storage_err)?.max(0) as u64),
            None => Ok(0),
        }
    }
}

fn experiment_from_row(row: &Row) -> Result<Experiment> {
    let recorded_at: String = row.get(3).map_err(storage_err)?;
    let params_json: String = row.get(4).map_err(storage_err)?;
    let metrics_json: String = row.get(5).map_err(storage_err)?;

    Ok(Experiment {
        id: row.get(0).map_err(storage_err)?,
        stage: row.get(1).map_err(storage_err)?,
        fingerprint: row.get(2).map_err(storage_err)?,
        recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
            .map_err(storage_err)?
            .with_timezone(&Utc),
        params: serde_json::from_str(&params_json).map_err(storage_err)?,
        metrics: serde_json::from_str(&metrics_json).map_err(storage_err)?,
    })
}
