//! Persisted state (spec §6): events, ROI polygons, camera configs, and
//! alarm channel configs in a single-file embedded relational store.
//! Generalizes `retail-surveillance/src/database.rs`'s `sqlx` pool pattern
//! from Postgres/POS-specific tables to the schema this server actually
//! needs, backed by SQLite with WAL enabled instead of a standalone
//! Postgres server, since "single-file embedded" rules out a client/server
//! database.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use vision_common::types::{Event, Roi};

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventRecord {
    pub id: String,
    pub source_id: String,
    pub r#type: String,
    pub ts: DateTime<Utc>,
    pub video_path: Option<String>,
    pub meta: String,
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RoiRecord {
    pub id: String,
    pub source_id: String,
    pub name: String,
    pub polygon_json: String,
    pub enabled: bool,
    pub priority: i64,
    pub start_t: Option<i64>,
    pub end_t: Option<i64>,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CameraConfigRecord {
    pub source_id: String,
    pub config_json: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AlarmConfigRecord {
    pub id: String,
    pub method: String,
    pub json: String,
}

impl Database {
    /// Opens (creating if absent) a SQLite file at `path`, with WAL mode
    /// enabled for concurrent readers during writer bursts, and a 2-10
    /// connection pool matching the teacher's Postgres pool sizing.
    ///
    /// An in-memory path (`:memory:`) is pinned to a single connection --
    /// each sqlite connection to `:memory:` is its own private database, so
    /// a multi-connection pool would scatter migrations and writes across
    /// databases a later query can't see.
    pub async fn new(path: &str) -> Result<Self> {
        info!(path, "opening embedded database");

        let options = SqliteConnectOptions::from_str(path)
            .with_context(|| format!("invalid database path {path}"))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let is_memory = path.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if is_memory { 1 } else { 10 })
            .min_connections(if is_memory { 1 } else { 2 })
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect_with(options)
            .await
            .context("failed to open embedded database")?;

        info!("database connection established");
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await.context("failed to run migrations")?;
        Ok(())
    }

    pub async fn insert_event(&self, event: &Event, video_path: Option<&str>) -> Result<()> {
        let mut meta = event.metadata.clone();
        if let serde_json::Value::Object(ref mut map) = meta {
            map.insert("severity".into(), serde_json::json!(event.severity));
            map.insert("bbox".into(), serde_json::json!(event.bbox));
            map.insert("local_track_id".into(), serde_json::json!(event.local_track_id));
            map.insert("global_track_id".into(), serde_json::json!(event.global_track_id));
        }

        sqlx::query(
            "INSERT INTO events (id, source_id, type, ts, video_path, meta, confidence) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.id.to_string())
        .bind(&event.source_id)
        .bind(&event.event_type)
        .bind(event.timestamp)
        .bind(video_path)
        .bind(meta.to_string())
        .bind(Option::<f32>::None)
        .execute(&self.pool)
        .await
        .context("failed to insert event")?;
        Ok(())
    }

    pub async fn list_events(&self, source_id: Option<&str>, limit: i64) -> Result<Vec<EventRecord>> {
        let rows = match source_id {
            Some(source_id) => {
                sqlx::query_as::<_, EventRecord>(
                    "SELECT id, source_id, type, ts, video_path, meta, confidence FROM events \
                     WHERE source_id = ? ORDER BY ts DESC LIMIT ?",
                )
                .bind(source_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, EventRecord>(
                    "SELECT id, source_id, type, ts, video_path, meta, confidence FROM events \
                     ORDER BY ts DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("failed to list events")?;
        Ok(rows)
    }

    pub async fn upsert_roi(&self, roi: &Roi) -> Result<()> {
        let polygon_json = serde_json::to_string(&roi.polygon)?;
        let priority = match roi.rule {
            vision_common::types::RoiRule::Intrusion => 0_i64,
            vision_common::types::RoiRule::Loitering { dwell_seconds } => dwell_seconds as i64,
        };
        sqlx::query(
            "INSERT INTO rois (id, source_id, name, polygon_json, enabled, priority, start_t, end_t, ts) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET source_id=excluded.source_id, name=excluded.name, \
             polygon_json=excluded.polygon_json, enabled=excluded.enabled, priority=excluded.priority, \
             start_t=excluded.start_t, end_t=excluded.end_t, ts=excluded.ts",
        )
        .bind(&roi.id)
        .bind(&roi.source_id)
        .bind(&roi.name)
        .bind(polygon_json)
        .bind(roi.enabled)
        .bind(priority)
        .bind(roi.start_minute.map(|m| m as i64))
        .bind(roi.end_minute.map(|m| m as i64))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to upsert roi")?;
        Ok(())
    }

    pub async fn list_rois(&self, source_id: &str) -> Result<Vec<RoiRecord>> {
        let rows = sqlx::query_as::<_, RoiRecord>(
            "SELECT id, source_id, name, polygon_json, enabled, priority, start_t, end_t, ts FROM rois WHERE source_id = ?",
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list rois")?;
        Ok(rows)
    }

    pub async fn delete_roi(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM rois WHERE id = ?").bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn upsert_camera_config(&self, source_id: &str, config_json: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO camera_configs (source_id, config_json) VALUES (?, ?) \
             ON CONFLICT(source_id) DO UPDATE SET config_json=excluded.config_json",
        )
        .bind(source_id)
        .bind(config_json)
        .execute(&self.pool)
        .await
        .context("failed to upsert camera config")?;
        Ok(())
    }

    pub async fn get_camera_config(&self, source_id: &str) -> Result<Option<CameraConfigRecord>> {
        let row = sqlx::query_as::<_, CameraConfigRecord>("SELECT source_id, config_json FROM camera_configs WHERE source_id = ?")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn delete_camera_config(&self, source_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM camera_configs WHERE source_id = ?").bind(source_id).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn list_camera_configs(&self) -> Result<Vec<CameraConfigRecord>> {
        let rows = sqlx::query_as::<_, CameraConfigRecord>("SELECT source_id, config_json FROM camera_configs")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn upsert_alarm_config(&self, id: &str, method: &str, json: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO alarm_configs (id, method, json) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET method=excluded.method, json=excluded.json",
        )
        .bind(id)
        .bind(method)
        .bind(json)
        .execute(&self.pool)
        .await
        .context("failed to upsert alarm config")?;
        Ok(())
    }

    pub async fn list_alarm_configs(&self) -> Result<Vec<AlarmConfigRecord>> {
        let rows = sqlx::query_as::<_, AlarmConfigRecord>("SELECT id, method, json FROM alarm_configs")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn get_alarm_config(&self, id: &str) -> Result<Option<AlarmConfigRecord>> {
        let row = sqlx::query_as::<_, AlarmConfigRecord>("SELECT id, method, json FROM alarm_configs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn delete_alarm_config(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM alarm_configs WHERE id = ?").bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Parse a UUID out of an event id column without failing the whole
/// request when older rows predate UUID-formatted ids.
pub fn event_uuid(record: &EventRecord) -> Option<Uuid> {
    Uuid::parse_str(&record.id).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_in_memory_database_and_runs_migrations() {
        let db = Database::new("sqlite::memory:").await.expect("open");
        db.run_migrations().await.expect("migrate");
        db.health_check().await.expect("health check");
        let events = db.list_events(None, 10).await.expect("list events");
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn camera_config_round_trips() {
        let db = Database::new("sqlite::memory:").await.expect("open");
        db.run_migrations().await.expect("migrate");
        db.upsert_camera_config("cam-1", r#"{"fps":25}"#).await.expect("upsert");
        let record = db.get_camera_config("cam-1").await.expect("get").expect("present");
        assert_eq!(record.config_json, r#"{"fps":25}"#);
    }
}
