use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Mutex, MutexGuard};

use super::{
    AttendanceRecord, BiometricRegistry, ComplianceRecord, HazardRecord, IdentityRecord,
    PersistenceSink, PipelineDirectory, PipelineRecord, SourceDirectory, SourceRecord,
};
use crate::pipeline::PipelineKind;

const TABLES: &[&str] = &[
    "cctv_cameras",
    "system_models",
    "employee",
    "fire_detections",
    "helmet_violations",
    "activity_detections",
    "attendance_logs",
];

/// SQLite-backed store. One connection, serialized behind a mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn =
            Connection::open(db_path).with_context(|| format!("open database {}", db_path))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS cctv_cameras (
              camera_id TEXT PRIMARY KEY,
              camera_name TEXT NOT NULL,
              rtsp_url TEXT NOT NULL,
              location TEXT
            );

            CREATE TABLE IF NOT EXISTS system_models (
              model_id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              type TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS employee (
              employee_id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              department TEXT,
              designation TEXT,
              face_encoding TEXT
            );

            CREATE TABLE IF NOT EXISTS fire_detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id TEXT NOT NULL,
              camera_name TEXT NOT NULL,
              verdict TEXT NOT NULL,
              detected TEXT NOT NULL,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS helmet_violations (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id TEXT NOT NULL,
              camera_name TEXT NOT NULL,
              verdict TEXT NOT NULL,
              detected TEXT NOT NULL,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS activity_detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id TEXT NOT NULL,
              camera_name TEXT NOT NULL,
              verdict TEXT NOT NULL,
              detected TEXT NOT NULL,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS attendance_logs (
              log_id INTEGER PRIMARY KEY AUTOINCREMENT,
              employee_id TEXT NOT NULL,
              camera_id TEXT NOT NULL,
              gesture_detected TEXT NOT NULL,
              timestamp INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_attendance_employee ON attendance_logs(employee_id);
            "#,
        )?;
        Ok(())
    }

    pub fn upsert_source(&self, record: &SourceRecord) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO cctv_cameras(camera_id, camera_name, rtsp_url) VALUES (?1, ?2, ?3)
            ON CONFLICT(camera_id) DO UPDATE SET camera_name = excluded.camera_name,
                                                 rtsp_url = excluded.rtsp_url
            "#,
            params![record.id, record.name, record.uri],
        )?;
        Ok(())
    }

    pub fn upsert_pipeline(&self, record: &PipelineRecord) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO system_models(model_id, name, type) VALUES (?1, ?2, ?3)
            ON CONFLICT(model_id) DO UPDATE SET name = excluded.name, type = excluded.type
            "#,
            params![record.id, record.name, record.kind],
        )?;
        Ok(())
    }

    /// Insert or replace an identity together with its serialized template.
    pub fn upsert_identity(&self, record: &IdentityRecord) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO employee(employee_id, name, department, designation, face_encoding)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(employee_id) DO UPDATE SET name = excluded.name,
                                                   department = excluded.department,
                                                   designation = excluded.designation,
                                                   face_encoding = excluded.face_encoding
            "#,
            params![
                record.external_id,
                record.name,
                record.department,
                record.designation,
                record.template
            ],
        )?;
        Ok(())
    }

    pub fn list_sources(&self) -> Result<Vec<SourceRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT camera_id, camera_name, rtsp_url FROM cctv_cameras ORDER BY camera_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SourceRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                uri: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Row count of one of the store's own tables.
    pub fn row_count(&self, table: &str) -> Result<u64> {
        if !TABLES.contains(&table) {
            return Err(anyhow!("unknown table {}", table));
        }
        let count: i64 = self
            .conn()
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })?;
        Ok(count as u64)
    }

    /// Verdicts recorded for a source in one detection table, oldest first.
    pub fn verdicts(&self, table: &str, source_id: &str) -> Result<Vec<String>> {
        if !matches!(
            table,
            "fire_detections" | "helmet_violations" | "activity_detections"
        ) {
            return Err(anyhow!("{} is not a detection table", table));
        }
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT verdict FROM {} WHERE camera_id = ?1 ORDER BY id ASC",
            table
        ))?;
        let rows = stmt.query_map(params![source_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn insert_detection(
        &self,
        table: &str,
        source_id: &str,
        source_name: &str,
        verdict: &str,
        detected: &str,
        created_at_ms: u64,
    ) -> Result<()> {
        let created_at = i64::try_from(created_at_ms)
            .map_err(|_| anyhow!("timestamp exceeds i64 range"))?;
        self.conn().execute(
            &format!(
                "INSERT INTO {}(camera_id, camera_name, verdict, detected, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                table
            ),
            params![source_id, source_name, verdict, detected, created_at],
        )?;
        Ok(())
    }
}

impl SourceDirectory for SqliteStore {
    fn source(&self, id: &str) -> Result<Option<SourceRecord>> {
        let record = self
            .conn()
            .query_row(
                "SELECT camera_id, camera_name, rtsp_url FROM cctv_cameras WHERE camera_id = ?1",
                params![id],
                |row| {
                    Ok(SourceRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        uri: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}

impl PipelineDirectory for SqliteStore {
    fn pipeline(&self, id: &str) -> Result<Option<PipelineRecord>> {
        let record = self
            .conn()
            .query_row(
                "SELECT model_id, name, type FROM system_models WHERE model_id = ?1",
                params![id],
                |row| {
                    Ok(PipelineRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        kind: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}

impl BiometricRegistry for SqliteStore {
    fn load_identities(&self) -> Result<Vec<IdentityRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT employee_id, name, department, designation, face_encoding
            FROM employee WHERE face_encoding IS NOT NULL ORDER BY employee_id
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(IdentityRecord {
                external_id: row.get(0)?,
                name: row.get(1)?,
                department: row.get(2)?,
                designation: row.get(3)?,
                template: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

impl PersistenceSink for SqliteStore {
    fn insert_hazard(&self, record: &HazardRecord) -> Result<()> {
        let table = match record.category {
            PipelineKind::Fire => "fire_detections",
            PipelineKind::Activity => "activity_detections",
            other => return Err(anyhow!("{} is not a hazard category", other.as_str())),
        };
        self.insert_detection(
            table,
            &record.source_id,
            &record.source_name,
            &record.verdict,
            &record.detected,
            record.created_at_ms,
        )
    }

    fn insert_compliance(&self, record: &ComplianceRecord) -> Result<()> {
        self.insert_detection(
            "helmet_violations",
            &record.source_id,
            &record.source_name,
            &record.verdict,
            &record.detected,
            record.created_at_ms,
        )
    }

    fn insert_attendance(&self, record: &AttendanceRecord) -> Result<()> {
        let timestamp = i64::try_from(record.created_at_ms)
            .map_err(|_| anyhow!("timestamp exceeds i64 range"))?;
        self.conn().execute(
            r#"
            INSERT INTO attendance_logs(employee_id, camera_id, gesture_detected, timestamp)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                record.external_id,
                record.source_id,
                record.gesture.as_str(),
                timestamp
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Gesture;

    fn store() -> Result<SqliteStore> {
        let store = SqliteStore::open_in_memory()?;
        store.upsert_source(&SourceRecord {
            id: "cam1".to_string(),
            name: "Gate".to_string(),
            uri: "stub://gate".to_string(),
        })?;
        Ok(store)
    }

    #[test]
    fn directories_resolve_known_ids() -> Result<()> {
        let store = store()?;
        store.upsert_pipeline(&PipelineRecord {
            id: "m1".to_string(),
            name: "Fire watch".to_string(),
            kind: "fire".to_string(),
        })?;

        assert_eq!(store.source("cam1")?.map(|s| s.uri), Some("stub://gate".to_string()));
        assert!(store.source("cam9")?.is_none());
        assert_eq!(store.pipeline("m1")?.map(|p| p.kind), Some("fire".to_string()));
        assert!(store.pipeline("m9")?.is_none());
        assert_eq!(store.list_sources()?.len(), 1);
        Ok(())
    }

    #[test]
    fn identities_without_template_are_not_loaded() -> Result<()> {
        let store = store()?;
        store.upsert_identity(&IdentityRecord {
            external_id: "7".to_string(),
            name: "Ada".to_string(),
            department: Some("Ops".to_string()),
            designation: None,
            template: "AAAAAAAA8D8=".to_string(),
        })?;
        store.conn().execute(
            "INSERT INTO employee(employee_id, name) VALUES ('8', 'No Face')",
            [],
        )?;

        let loaded = store.load_identities()?;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].department.as_deref(), Some("Ops"));
        Ok(())
    }

    #[test]
    fn hazards_route_to_their_tables() -> Result<()> {
        let store = store()?;
        let hazard = |category, verdict: &str| HazardRecord {
            source_id: "cam1".to_string(),
            source_name: "Gate".to_string(),
            category,
            verdict: verdict.to_string(),
            detected: "reply".to_string(),
            created_at_ms: 1,
        };
        store.insert_hazard(&hazard(PipelineKind::Fire, "fire_detected"))?;
        store.insert_hazard(&hazard(PipelineKind::Activity, "activity_clear"))?;
        assert!(store
            .insert_hazard(&hazard(PipelineKind::Attendance, "x"))
            .is_err());
        store.insert_compliance(&ComplianceRecord {
            source_id: "cam1".to_string(),
            source_name: "Gate".to_string(),
            verdict: "helmet_violation".to_string(),
            detected: "no helmet detected".to_string(),
            created_at_ms: 2,
        })?;
        store.insert_attendance(&AttendanceRecord {
            external_id: "7".to_string(),
            source_id: "cam1".to_string(),
            gesture: Gesture::ThumbUp,
            created_at_ms: 3,
        })?;

        assert_eq!(store.verdicts("fire_detections", "cam1")?, vec!["fire_detected"]);
        assert_eq!(store.row_count("activity_detections")?, 1);
        assert_eq!(store.row_count("helmet_violations")?, 1);
        assert_eq!(store.row_count("attendance_logs")?, 1);
        assert!(store.row_count("sqlite_master").is_err());
        Ok(())
    }

    #[test]
    fn reopening_a_file_keeps_rows() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sitewatch.db");
        let path = path.to_string_lossy().to_string();
        {
            let store = SqliteStore::open(&path)?;
            store.upsert_source(&SourceRecord {
                id: "cam1".to_string(),
                name: "Gate".to_string(),
                uri: "0".to_string(),
            })?;
        }
        let store = SqliteStore::open(&path)?;
        assert!(store.source("cam1")?.is_some());
        Ok(())
    }
}
