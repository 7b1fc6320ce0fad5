use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analytics::Polygon;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cameras (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    source_url TEXT NOT NULL,
    zone_name TEXT,
    roi_polygon TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cameras_name ON cameras(name);
";

const SELECT_COLUMNS: &str = "SELECT id, name, source_url, zone_name, roi_polygon, created_at FROM cameras";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{0}")]
    Validation(String),
    #[error("camera {0} not found")]
    NotFound(i64),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("registry lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Camera {
    pub id: i64,
    pub name: String,
    pub source_url: String,
    pub zone_name: Option<String>,
    pub roi_polygon: Option<Polygon>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewCamera {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub zone_name: Option<String>,
    #[serde(default)]
    pub roi_polygon: Option<Polygon>,
}

/// Fields left as `None` are unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CameraPatch {
    pub name: Option<String>,
    pub source_url: Option<String>,
    pub zone_name: Option<String>,
    pub roi_polygon: Option<Polygon>,
}

/// Cameras plus the active pointer, read under one lock.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub cameras: Vec<Camera>,
    pub active_camera_id: Option<i64>,
}

struct RegistryInner {
    conn: Connection,
    active: Option<i64>,
}

/// Durable camera definitions and the single active-camera pointer.
///
/// Every operation runs under one mutex, so a reader never sees the camera
/// table and the active pointer out of step with each other.
pub struct CameraRegistry {
    inner: Mutex<RegistryInner>,
}

impl CameraRegistry {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, RegistryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, RegistryError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            inner: Mutex::new(RegistryInner { conn, active: None }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, RegistryInner>, RegistryError> {
        self.inner.lock().map_err(|_| RegistryError::Poisoned)
    }

    pub fn create(&self, new: NewCamera) -> Result<Camera, RegistryError> {
        let name = required("name", &new.name)?;
        let source_url = required("source_url", &new.source_url)?;
        validate_polygon(new.roi_polygon.as_ref())?;

        let created_at = Utc::now();
        let roi_json = encode_polygon(new.roi_polygon.as_ref())?;

        let inner = self.lock()?;
        inner.conn.execute(
            "INSERT INTO cameras (name, source_url, zone_name, roi_polygon, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, source_url, new.zone_name, roi_json, created_at.to_rfc3339()],
        )?;
        let id = inner.conn.last_insert_rowid();

        tracing::info!(camera = id, name = %name, "camera created");

        Ok(Camera {
            id,
            name,
            source_url,
            zone_name: new.zone_name,
            roi_polygon: new.roi_polygon,
            created_at,
        })
    }

    /// Cameras in insertion order.
    pub fn list(&self) -> Result<Vec<Camera>, RegistryError> {
        let inner = self.lock()?;
        query_all(&inner.conn)
    }

    pub fn snapshot(&self) -> Result<RegistrySnapshot, RegistryError> {
        let inner = self.lock()?;
        Ok(RegistrySnapshot {
            cameras: query_all(&inner.conn)?,
            active_camera_id: inner.active,
        })
    }

    pub fn get(&self, id: i64) -> Result<Camera, RegistryError> {
        let inner = self.lock()?;
        query_one(&inner.conn, id)?.ok_or(RegistryError::NotFound(id))
    }

    pub fn update(&self, id: i64, patch: CameraPatch) -> Result<Camera, RegistryError> {
        let inner = self.lock()?;
        let mut camera = query_one(&inner.conn, id)?.ok_or(RegistryError::NotFound(id))?;

        if let Some(name) = patch.name {
            camera.name = required("name", &name)?;
        }
        if let Some(source_url) = patch.source_url {
            camera.source_url = required("source_url", &source_url)?;
        }
        if let Some(zone_name) = patch.zone_name {
            camera.zone_name = Some(zone_name);
        }
        if let Some(polygon) = patch.roi_polygon {
            validate_polygon(Some(&polygon))?;
            camera.roi_polygon = Some(polygon);
        }

        let roi_json = encode_polygon(camera.roi_polygon.as_ref())?;
        inner.conn.execute(
            "UPDATE cameras SET name = ?1, source_url = ?2, zone_name = ?3, roi_polygon = ?4 WHERE id = ?5",
            params![camera.name, camera.source_url, camera.zone_name, roi_json, id],
        )?;

        tracing::info!(camera = id, "camera updated");
        Ok(camera)
    }

    /// Removes the camera. Returns `true` when it was the active camera, in
    /// which case the active pointer has already been cleared.
    pub fn delete(&self, id: i64) -> Result<bool, RegistryError> {
        let mut inner = self.lock()?;
        let removed = inner
            .conn
            .execute("DELETE FROM cameras WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(RegistryError::NotFound(id));
        }

        let was_active = inner.active == Some(id);
        if was_active {
            inner.active = None;
        }

        tracing::info!(camera = id, was_active, "camera deleted");
        Ok(was_active)
    }

    pub fn select(&self, id: i64) -> Result<i64, RegistryError> {
        let mut inner = self.lock()?;
        if query_one(&inner.conn, id)?.is_none() {
            return Err(RegistryError::NotFound(id));
        }
        inner.active = Some(id);
        Ok(id)
    }

    pub fn deselect(&self) -> Result<(), RegistryError> {
        self.lock()?.active = None;
        Ok(())
    }

    pub fn active_id(&self) -> Result<Option<i64>, RegistryError> {
        Ok(self.lock()?.active)
    }
}

fn required(field: &str, value: &str) -> Result<String, RegistryError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(RegistryError::Validation(format!("missing '{field}'")));
    }
    Ok(trimmed.to_string())
}

fn validate_polygon(polygon: Option<&Polygon>) -> Result<(), RegistryError> {
    match polygon {
        Some(p) if !p.is_valid() => Err(RegistryError::Validation(
            "'roi_polygon' needs at least 3 finite points".to_string(),
        )),
        _ => Ok(()),
    }
}

fn encode_polygon(polygon: Option<&Polygon>) -> Result<Option<String>, RegistryError> {
    polygon
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| RegistryError::Validation(format!("invalid 'roi_polygon': {e}")))
}

fn query_all(conn: &Connection) -> Result<Vec<Camera>, RegistryError> {
    let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY id ASC"))?;
    let cameras = stmt
        .query_map([], camera_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(cameras)
}

fn query_one(conn: &Connection, id: i64) -> Result<Option<Camera>, RegistryError> {
    let camera = conn
        .query_row(
            &format!("{SELECT_COLUMNS} WHERE id = ?1"),
            params![id],
            camera_from_row,
        )
        .optional()?;
    Ok(camera)
}

fn camera_from_row(row: &Row<'_>) -> rusqlite::Result<Camera> {
    let roi_json: Option<String> = row.get(4)?;
    let created_at: String = row.get(5)?;

    // A corrupt polygon column degrades to "no ROI" rather than hiding the camera.
    let roi_polygon = roi_json.and_then(|json| serde_json::from_str(&json).ok());
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default();

    Ok(Camera {
        id: row.get(0)?,
        name: row.get(1)?,
        source_url: row.get(2)?,
        zone_name: row.get(3)?,
        roi_polygon,
        created_at,
    })
}
