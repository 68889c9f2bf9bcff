//! Persistence sink for device-state snapshots and completed trips
//!
//! Both tables are append-only (see `/sql/` directory):
//! - `device_states` - INSERT per accepted ping, keyed by (provider, device, timestamp)
//! - `trips` - INSERT once per trip, keyed by (provider, device, trip_id)
//!
//! A duplicate key surfaces as `PipelineError::Conflict`; callers treat it as
//! success.

use super::error::{PipelineError, Result};
use super::types::{CompletedTrip, DeviceState, TripSegment};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// A row destined for one of the sink's tables
#[derive(Debug, Clone)]
pub enum SinkRecord {
    DeviceState(DeviceState),
    Trip(CompletedTrip),
}

impl SinkRecord {
    pub fn table(&self) -> &'static str {
        match self {
            SinkRecord::DeviceState(_) => "device_states",
            SinkRecord::Trip(_) => "trips",
        }
    }
}

#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Insert one record. Duplicate keys return `PipelineError::Conflict`.
    async fn insert(&self, record: SinkRecord) -> Result<()>;
}

/// Run schema migrations from SQL files
///
/// Executes every `.sql` file in `schema_dir` in file-name order. Files must
/// use `IF NOT EXISTS` so reruns are harmless.
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> Result<()> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(PipelineError::Config(format!(
            "Schema directory not found: {}",
            schema_dir
        )));
    }

    conn.pragma_update(None, "journal_mode", "WAL")?;
    log::info!("📊 Enabled WAL mode for SQLite database");

    let mut sql_files: Vec<_> = fs::read_dir(schema_path)
        .map_err(|e| PipelineError::Config(format!("cannot list {}: {}", schema_dir, e)))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for entry in sql_files {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().into_owned();

        log::info!("   ├─ Executing: {}", filename);

        let sql_content = fs::read_to_string(&path)
            .map_err(|e| PipelineError::Config(format!("cannot read {}: {}", filename, e)))?;
        conn.execute_batch(&sql_content)?;

        log::info!("   └─ ✅ Success: {}", filename);
    }

    log::info!("✅ All schema migrations completed successfully");

    Ok(())
}

/// SQLite implementation of [`PersistenceSink`]
pub struct SqliteSink {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSink {
    /// Open an existing database. The schema must already be applied.
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open (or create) a database and apply the schema from `schema_dir`.
    pub fn open_with_schema(db_path: &str, schema_dir: &str) -> Result<Self> {
        let mut conn = Connection::open(db_path)?;
        run_schema_migrations(&mut conn, schema_dir)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| {
                PipelineError::TransientStore("sqlite connection lock poisoned".to_string())
            })
    }

    fn insert_device_state(conn: &Connection, state: &DeviceState) -> Result<()> {
        let (geography_ids, annotation_version) = match &state.annotation {
            Some(a) => (
                Some(serde_json::to_string(&a.geography_ids)?),
                Some(a.version.clone()),
            ),
            None => (None, None),
        };

        conn.execute(
            r#"
            INSERT INTO device_states (
                provider_id, device_id, timestamp, ping_kind,
                vehicle_state, sub_state, trip_id,
                lat, lng, battery,
                geography_ids, annotation_version,
                service_area_id, recorded
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            rusqlite::params![
                state.provider_id,
                state.device_id,
                state.timestamp,
                state.ping_kind.as_str(),
                state.vehicle_state.as_str(),
                state.sub_state.map(|s| s.as_str()),
                state.trip_id,
                state.gps.map(|g| g.lat),
                state.gps.map(|g| g.lng),
                state.battery,
                geography_ids,
                annotation_version,
                state.service_area_id,
                state.recorded,
            ],
        )?;
        Ok(())
    }

    fn insert_trip(conn: &Connection, trip: &CompletedTrip) -> Result<()> {
        let segments_json = serde_json::to_string(&trip.segments)?;

        conn.execute(
            r#"
            INSERT INTO trips (
                provider_id, device_id, trip_id,
                start_time, end_time, start_district, end_district,
                duration_ms, distance_m,
                violation_count, min_violation_m, max_violation_m, avg_violation_m,
                segments_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            rusqlite::params![
                trip.provider_id,
                trip.device_id,
                trip.trip_id,
                trip.start_time,
                trip.end_time,
                trip.start_district,
                trip.end_district,
                trip.duration_ms,
                trip.distance_m,
                trip.violation_count,
                trip.min_violation_m,
                trip.max_violation_m,
                trip.avg_violation_m,
                segments_json,
            ],
        )?;
        Ok(())
    }

    /// Read back a persisted trip
    pub fn fetch_trip(
        &self,
        provider_id: &str,
        device_id: &str,
        trip_id: &str,
    ) -> Result<Option<CompletedTrip>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                r#"
                SELECT start_time, end_time, start_district, end_district,
                       duration_ms, distance_m,
                       violation_count, min_violation_m, max_violation_m, avg_violation_m,
                       segments_json
                FROM trips
                WHERE provider_id = ? AND device_id = ? AND trip_id = ?
                "#,
                rusqlite::params![provider_id, device_id, trip_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, u32>(6)?,
                        row.get::<_, Option<f64>>(7)?,
                        row.get::<_, Option<f64>>(8)?,
                        row.get::<_, Option<f64>>(9)?,
                        row.get::<_, String>(10)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            start_time,
            end_time,
            start_district,
            end_district,
            duration_ms,
            distance_m,
            violation_count,
            min_violation_m,
            max_violation_m,
            avg_violation_m,
            segments_json,
        )) = row
        else {
            return Ok(None);
        };

        let segments: Vec<TripSegment> = serde_json::from_str(&segments_json).map_err(|e| {
            PipelineError::TransientStore(format!("corrupt segments for trip {}: {}", trip_id, e))
        })?;

        Ok(Some(CompletedTrip {
            provider_id: provider_id.to_string(),
            device_id: device_id.to_string(),
            trip_id: trip_id.to_string(),
            start_time,
            end_time,
            start_district,
            end_district,
            duration_ms,
            distance_m,
            violation_count,
            min_violation_m,
            max_violation_m,
            avg_violation_m,
            segments,
        }))
    }

    pub fn count(&self, table: &str) -> Result<i64> {
        if table != "trips" && table != "device_states" {
            return Err(PipelineError::Validation(format!("unknown table {}", table)));
        }
        let conn = self.lock()?;
        let count = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }
}

#[async_trait]
impl PersistenceSink for SqliteSink {
    async fn insert(&self, record: SinkRecord) -> Result<()> {
        let conn = self.lock()?;
        match &record {
            SinkRecord::DeviceState(state) => Self::insert_device_state(&conn, state),
            SinkRecord::Trip(trip) => Self::insert_trip(&conn, trip),
        }
    }
}
