//! checkpoint-store — durable enrollment gallery backed by SQLite.
//!
//! One `enrollments` table with a uniqueness constraint on
//! `credential_code` and non-unique indices on the display fields.
//! Embeddings are stored as little-endian `f32` blobs. `scan_all` returns
//! rows in insertion order (by the autoincrement `seq` column).

use checkpoint_core::gallery::validate_enrollment;
use checkpoint_core::{Embedding, EnrollmentRecord, GalleryError, IdentityGallery, NewEnrollment};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for GalleryError {
    fn from(err: StoreError) -> Self {
        GalleryError::Unavailable(err.to_string())
    }
}

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS enrollments (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    position TEXT NOT NULL,
    rank TEXT NOT NULL,
    unit_type TEXT NOT NULL,
    credential_code INTEGER NOT NULL UNIQUE,
    embedding BLOB,
    image_ref TEXT,
    enrolled_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_enrollments_name ON enrollments(name);
CREATE INDEX IF NOT EXISTS idx_enrollments_position ON enrollments(position);
CREATE INDEX IF NOT EXISTS idx_enrollments_rank ON enrollments(rank);
CREATE INDEX IF NOT EXISTS idx_enrollments_unit_type ON enrollments(unit_type);
";

const SELECT_COLUMNS: &str =
    "id, name, position, rank, unit_type, credential_code, embedding, image_ref, enrolled_at";

/// SQLite-backed [`IdentityGallery`].
pub struct SqliteGallery {
    conn: Mutex<Connection>,
    dimension: usize,
}

impl SqliteGallery {
    /// Open or create the gallery at `path`.
    pub fn open(path: impl AsRef<Path>, dimension: usize) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), dimension, "opened gallery");
        Self::init(conn, dimension)
    }

    pub fn open_in_memory(dimension: usize) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, dimension)
    }

    fn init(conn: Connection, dimension: usize) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            dimension,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, GalleryError> {
        self.conn
            .lock()
            .map_err(|_| GalleryError::Unavailable("gallery connection lock poisoned".into()))
    }
}

impl IdentityGallery for SqliteGallery {
    fn scan_all(&self) -> Result<Vec<EnrollmentRecord>, GalleryError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {SELECT_COLUMNS} FROM enrollments ORDER BY seq"))
            .map_err(StoreError::from)?;
        let records = stmt
            .query_map([], decode_record_row)
            .map_err(StoreError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;
        Ok(records)
    }

    fn find_by_credential_code(
        &self,
        code: i64,
    ) -> Result<Option<EnrollmentRecord>, GalleryError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM enrollments WHERE credential_code = ?1"),
                params![code],
                decode_record_row,
            )
            .optional()
            .map_err(StoreError::from)?;
        Ok(record)
    }

    fn insert(&self, enrollment: NewEnrollment) -> Result<Uuid, GalleryError> {
        validate_enrollment(&enrollment, self.dimension)?;

        let id = Uuid::new_v4();
        let enrolled_at = Utc::now();
        let blob = enrollment
            .embedding
            .as_ref()
            .map(|e| encode_f32_embedding_blob(&e.values));

        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO enrollments (
                id, name, position, rank, unit_type, credential_code,
                embedding, image_ref, enrolled_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id.to_string(),
                enrollment.name,
                enrollment.position,
                enrollment.rank,
                enrollment.unit_type,
                enrollment.credential_code,
                blob,
                enrollment.image_ref,
                enrolled_at.to_rfc3339(),
            ],
        );

        match inserted {
            Ok(_) => {
                tracing::debug!(
                    %id,
                    credential_code = enrollment.credential_code,
                    "enrollment stored"
                );
                Ok(id)
            }
            Err(err) if is_credential_conflict(&err) => Err(GalleryError::DuplicateCredentialCode(
                enrollment.credential_code,
            )),
            Err(err) => Err(StoreError::from(err).into()),
        }
    }

    fn remove(&self, id: Uuid) -> Result<(), GalleryError> {
        let conn = self.conn()?;
        let deleted = conn
            .execute("DELETE FROM enrollments WHERE id = ?1", params![id.to_string()])
            .map_err(StoreError::from)?;
        if deleted == 0 {
            return Err(GalleryError::NotFound(id));
        }
        Ok(())
    }

    fn len(&self) -> Result<usize, GalleryError> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM enrollments", [], |row| row.get(0))
            .map_err(StoreError::from)?;
        usize::try_from(count)
            .map_err(|_| GalleryError::Unavailable(format!("invalid row count: {count}")))
    }
}

fn is_credential_conflict(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, msg) => {
            e.code == ErrorCode::ConstraintViolation
                && msg
                    .as_deref()
                    .is_some_and(|m| m.contains("enrollments.credential_code"))
        }
        _ => false,
    }
}

fn decode_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EnrollmentRecord> {
    let id_raw: String = row.get(0)?;
    let id = Uuid::parse_str(&id_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
    })?;

    let blob: Option<Vec<u8>> = row.get(6)?;
    let embedding = blob.and_then(|bytes| match decode_f32_embedding_blob(&bytes) {
        Some(values) => Some(Embedding::new(values)),
        None => {
            // Stays usable for credential lookup; the matcher never sees it.
            tracing::warn!(%id, len = bytes.len(), "dropping malformed embedding blob");
            None
        }
    });

    let enrolled_raw: String = row.get(8)?;
    let enrolled_at = DateTime::parse_from_rfc3339(&enrolled_raw)
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(err))
        })?
        .with_timezone(&Utc);

    Ok(EnrollmentRecord {
        id,
        name: row.get(1)?,
        position: row.get(2)?,
        rank: row.get(3)?,
        unit_type: row.get(4)?,
        credential_code: row.get(5)?,
        embedding,
        image_ref: row.get(7)?,
        enrolled_at,
    })
}

fn encode_f32_embedding_blob(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(vector));
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// `None` when the blob is not a whole number of `f32`s.
fn decode_f32_embedding_blob(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}
