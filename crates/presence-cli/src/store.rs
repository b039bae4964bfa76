use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use presence_core::{AttendanceEvent, DayRecord, Embedding, EmbeddingError, Identity, Punch};
use rusqlite::{OptionalExtension, TransactionBehavior};
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const NONCE_LEN: usize = 12;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DAY_FORMAT: &str = "%Y-%m-%d";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("template encryption failed")]
    EncryptionFailed,
    #[error("template decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid template blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid template: {0}")]
    InvalidTemplate(#[from] EmbeddingError),
    #[error("identity name must not be empty")]
    EmptyName,
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// SQLite-backed identity templates and attendance records.
///
/// Templates are encrypted with AES-256-GCM before storage. A
/// per-installation 32-byte key is generated at first use and stored at
/// `{db_dir}/.key` (mode 0600).
///
/// Concurrency: template upsert is a single `INSERT … ON CONFLICT` statement
/// and an attendance mark runs inside one `BEGIN IMMEDIATE` transaction, so
/// several kiosks sharing the database file never both punch in for the same
/// identity and day.
#[derive(Clone)]
pub struct IdentityStore {
    conn: Connection,
    enc_key: [u8; 32],
    embedding_dim: usize,
}

impl IdentityStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path, embedding_dim: usize) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): use a fixed all-zeros key
            [0u8; 32]
        } else {
            let key_path = db_path.parent().unwrap_or(Path::new(".")).join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA busy_timeout = 5000;
                 CREATE TABLE IF NOT EXISTS identities (
                     name TEXT PRIMARY KEY,
                     embedding BLOB NOT NULL,
                     model_version TEXT NOT NULL,
                     created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS attendance (
                     identity TEXT NOT NULL,
                     day TEXT NOT NULL,
                     punch_in TEXT,
                     punch_out TEXT,
                     UNIQUE(identity, day)
                 );
                 CREATE INDEX IF NOT EXISTS idx_attendance_day ON attendance(day);",
            )?;
            Ok(())
        })
        .await?;

        tracing::debug!(path = %db_path.display(), embedding_dim, "identity store opened");

        Ok(Self {
            conn,
            enc_key,
            embedding_dim,
        })
    }

    /// Insert a template, or replace the template of an existing identity.
    ///
    /// The original creation time is kept on replacement.
    pub async fn upsert_identity(&self, name: &str, template: &Embedding) -> Result<(), StoreError> {
        if name.trim().is_empty() {
            return Err(StoreError::EmptyName);
        }
        let blob = self.encrypt_template(&template.values)?;
        let model_version = template
            .model_version
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        let created_at = format_timestamp(chrono::Local::now().naive_local());
        let name = name.to_string();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO identities (name, embedding, model_version, created_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(name) DO UPDATE SET
                         embedding = excluded.embedding,
                         model_version = excluded.model_version",
                    rusqlite::params![name, blob, model_version, created_at],
                )?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    /// All enrolled identities, sorted by name (the matching gallery).
    pub async fn load_gallery(&self) -> Result<Vec<Identity>, StoreError> {
        // Fetch raw rows from SQLite; decrypt outside the blocking closure
        let rows: Vec<(String, Vec<u8>, String, String)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name, embedding, model_version, created_at
                     FROM identities ORDER BY name",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let mut gallery = Vec::with_capacity(rows.len());
        for (name, blob, model_version, created_at) in rows {
            let values = self.decrypt_template(&blob)?;
            gallery.push(Identity {
                name,
                template: Embedding {
                    values,
                    model_version: Some(model_version),
                },
                created_at,
            });
        }
        Ok(gallery)
    }

    /// Enrolled identities (metadata only, no templates).
    pub async fn list_identities(&self) -> Result<Vec<IdentityInfo>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name, model_version, created_at FROM identities ORDER BY name",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(IdentityInfo {
                        name: row.get(0)?,
                        model_version: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Remove an identity's template. Attendance history is kept.
    pub async fn remove_identity(&self, name: &str) -> Result<bool, StoreError> {
        let name = name.to_string();
        self.conn
            .call(move |conn| {
                let affected = conn.execute("DELETE FROM identities WHERE name = ?1", [&name])?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn count_identities(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Apply one attendance mark for `identity` at local time `now`.
    ///
    /// Read and write happen inside one immediate transaction.
    pub async fn mark_attendance(
        &self,
        identity: &str,
        now: NaiveDateTime,
    ) -> Result<Punch, StoreError> {
        // Stored with second precision; keep the returned record identical.
        let now = now.with_nanosecond(0).unwrap_or(now);
        let day = now.date();
        let day_str = day.format(DAY_FORMAT).to_string();
        let name = identity.to_string();

        let transition = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let existing = tx
                    .query_row(
                        "SELECT punch_in, punch_out FROM attendance
                         WHERE identity = ?1 AND day = ?2",
                        rusqlite::params![name, day_str],
                        |row| {
                            Ok(DayRecord {
                                punch_in: read_timestamp(row, 0)?,
                                punch_out: read_timestamp(row, 1)?,
                            })
                        },
                    )
                    .optional()?;

                let transition = DayRecord::apply(existing.as_ref(), now);
                if transition.changed {
                    tx.execute(
                        "INSERT INTO attendance (identity, day, punch_in, punch_out)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(identity, day) DO UPDATE SET
                             punch_in = excluded.punch_in,
                             punch_out = excluded.punch_out",
                        rusqlite::params![
                            name,
                            day_str,
                            transition.record.punch_in.map(format_timestamp),
                            transition.record.punch_out.map(format_timestamp),
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(transition)
            })
            .await?;

        if transition.event == AttendanceEvent::DoneForDay {
            tracing::debug!(identity, %day, "already punched out today");
        } else {
            tracing::info!(identity, %day, event = %transition.event, "attendance recorded");
        }

        Ok(Punch {
            identity: identity.to_string(),
            day,
            event: transition.event,
            at: now,
            record: transition.record,
        })
    }

    /// Attendance rows for one day, sorted by identity.
    pub async fn attendance_for_day(&self, day: NaiveDate) -> Result<Vec<DayEntry>, StoreError> {
        let day_str = day.format(DAY_FORMAT).to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT identity, punch_in, punch_out FROM attendance
                     WHERE day = ?1 ORDER BY identity",
                )?;
                let rows = stmt.query_map([&day_str], |row| {
                    Ok(DayEntry {
                        identity: row.get(0)?,
                        day,
                        record: DayRecord {
                            punch_in: read_timestamp(row, 1)?,
                            punch_out: read_timestamp(row, 2)?,
                        },
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Encrypt template values with AES-256-GCM.
    ///
    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_template(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        self.validate_template(values)?;
        let plaintext = template_to_bytes(values);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_template(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        let values = bytes_to_template(&plaintext)?;
        self.validate_template(&values)?;
        Ok(values)
    }

    fn validate_template(&self, values: &[f32]) -> Result<(), EmbeddingError> {
        if values.len() != self.embedding_dim {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.embedding_dim,
                actual: values.len(),
            });
        }
        if let Some(i) = values.iter().position(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite(i));
        }
        Ok(())
    }
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        if bytes.len() != 32 {
            return Err(StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn template_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn bytes_to_template(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() % 4 != 0 {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn read_timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDateTime>> {
    let Some(text) = row.get::<_, Option<String>>(idx)? else {
        return Ok(None);
    };
    NaiveDateTime::parse_from_str(&text, TIMESTAMP_FORMAT)
        .map(Some)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

// ── Public types ──────────────────────────────────────────────────────────────

/// Metadata about an enrolled identity (no template data).
#[derive(Debug, Clone, serde::Serialize)]
pub struct IdentityInfo {
    pub name: String,
    pub model_version: String,
    pub created_at: String,
}

/// One identity's attendance for a day.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DayEntry {
    pub identity: String,
    pub day: NaiveDate,
    #[serde(flatten)]
    pub record: DayRecord,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
