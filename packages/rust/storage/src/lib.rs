//! libSQL storage layer for pdfpipe (local mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding documents and their
//! markdown/text chunk rows.
//!
//! **Concurrency rules:**
//! - every status change is a compare-and-swap on the current status
//! - a stage commit moves the status and replaces its chunk rows in one
//!   transaction, so readers never see a mix of two runs
//! - several worker processes may share one database file; the connection
//!   busy timeout serializes their writes

mod migrations;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, Row, params};
use tracing::{debug, info};

use pdfpipe_shared::{
    Document, DocumentId, DocumentStatus, MarkdownChunk, NewDocument, PipelineError, Result,
    TextChunk,
};

/// How long a write waits for another process's lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const DOCUMENT_COLUMNS: &str = "id, owner_id, filename, source_key, status, failed_stage, \
     page_count, text_chunk_count, markdown_chunk_count, markdown_char_count, \
     raw_html_key, clean_html_key, markdown_key, markdown_text, markdown_preview, \
     last_error, created_at, updated_at, completed_at";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

// ---------------------------------------------------------------------------
// Stage outputs
// ---------------------------------------------------------------------------

/// Columns (and chunk rows) written together with a stage's status advance.
#[derive(Debug, Clone)]
pub enum StageOutputs {
    RawHtml { key: String },
    CleanHtml { key: String },
    Markdown(MarkdownOutput),
    Text(TextOutput),
}

/// Result of the html_to_md stage.
#[derive(Debug, Clone)]
pub struct MarkdownOutput {
    /// Blob key of the full markdown.
    pub key: String,
    /// Full markdown, when small enough to keep inline.
    pub inline_text: Option<String>,
    /// Leading slice, when the markdown is too large to inline.
    pub preview: Option<String>,
    pub char_count: u64,
    pub chunks: Vec<MarkdownChunk>,
}

/// Result of the extract_pdf_text stage.
#[derive(Debug, Clone)]
pub struct TextOutput {
    pub page_count: u32,
    pub chunks: Vec<TextChunk>,
}

/// A `processing:*` document reset to `pending` by stale-claim recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredClaim {
    pub id: String,
    pub stage: DocumentStatus,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }

        let storage = Self::connect(path, false).await?;
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (for status queries).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::Storage(format!(
                "database not found at {}",
                path.display()
            )));
        }
        Self::connect(path, true).await
    }

    async fn connect(path: &Path, readonly: bool) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .await
            .map_err(db_err)?;

        Ok(Self { db, conn, readonly })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        PipelineError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(PipelineError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Document operations
    // -----------------------------------------------------------------------

    /// Record a freshly uploaded document in `uploaded` status.
    pub async fn insert_document(&self, new: &NewDocument) -> Result<Document> {
        self.check_writable()?;
        let id = DocumentId::new().to_string();
        let now = Utc::now();
        let stamp = timestamp(now);

        self.conn
            .execute(
                "INSERT INTO documents (id, owner_id, filename, source_key, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.as_str(),
                    new.owner_id.as_str(),
                    new.filename.as_str(),
                    new.source_key.as_str(),
                    DocumentStatus::Uploaded.as_str(),
                    stamp.as_str(),
                    stamp.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;

        debug!(document_id = %id, "inserted document");
        self.get_document(&id)
            .await?
            .ok_or_else(|| PipelineError::not_found(id))
    }

    /// Get a document by ID.
    pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1");
        let mut rows = self.conn.query(&sql, params![id]).await.map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_document(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// IDs of up to `limit` documents a worker may claim, oldest first.
    pub async fn list_claimable(&self, limit: u32) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT id FROM documents WHERE status IN ({}) ORDER BY created_at, id LIMIT ?1",
            status_list(&DocumentStatus::CLAIMABLE)
        );
        let mut rows = self
            .conn
            .query(&sql, params![i64::from(limit)])
            .await
            .map_err(db_err)?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            ids.push(row.get::<String>(0).map_err(db_err)?);
        }
        Ok(ids)
    }

    /// Number of documents per status.
    pub async fn count_by_status(&self) -> Result<Vec<(DocumentStatus, u64)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT status, COUNT(*) FROM documents GROUP BY status ORDER BY status",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut counts = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let status: DocumentStatus = row.get::<String>(0).map_err(db_err)?.parse()?;
            let count = row.get::<i64>(1).map_err(db_err)?;
            counts.push((status, count.max(0) as u64));
        }
        Ok(counts)
    }

    /// Delete a document and all of its chunk rows. Returns `false` if it did not exist.
    pub async fn delete_document(&self, id: &str) -> Result<bool> {
        self.check_writable()?;
        let tx = self.conn.transaction().await.map_err(db_err)?;

        tx.execute("DELETE FROM markdown_chunks WHERE document_id = ?1", params![id])
            .await
            .map_err(db_err)?;
        tx.execute("DELETE FROM text_chunks WHERE document_id = ?1", params![id])
            .await
            .map_err(db_err)?;
        let deleted = tx
            .execute("DELETE FROM documents WHERE id = ?1", params![id])
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(document_id = id, deleted, "deleted document");
        Ok(deleted > 0)
    }

    // -----------------------------------------------------------------------
    // Status transitions
    // -----------------------------------------------------------------------

    /// Move a claimable document (`uploaded`, `pending`, `failed`) into `target`.
    ///
    /// Returns `false` when the row is no longer claimable, i.e. another worker
    /// won the race.
    pub async fn claim(&self, id: &str, target: DocumentStatus) -> Result<bool> {
        self.check_writable()?;
        if !target.is_processing() {
            return Err(PipelineError::InvalidStatus {
                status: target.to_string(),
            });
        }

        let sql = format!(
            "UPDATE documents SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status IN ({})",
            status_list(&DocumentStatus::CLAIMABLE)
        );
        let now = timestamp(Utc::now());
        let changed = self
            .conn
            .execute(&sql, params![target.as_str(), now.as_str(), id])
            .await
            .map_err(db_err)?;

        debug!(document_id = id, %target, claimed = changed > 0, "claim attempt");
        Ok(changed > 0)
    }

    /// Advance a document from `from` to the next stage, writing `outputs`.
    ///
    /// Status, output columns and chunk rows change in one transaction, and
    /// only if the document is still in `from`. Clears `last_error` and
    /// `failed_stage`. Returns `false` (with nothing written) when the
    /// compare-and-swap loses.
    pub async fn commit_stage(
        &self,
        id: &str,
        from: DocumentStatus,
        outputs: &StageOutputs,
    ) -> Result<bool> {
        self.check_writable()?;
        let next = from.next().ok_or_else(|| PipelineError::InvalidStatus {
            status: from.to_string(),
        })?;
        let now = timestamp(Utc::now());

        let tx = self.conn.transaction().await.map_err(db_err)?;

        let changed = match outputs {
            StageOutputs::RawHtml { key } => {
                tx.execute(
                    "UPDATE documents SET status = ?1, raw_html_key = ?2,
                       last_error = NULL, failed_stage = NULL, updated_at = ?3
                     WHERE id = ?4 AND status = ?5",
                    params![next.as_str(), key.as_str(), now.as_str(), id, from.as_str()],
                )
                .await
            }
            StageOutputs::CleanHtml { key } => {
                tx.execute(
                    "UPDATE documents SET status = ?1, clean_html_key = ?2,
                       last_error = NULL, failed_stage = NULL, updated_at = ?3
                     WHERE id = ?4 AND status = ?5",
                    params![next.as_str(), key.as_str(), now.as_str(), id, from.as_str()],
                )
                .await
            }
            StageOutputs::Markdown(md) => {
                tx.execute(
                    "UPDATE documents SET status = ?1, markdown_key = ?2, markdown_text = ?3,
                       markdown_preview = ?4, markdown_char_count = ?5, markdown_chunk_count = ?6,
                       last_error = NULL, failed_stage = NULL, updated_at = ?7
                     WHERE id = ?8 AND status = ?9",
                    params![
                        next.as_str(),
                        md.key.as_str(),
                        md.inline_text.as_deref(),
                        md.preview.as_deref(),
                        md.char_count as i64,
                        md.chunks.len() as i64,
                        now.as_str(),
                        id,
                        from.as_str(),
                    ],
                )
                .await
            }
            StageOutputs::Text(text) => {
                let completed_at = (next == DocumentStatus::Completed).then(|| now.clone());
                tx.execute(
                    "UPDATE documents SET status = ?1, page_count = ?2, text_chunk_count = ?3,
                       completed_at = COALESCE(?4, completed_at),
                       last_error = NULL, failed_stage = NULL, updated_at = ?5
                     WHERE id = ?6 AND status = ?7",
                    params![
                        next.as_str(),
                        i64::from(text.page_count),
                        text.chunks.len() as i64,
                        completed_at.as_deref(),
                        now.as_str(),
                        id,
                        from.as_str(),
                    ],
                )
                .await
            }
        }
        .map_err(db_err)?;

        if changed == 0 {
            tx.rollback().await.map_err(db_err)?;
            debug!(document_id = id, %from, "stage commit lost the race");
            return Ok(false);
        }

        match outputs {
            StageOutputs::Markdown(md) => replace_markdown_chunks(&tx, id, &md.chunks).await?,
            StageOutputs::Text(text) => replace_text_chunks(&tx, id, &text.chunks).await?,
            StageOutputs::RawHtml { .. } | StageOutputs::CleanHtml { .. } => {}
        }

        tx.commit().await.map_err(db_err)?;
        debug!(document_id = id, %from, %next, "stage committed");
        Ok(true)
    }

    /// Record a stage failure: `status = failed`, the message, and the stage.
    ///
    /// Only applies while the document is still in `stage`.
    pub async fn mark_failed(&self, id: &str, stage: DocumentStatus, message: &str) -> Result<bool> {
        self.check_writable()?;
        let now = timestamp(Utc::now());
        let changed = self
            .conn
            .execute(
                "UPDATE documents SET status = ?1, last_error = ?2, failed_stage = ?3, updated_at = ?4
                 WHERE id = ?5 AND status = ?3",
                params![
                    DocumentStatus::Failed.as_str(),
                    message,
                    stage.as_str(),
                    now.as_str(),
                    id,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Reset `processing:*` documents last touched before `cutoff` to `pending`.
    ///
    /// Each reset is conditional on the status and timestamp observed, so a
    /// worker that commits in between keeps its result.
    pub async fn reset_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<RecoveredClaim>> {
        self.check_writable()?;
        let sql = format!(
            "SELECT id, status, updated_at FROM documents WHERE status IN ({})",
            status_list(&DocumentStatus::PROCESSING)
        );
        let mut rows = self.conn.query(&sql, params![]).await.map_err(db_err)?;

        let mut candidates = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let id = row.get::<String>(0).map_err(db_err)?;
            let stage: DocumentStatus = row.get::<String>(1).map_err(db_err)?.parse()?;
            let updated_at = row.get::<String>(2).map_err(db_err)?;
            if parse_timestamp(&updated_at)? < cutoff {
                candidates.push((id, stage, updated_at));
            }
        }

        let mut recovered = Vec::new();
        for (id, stage, updated_at) in candidates {
            let message = format!("stale claim recovered from {stage}");
            let now = timestamp(Utc::now());
            let changed = self
                .conn
                .execute(
                    "UPDATE documents SET status = ?1, last_error = ?2, updated_at = ?3
                     WHERE id = ?4 AND status = ?5 AND updated_at = ?6",
                    params![
                        DocumentStatus::Pending.as_str(),
                        message.as_str(),
                        now.as_str(),
                        id.as_str(),
                        stage.as_str(),
                        updated_at.as_str(),
                    ],
                )
                .await
                .map_err(db_err)?;
            if changed > 0 {
                info!(document_id = %id, %stage, "recovered stale claim");
                recovered.push(RecoveredClaim { id, stage });
            }
        }
        Ok(recovered)
    }

    // -----------------------------------------------------------------------
    // Chunk queries
    // -----------------------------------------------------------------------

    /// Markdown chunks of a document in index order.
    pub async fn list_markdown_chunks(&self, id: &str) -> Result<Vec<MarkdownChunk>> {
        let mut rows = self
            .conn
            .query(
                "SELECT document_id, chunk_index, text, char_count
                 FROM markdown_chunks WHERE document_id = ?1 ORDER BY chunk_index",
                params![id],
            )
            .await
            .map_err(db_err)?;

        let mut chunks = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            chunks.push(MarkdownChunk {
                document_id: row.get::<String>(0).map_err(db_err)?,
                chunk_index: row.get::<u32>(1).map_err(db_err)?,
                text: row.get::<String>(2).map_err(db_err)?,
                char_count: row.get::<u32>(3).map_err(db_err)?,
            });
        }
        Ok(chunks)
    }

    /// Text chunks of a document in page, then index order.
    pub async fn list_text_chunks(&self, id: &str) -> Result<Vec<TextChunk>> {
        let mut rows = self
            .conn
            .query(
                "SELECT document_id, page_number, chunk_index, text, char_count
                 FROM text_chunks WHERE document_id = ?1 ORDER BY page_number, chunk_index",
                params![id],
            )
            .await
            .map_err(db_err)?;

        let mut chunks = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            chunks.push(TextChunk {
                document_id: row.get::<String>(0).map_err(db_err)?,
                page_number: row.get::<u32>(1).map_err(db_err)?,
                chunk_index: row.get::<u32>(2).map_err(db_err)?,
                text: row.get::<String>(3).map_err(db_err)?,
                char_count: row.get::<u32>(4).map_err(db_err)?,
            });
        }
        Ok(chunks)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn db_err(e: libsql::Error) -> PipelineError {
    PipelineError::Storage(e.to_string())
}

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PipelineError::Storage(format!("invalid date: {e}")))
}

/// SQL `IN` list of status literals. Statuses are fixed identifiers, never user input.
fn status_list(statuses: &[DocumentStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

async fn replace_markdown_chunks(
    conn: &Connection,
    id: &str,
    chunks: &[MarkdownChunk],
) -> Result<()> {
    conn.execute("DELETE FROM markdown_chunks WHERE document_id = ?1", params![id])
        .await
        .map_err(db_err)?;

    for chunk in chunks {
        conn.execute(
            "INSERT INTO markdown_chunks (document_id, chunk_index, text, char_count)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                id,
                i64::from(chunk.chunk_index),
                chunk.text.as_str(),
                i64::from(chunk.char_count),
            ],
        )
        .await
        .map_err(db_err)?;
    }
    Ok(())
}

async fn replace_text_chunks(conn: &Connection, id: &str, chunks: &[TextChunk]) -> Result<()> {
    conn.execute("DELETE FROM text_chunks WHERE document_id = ?1", params![id])
        .await
        .map_err(db_err)?;

    for chunk in chunks {
        conn.execute(
            "INSERT INTO text_chunks (document_id, page_number, chunk_index, text, char_count)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                i64::from(chunk.page_number),
                i64::from(chunk.chunk_index),
                chunk.text.as_str(),
                i64::from(chunk.char_count),
            ],
        )
        .await
        .map_err(db_err)?;
    }
    Ok(())
}

/// Convert a database row (selected with [`DOCUMENT_COLUMNS`]) to a [`Document`].
fn row_to_document(row: &Row) -> Result<Document> {
    let optional_status = |idx: i32| -> Result<Option<DocumentStatus>> {
        row.get::<String>(idx).ok().map(|s| s.parse()).transpose()
    };
    let optional_time = |idx: i32| -> Result<Option<DateTime<Utc>>> {
        row.get::<String>(idx)
            .ok()
            .map(|s| parse_timestamp(&s))
            .transpose()
    };

    Ok(Document {
        id: row.get::<String>(0).map_err(db_err)?,
        owner_id: row.get::<String>(1).map_err(db_err)?,
        filename: row.get::<String>(2).map_err(db_err)?,
        source_key: row.get::<String>(3).map_err(db_err)?,
        status: row.get::<String>(4).map_err(db_err)?.parse()?,
        failed_stage: optional_status(5)?,
        page_count: row.get::<u32>(6).ok(),
        text_chunk_count: row.get::<u32>(7).ok(),
        markdown_chunk_count: row.get::<u32>(8).ok(),
        markdown_char_count: row.get::<i64>(9).ok().map(|v| v.max(0) as u64),
        raw_html_key: row.get::<String>(10).ok(),
        clean_html_key: row.get::<String>(11).ok(),
        markdown_key: row.get::<String>(12).ok(),
        markdown_text: row.get::<String>(13).ok(),
        markdown_preview: row.get::<String>(14).ok(),
        last_error: row.get::<String>(15).ok(),
        created_at: parse_timestamp(&row.get::<String>(16).map_err(db_err)?)?,
        updated_at: parse_timestamp(&row.get::<String>(17).map_err(db_err)?)?,
        completed_at: optional_time(18)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_db_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("pdfpipe_test_{}.db", Uuid::now_v7()))
    }

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        Storage::open(&temp_db_path()).await.expect("open test db")
    }

    fn new_doc() -> NewDocument {
        NewDocument {
            owner_id: "owner-1".into(),
            filename: "book.pdf".into(),
            source_key: "uploads/owner-1/book.pdf".into(),
        }
    }

    fn markdown_output(id: &str, texts: &[&str]) -> StageOutputs {
        let chunks = texts
            .iter()
            .enumerate()
            .map(|(i, t)| MarkdownChunk {
                document_id: id.to_string(),
                chunk_index: i as u32,
                text: t.to_string(),
                char_count: t.chars().count() as u32,
            })
            .collect();
        StageOutputs::Markdown(MarkdownOutput {
            key: format!("documents/{id}/document.md"),
            inline_text: Some(texts.concat()),
            preview: None,
            char_count: texts.concat().chars().count() as u64,
            chunks,
        })
    }

    /// Walk a fresh document up to (and including) `target`.
    async fn advance_to(storage: &Storage, id: &str, target: DocumentStatus) {
        assert!(storage.claim(id, DocumentStatus::PdfToHtml).await.unwrap());
        let mut current = DocumentStatus::PdfToHtml;
        while current != target {
            let outputs = match current {
                DocumentStatus::PdfToHtml => StageOutputs::RawHtml { key: "raw".into() },
                DocumentStatus::CleanupHtml => StageOutputs::CleanHtml { key: "clean".into() },
                DocumentStatus::HtmlToMd => markdown_output(id, &["# a"]),
                _ => StageOutputs::Text(TextOutput {
                    page_count: 1,
                    chunks: vec![],
                }),
            };
            assert!(storage.commit_stage(id, current, &outputs).await.unwrap());
            current = current.next().unwrap();
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = temp_db_path();
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn insert_and_get_document() {
        let storage = test_storage().await;
        let doc = storage.insert_document(&new_doc()).await.expect("insert");

        assert_eq!(doc.status, DocumentStatus::Uploaded);
        assert_eq!(doc.filename, "book.pdf");
        assert!(doc.last_error.is_none());
        assert!(doc.completed_at.is_none());

        let found = storage.get_document(&doc.id).await.unwrap().expect("found");
        assert_eq!(found.id, doc.id);
        assert_eq!(found.source_key, "uploads/owner-1/book.pdf");

        assert!(storage.get_document("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let path = temp_db_path();
        let a = Storage::open(&path).await.unwrap();
        let b = Storage::open(&path).await.unwrap();
        let doc = a.insert_document(&new_doc()).await.unwrap();

        let (first, second) = tokio::join!(
            a.claim(&doc.id, DocumentStatus::PdfToHtml),
            b.claim(&doc.id, DocumentStatus::PdfToHtml),
        );
        let wins = [first.unwrap(), second.unwrap()];
        assert_eq!(wins.iter().filter(|w| **w).count(), 1);

        let doc = a.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::PdfToHtml);
    }

    #[tokio::test]
    async fn claim_requires_claimable_source_and_stage_target() {
        let storage = test_storage().await;
        let doc = storage.insert_document(&new_doc()).await.unwrap();

        let err = storage.claim(&doc.id, DocumentStatus::Completed).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidStatus { .. }));

        assert!(storage.claim(&doc.id, DocumentStatus::PdfToHtml).await.unwrap());
        // Already processing: a second claim is a no-op.
        assert!(!storage.claim(&doc.id, DocumentStatus::PdfToHtml).await.unwrap());
    }

    #[tokio::test]
    async fn commit_stage_advances_and_clears_error() {
        let storage = test_storage().await;
        let doc = storage.insert_document(&new_doc()).await.unwrap();
        storage.claim(&doc.id, DocumentStatus::PdfToHtml).await.unwrap();
        storage
            .mark_failed(&doc.id, DocumentStatus::PdfToHtml, "boom")
            .await
            .unwrap();
        storage.claim(&doc.id, DocumentStatus::PdfToHtml).await.unwrap();

        let committed = storage
            .commit_stage(
                &doc.id,
                DocumentStatus::PdfToHtml,
                &StageOutputs::RawHtml {
                    key: "documents/x/raw.html".into(),
                },
            )
            .await
            .unwrap();
        assert!(committed);

        let doc = storage.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::CleanupHtml);
        assert_eq!(doc.raw_html_key.as_deref(), Some("documents/x/raw.html"));
        assert!(doc.last_error.is_none());
        assert!(doc.failed_stage.is_none());
    }

    #[tokio::test]
    async fn commit_stage_loses_when_status_moved() {
        let storage = test_storage().await;
        let doc = storage.insert_document(&new_doc()).await.unwrap();
        advance_to(&storage, &doc.id, DocumentStatus::HtmlToMd).await;

        // Someone else already committed html_to_md.
        assert!(
            storage
                .commit_stage(&doc.id, DocumentStatus::HtmlToMd, &markdown_output(&doc.id, &["a"]))
                .await
                .unwrap()
        );
        let stale = markdown_output(&doc.id, &["x", "y", "z"]);
        assert!(
            !storage
                .commit_stage(&doc.id, DocumentStatus::HtmlToMd, &stale)
                .await
                .unwrap()
        );

        let chunks = storage.list_markdown_chunks(&doc.id).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "a");
    }

    #[tokio::test]
    async fn markdown_chunks_are_replaced_wholesale() {
        let storage = test_storage().await;
        let doc = storage.insert_document(&new_doc()).await.unwrap();
        advance_to(&storage, &doc.id, DocumentStatus::HtmlToMd).await;

        let first = markdown_output(&doc.id, &["one", "two", "three", "four"]);
        storage
            .commit_stage(&doc.id, DocumentStatus::HtmlToMd, &first)
            .await
            .unwrap();
        assert_eq!(storage.list_markdown_chunks(&doc.id).await.unwrap().len(), 4);

        // Fail the next stage and re-enter at html_to_md.
        storage
            .mark_failed(&doc.id, DocumentStatus::ExtractPdfText, "parser exploded")
            .await
            .unwrap();
        assert!(storage.claim(&doc.id, DocumentStatus::HtmlToMd).await.unwrap());

        let second = markdown_output(&doc.id, &["uno", "dos"]);
        storage
            .commit_stage(&doc.id, DocumentStatus::HtmlToMd, &second)
            .await
            .unwrap();

        let chunks = storage.list_markdown_chunks(&doc.id).await.unwrap();
        let indices: Vec<u32> = chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(chunks[0].text, "uno");

        let doc = storage.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(doc.markdown_chunk_count, Some(2));
    }

    #[tokio::test]
    async fn text_commit_completes_document() {
        let storage = test_storage().await;
        let doc = storage.insert_document(&new_doc()).await.unwrap();
        advance_to(&storage, &doc.id, DocumentStatus::ExtractPdfText).await;

        let outputs = StageOutputs::Text(TextOutput {
            page_count: 3,
            chunks: vec![
                TextChunk {
                    document_id: doc.id.clone(),
                    page_number: 1,
                    chunk_index: 0,
                    text: "Hello world.".into(),
                    char_count: 12,
                },
                TextChunk {
                    document_id: doc.id.clone(),
                    page_number: 3,
                    chunk_index: 0,
                    text: "Foo bar baz.".into(),
                    char_count: 12,
                },
            ],
        });
        assert!(
            storage
                .commit_stage(&doc.id, DocumentStatus::ExtractPdfText, &outputs)
                .await
                .unwrap()
        );

        let doc = storage.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Completed);
        assert_eq!(doc.page_count, Some(3));
        assert_eq!(doc.text_chunk_count, Some(2));
        assert!(doc.completed_at.is_some());

        let pages: Vec<u32> = storage
            .list_text_chunks(&doc.id)
            .await
            .unwrap()
            .iter()
            .map(|c| c.page_number)
            .collect();
        assert_eq!(pages, vec![1, 3]);
    }

    #[tokio::test]
    async fn mark_failed_records_stage_only_from_that_stage() {
        let storage = test_storage().await;
        let doc = storage.insert_document(&new_doc()).await.unwrap();
        storage.claim(&doc.id, DocumentStatus::PdfToHtml).await.unwrap();

        // Wrong stage: nothing happens.
        assert!(
            !storage
                .mark_failed(&doc.id, DocumentStatus::HtmlToMd, "nope")
                .await
                .unwrap()
        );

        assert!(
            storage
                .mark_failed(&doc.id, DocumentStatus::PdfToHtml, "conversion service error (502)")
                .await
                .unwrap()
        );
        let doc = storage.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert_eq!(doc.failed_stage, Some(DocumentStatus::PdfToHtml));
        assert_eq!(doc.last_error.as_deref(), Some("conversion service error (502)"));
    }

    #[tokio::test]
    async fn reset_stale_only_touches_old_processing_rows() {
        let storage = test_storage().await;
        let stuck = storage.insert_document(&new_doc()).await.unwrap();
        let waiting = storage.insert_document(&new_doc()).await.unwrap();
        advance_to(&storage, &stuck.id, DocumentStatus::CleanupHtml).await;

        // A cutoff in the past recovers nothing.
        let none = storage
            .reset_stale(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(none.is_empty());

        let recovered = storage
            .reset_stale(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(
            recovered,
            vec![RecoveredClaim {
                id: stuck.id.clone(),
                stage: DocumentStatus::CleanupHtml,
            }]
        );

        let stuck = storage.get_document(&stuck.id).await.unwrap().unwrap();
        assert_eq!(stuck.status, DocumentStatus::Pending);
        assert_eq!(
            stuck.last_error.as_deref(),
            Some("stale claim recovered from processing:cleanup_html")
        );
        let waiting = storage.get_document(&waiting.id).await.unwrap().unwrap();
        assert_eq!(waiting.status, DocumentStatus::Uploaded);
    }

    #[tokio::test]
    async fn list_claimable_orders_and_limits() {
        let storage = test_storage().await;
        let a = storage.insert_document(&new_doc()).await.unwrap();
        let b = storage.insert_document(&new_doc()).await.unwrap();
        let c = storage.insert_document(&new_doc()).await.unwrap();
        storage.claim(&b.id, DocumentStatus::PdfToHtml).await.unwrap();

        assert_eq!(storage.list_claimable(10).await.unwrap(), vec![a.id.clone(), c.id.clone()]);
        assert_eq!(storage.list_claimable(1).await.unwrap(), vec![a.id]);

        let counts = storage.count_by_status().await.unwrap();
        assert!(counts.contains(&(DocumentStatus::Uploaded, 2)));
        assert!(counts.contains(&(DocumentStatus::PdfToHtml, 1)));
    }

    #[tokio::test]
    async fn delete_removes_chunks() {
        let storage = test_storage().await;
        let doc = storage.insert_document(&new_doc()).await.unwrap();
        advance_to(&storage, &doc.id, DocumentStatus::ExtractPdfText).await;
        assert_eq!(storage.list_markdown_chunks(&doc.id).await.unwrap().len(), 1);

        assert!(storage.delete_document(&doc.id).await.unwrap());
        assert!(storage.get_document(&doc.id).await.unwrap().is_none());
        assert!(storage.list_markdown_chunks(&doc.id).await.unwrap().is_empty());
        assert!(!storage.delete_document(&doc.id).await.unwrap());
    }

    #[tokio::test]
    async fn foreign_keys_cascade_on_raw_delete() {
        let storage = test_storage().await;
        let doc = storage.insert_document(&new_doc()).await.unwrap();
        advance_to(&storage, &doc.id, DocumentStatus::ExtractPdfText).await;

        storage
            .conn
            .execute("DELETE FROM documents WHERE id = ?1", params![doc.id.as_str()])
            .await
            .unwrap();
        assert!(storage.list_markdown_chunks(&doc.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = temp_db_path();
        let rw = Storage::open(&tmp).await.unwrap();
        let doc = rw.insert_document(&new_doc()).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert!(ro.get_document(&doc.id).await.unwrap().is_some());
        let result = ro.insert_document(&new_doc()).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
