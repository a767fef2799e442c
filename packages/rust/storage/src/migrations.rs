//! SQL migration definitions for the pdfpipe database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: documents, markdown_chunks, text_chunks",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Submitted PDFs and their pipeline state
CREATE TABLE IF NOT EXISTS documents (
    id                   TEXT PRIMARY KEY,
    owner_id             TEXT NOT NULL,
    filename             TEXT NOT NULL,
    source_key           TEXT NOT NULL,
    status               TEXT NOT NULL,
    failed_stage         TEXT,
    page_count           INTEGER,
    text_chunk_count     INTEGER,
    markdown_chunk_count INTEGER,
    markdown_char_count  INTEGER,
    raw_html_key         TEXT,
    clean_html_key       TEXT,
    markdown_key         TEXT,
    markdown_text        TEXT,
    markdown_preview     TEXT,
    last_error           TEXT,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL,
    completed_at         TEXT
);

CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status, created_at);
CREATE INDEX IF NOT EXISTS idx_documents_owner ON documents(owner_id);

-- Byte-bounded markdown slices, replaced wholesale by the html_to_md stage
CREATE TABLE IF NOT EXISTS markdown_chunks (
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    chunk_index INTEGER NOT NULL,
    text        TEXT NOT NULL,
    char_count  INTEGER NOT NULL,
    PRIMARY KEY (document_id, chunk_index)
);

-- Per-page text-layer slices, replaced wholesale by the extract_pdf_text stage
CREATE TABLE IF NOT EXISTS text_chunks (
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    page_number INTEGER NOT NULL,
    chunk_index INTEGER NOT NULL,
    text        TEXT NOT NULL,
    char_count  INTEGER NOT NULL,
    PRIMARY KEY (document_id, page_number, chunk_index)
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
