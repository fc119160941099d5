use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection};
use tracing::debug;

use crewflow_core::error::Result;
use crewflow_core::traits::KnowledgeBase;
use crewflow_core::types::KnowledgeHit;

use crate::{db_err, ensure_parent};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS documents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        doc_id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        kb_id TEXT NOT NULL,
        title TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (tenant_id, kb_id, doc_id)
    );

    CREATE VIRTUAL TABLE IF NOT EXISTS documents_fts USING fts5(
        title,
        content,
        tokenize='porter unicode61'
    );

    CREATE TRIGGER IF NOT EXISTS documents_ai AFTER INSERT ON documents BEGIN
        INSERT INTO documents_fts(rowid, title, content)
        VALUES (new.id, new.title, new.content);
    END;

    CREATE TRIGGER IF NOT EXISTS documents_ad AFTER DELETE ON documents BEGIN
        DELETE FROM documents_fts WHERE rowid = old.id;
    END;
";

/// SQLite-backed knowledge base with FTS5 `bm25` ranking.
///
/// Documents are scoped by tenant and knowledge base id; a search never
/// crosses either boundary.
pub struct SqliteKnowledgeBase {
    conn: Mutex<Connection>,
}

impl SqliteKnowledgeBase {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        ensure_parent(path)?;
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        debug!(path = %path.display(), "Knowledge base opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Add a document and return its generated id.
    pub fn add_document(
        &self,
        tenant_id: &str,
        knowledge_base_id: &str,
        title: &str,
        content: &str,
    ) -> Result<String> {
        let doc_id = uuid::Uuid::new_v4().to_string();
        let conn = self.conn.lock().map_err(db_err)?;
        conn.execute(
            "INSERT INTO documents (doc_id, tenant_id, kb_id, title, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                doc_id,
                tenant_id,
                knowledge_base_id,
                title,
                content,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(db_err)?;
        Ok(doc_id)
    }

    /// Remove a document. Returns whether it existed.
    pub fn remove_document(
        &self,
        tenant_id: &str,
        knowledge_base_id: &str,
        doc_id: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().map_err(db_err)?;
        let n = conn
            .execute(
                "DELETE FROM documents WHERE tenant_id = ?1 AND kb_id = ?2 AND doc_id = ?3",
                params![tenant_id, knowledge_base_id, doc_id],
            )
            .map_err(db_err)?;
        Ok(n > 0)
    }

    pub fn count(&self, tenant_id: &str, knowledge_base_id: &str) -> Result<usize> {
        let conn = self.conn.lock().map_err(db_err)?;
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM documents WHERE tenant_id = ?1 AND kb_id = ?2",
                params![tenant_id, knowledge_base_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(n as usize)
    }
}

/// Turn free text into an FTS5 query: every word quoted, any may match.
fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| format!("\"{}\"", w))
        .collect();
    (!terms.is_empty()).then(|| terms.join(" OR "))
}

impl KnowledgeBase for SqliteKnowledgeBase {
    fn search(
        &self,
        tenant_id: &str,
        knowledge_base_id: &str,
        query: &str,
        top_k: usize,
    ) -> BoxFuture<'_, Result<Vec<KnowledgeHit>>> {
        let tenant_id = tenant_id.to_string();
        let kb_id = knowledge_base_id.to_string();
        let fts = fts_query(query);

        Box::pin(async move {
            let Some(fts) = fts else {
                return Ok(Vec::new());
            };
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT d.doc_id, d.title, d.content, bm25(documents_fts) AS score
                     FROM documents_fts
                     JOIN documents d ON d.id = documents_fts.rowid
                     WHERE documents_fts MATCH ?1 AND d.tenant_id = ?2 AND d.kb_id = ?3
                     ORDER BY score
                     LIMIT ?4",
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![fts, tenant_id, kb_id, top_k as i64], |row| {
                    let score: f64 = row.get(3)?;
                    Ok(KnowledgeHit {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        content: row.get(2)?,
                        // bm25 is lower-is-better; flip so callers sort descending.
                        score: -score,
                    })
                })
                .map_err(db_err)?;

            let mut hits = Vec::new();
            for row in rows {
                hits.push(row.map_err(db_err)?);
            }
            Ok(hits)
        })
    }
}
