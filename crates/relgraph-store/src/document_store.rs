//! SQLite-backed document store
//!
//! Each document is one row of the `documents` table with its fields kept
//! as a JSON object in `body`. A `put` batch is written in a single
//! transaction; notifications go out only after the commit succeeds.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use relgraph_core::store::{Document, DocumentStore, StoreNotification, WriteResult};
use relgraph_core_types::LocalId;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::db;
use crate::errors::{corrupt_document, from_rusqlite, Result};
use crate::migrations::apply_migrations;

const NOTIFICATION_BUFFER: usize = 1024;

pub struct SqliteDocumentStore {
    conn: Mutex<Connection>,
    notifier: broadcast::Sender<StoreNotification>,
}

impl SqliteDocumentStore {
    /// Open (creating if needed) a database file and bring its schema up to
    /// date
    ///
    /// # Errors
    ///
    /// Returns `Store` if the file cannot be opened or a migration fails.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = db::open(path)?;
        db::configure(&conn)?;
        Self::from_connection(conn)
    }

    /// # Errors
    ///
    /// Returns `Store` if the migrations fail.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(db::open_in_memory()?)
    }

    /// Wrap an existing connection, applying pending migrations
    ///
    /// # Errors
    ///
    /// Returns `Store` if a migration fails.
    pub fn from_connection(mut conn: Connection) -> Result<Self> {
        apply_migrations(&mut conn)?;
        let (notifier, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Ok(Self {
            conn: Mutex::new(conn),
            notifier,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Documents of a collection, optionally of one mapping, whose fields
    /// equal every entry of `filter`; ordered by local id
    ///
    /// # Errors
    ///
    /// Returns `Store` on a database failure or `Serialization` for an
    /// unreadable row.
    pub fn query(
        &self,
        collection: &str,
        mapping: Option<&str>,
        filter: &Map<String, Value>,
    ) -> Result<Vec<Document>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, collection, type, body FROM documents
                 WHERE collection = ?1 AND (?2 IS NULL OR type = ?2)
                 ORDER BY id",
            )
            .map_err(from_rusqlite)?;
        let rows = stmt
            .query_map(rusqlite::params![collection, mapping], read_row)
            .map_err(from_rusqlite)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(from_rusqlite)?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let document = row.into_document()?;
            if filter
                .iter()
                .all(|(field, value)| document.get(field) == Some(value))
            {
                documents.push(document);
            }
        }
        Ok(documents)
    }

    /// Number of stored documents
    ///
    /// # Errors
    ///
    /// Returns `Store` on a database failure.
    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
            .map_err(from_rusqlite)?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn fetch(conn: &Connection, local_id: &LocalId) -> Result<Option<Document>> {
        conn.query_row(
            "SELECT id, collection, type, body FROM documents WHERE id = ?1",
            [local_id.as_str()],
            read_row,
        )
        .optional()
        .map_err(from_rusqlite)?
        .map(StoredRow::into_document)
        .transpose()
    }

    fn write_batch(&self, documents: &[Document]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(from_rusqlite)?;
        let now = chrono::Utc::now().timestamp();
        for document in documents {
            let body = serde_json::to_string(&document.fields)?;
            tx.execute(
                "INSERT INTO documents (id, collection, type, body, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    collection = excluded.collection,
                    type = excluded.type,
                    body = excluded.body,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    document.id.as_str(),
                    document.collection,
                    document.mapping,
                    body,
                    now,
                ],
            )
            .map_err(from_rusqlite)?;
        }
        tx.commit().map_err(from_rusqlite)?;
        Ok(())
    }
}

struct StoredRow {
    id: String,
    collection: String,
    mapping: String,
    body: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<StoredRow> {
    Ok(StoredRow {
        id: row.get(0)?,
        collection: row.get(1)?,
        mapping: row.get(2)?,
        body: row.get(3)?,
    })
}

impl StoredRow {
    fn into_document(self) -> Result<Document> {
        let fields = match serde_json::from_str::<Value>(&self.body) {
            Ok(Value::Object(fields)) => fields,
            Ok(other) => return Err(corrupt_document(&self.id, &format!("body is {}", other))),
            Err(err) => return Err(corrupt_document(&self.id, &err.to_string())),
        };
        Ok(Document {
            id: LocalId::from_string(self.id),
            collection: self.collection,
            mapping: self.mapping,
            fields,
        })
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn get(&self, local_id: &LocalId) -> Result<Option<Document>> {
        Self::fetch(&self.conn(), local_id)
    }

    async fn get_multiple(&self, local_ids: &[LocalId]) -> Result<Vec<Option<Document>>> {
        let conn = self.conn();
        local_ids.iter().map(|id| Self::fetch(&conn, id)).collect()
    }

    async fn put(&self, documents: Vec<Document>) -> Result<Vec<WriteResult>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        if let Err(err) = self.write_batch(&documents) {
            warn!(document_count = documents.len(), error = %err, "document batch rolled back");
            let message = err.to_string();
            return Ok(documents
                .into_iter()
                .map(|d| WriteResult::failed(d.id, message.clone()))
                .collect());
        }
        debug!(document_count = documents.len(), "document batch committed");
        Ok(documents
            .into_iter()
            .map(|d| {
                // Err only means no live receivers
                let _ = self.notifier.send(StoreNotification {
                    local_id: d.id.clone(),
                });
                WriteResult::ok(d.id)
            })
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreNotification> {
        self.notifier.subscribe()
    }
}

impl std::fmt::Debug for SqliteDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDocumentStore").finish_non_exhaustive()
    }
}
