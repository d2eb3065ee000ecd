//! SQLite-backed [`VectorStore`].
//!
//! One database holds every instance; the `collection` column keeps them
//! apart. A document's chunks are replaced wholesale on upsert, so
//! re-processing a paper never leaves stale chunks behind.
//!
//! ```text
//! documents (collection, id) ──< chunks (collection, document_id, chunk_index)
//!                                        └─ embedding BLOB (nullable, f32 LE)
//! ```

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use paper_harvest_core::models::TextChunk;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::embedding::vec_to_blob;
use crate::error::{HarvestError, HarvestResult};
use crate::process::{DocumentMetadata, StoreStats, VectorStore};

/// Open (creating if needed) the SQLite database at `path`.
pub async fn connect(path: &Path) -> HarvestResult<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Create tables and indexes. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> HarvestResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            source TEXT NOT NULL,
            title TEXT NOT NULL,
            authors_json TEXT NOT NULL DEFAULT '[]',
            published INTEGER NOT NULL,
            url TEXT NOT NULL,
            categories_json TEXT NOT NULL DEFAULT '[]',
            artifact_sha256 TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (collection, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            embedding BLOB,
            PRIMARY KEY (collection, id),
            UNIQUE (collection, document_id, chunk_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(collection, document_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_published ON documents(collection, published DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    /// Connect and make sure the schema exists.
    pub async fn open(path: &Path) -> HarvestResult<Self> {
        let pool = connect(path).await?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(
        &self,
        collection: &str,
        chunks: &[TextChunk],
        vectors: &[Vec<f32>],
        metadata: &DocumentMetadata,
    ) -> HarvestResult<()> {
        if !vectors.is_empty() && vectors.len() != chunks.len() {
            return Err(HarvestError::Processing(format!(
                "{} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, source, title, authors_json, published, url,
                                   categories_json, artifact_sha256, metadata_json, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(collection, id) DO UPDATE SET
                source = excluded.source,
                title = excluded.title,
                authors_json = excluded.authors_json,
                published = excluded.published,
                url = excluded.url,
                categories_json = excluded.categories_json,
                artifact_sha256 = excluded.artifact_sha256,
                metadata_json = excluded.metadata_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(&metadata.document_id)
        .bind(&metadata.source)
        .bind(&metadata.title)
        .bind(serde_json::to_string(&metadata.authors)?)
        .bind(metadata.published.timestamp())
        .bind(&metadata.url)
        .bind(serde_json::to_string(&metadata.categories)?)
        .bind(&metadata.artifact_sha256)
        .bind(metadata.extra.to_string())
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks WHERE collection = ? AND document_id = ?")
            .bind(collection)
            .bind(&metadata.document_id)
            .execute(&mut *tx)
            .await?;

        for (i, chunk) in chunks.iter().enumerate() {
            let blob = vectors.get(i).map(|v| vec_to_blob(v));
            sqlx::query(
                "INSERT INTO chunks (collection, id, document_id, chunk_index, text, hash, embedding) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(collection)
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.index as i64)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .bind(blob)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn stats(&self, collection: &str) -> HarvestResult<StoreStats> {
        let documents: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE collection = ?")
                .bind(collection)
                .fetch_one(&self.pool)
                .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.pool)
            .await?;
        let embedded: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks WHERE collection = ? AND embedding IS NOT NULL",
        )
        .bind(collection)
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            documents: documents as u64,
            chunks: chunks as u64,
            embedded_chunks: embedded as u64,
        })
    }
}
