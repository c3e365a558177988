//! pgvector-backed semantic index
//!
//! Expects an `invoice_embeddings` table:
//!
//! ```sql
//! CREATE TABLE invoice_embeddings (
//!     id          TEXT PRIMARY KEY,
//!     granularity TEXT NOT NULL,
//!     order_id    TEXT NOT NULL,
//!     user_id     INTEGER,
//!     content     TEXT NOT NULL,
//!     metadata    JSONB NOT NULL DEFAULT '{}',
//!     embedding   vector NOT NULL
//! );
//! ```

use super::{vector_literal, IndexDocument, IndexWriter};
use crate::db::DbPool;
use crate::embeddings::Embedder;
use crate::engine::{Fields, SemanticHit, SemanticIndex, SemanticQuery};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DbBackend, Statement, TransactionTrait};
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Nearest-neighbour search by cosine distance
#[derive(Clone)]
pub struct PgVectorIndex {
    pool: DbPool,
    embedder: Arc<dyn Embedder>,
}

impl PgVectorIndex {
    pub fn new(pool: DbPool, embedder: Arc<dyn Embedder>) -> Self {
        Self { pool, embedder }
    }

    /// Embed and store documents, replacing everything indexed for their orders
    pub async fn replace_orders(&self, documents: &[IndexDocument]) -> Result<usize> {
        if documents.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;
        if embeddings.len() != documents.len() {
            return Err(AppError::EmbeddingError {
                message: format!(
                    "expected {} embeddings, got {}",
                    documents.len(),
                    embeddings.len()
                ),
            });
        }

        let txn = self.pool.write().begin().await?;

        let orders: BTreeSet<&str> = documents.iter().map(|d| d.order_id.as_str()).collect();
        for order_id in &orders {
            txn.execute(delete_statement(order_id)).await?;
        }

        for (document, embedding) in documents.iter().zip(embeddings) {
            txn.execute(insert_statement(document, &embedding)?).await?;
        }

        txn.commit().await?;

        info!(
            documents = documents.len(),
            model = self.embedder.model_name(),
            "Indexed documents"
        );
        Ok(documents.len())
    }
}

fn delete_statement(order_id: &str) -> Statement {
    Statement::from_sql_and_values(
        DbBackend::Postgres,
        "DELETE FROM invoice_embeddings WHERE order_id = $1",
        vec![order_id.into()],
    )
}

fn insert_statement(document: &IndexDocument, embedding: &[f32]) -> Result<Statement> {
    let metadata = serde_json::to_value(&document.metadata)?;
    Ok(Statement::from_sql_and_values(
        DbBackend::Postgres,
        r#"
        INSERT INTO invoice_embeddings
            (id, granularity, order_id, user_id, content, metadata, embedding)
        VALUES ($1, $2, $3, $4, $5, $6, $7::vector)
        ON CONFLICT (id) DO UPDATE SET
            granularity = EXCLUDED.granularity,
            order_id = EXCLUDED.order_id,
            user_id = EXCLUDED.user_id,
            content = EXCLUDED.content,
            metadata = EXCLUDED.metadata,
            embedding = EXCLUDED.embedding
        "#,
        vec![
            document.id.clone().into(),
            document.granularity.as_str().into(),
            document.order_id.clone().into(),
            document.user_id.into(),
            document.content.clone().into(),
            metadata.into(),
            vector_literal(embedding).into(),
        ],
    ))
}

/// Build the search statement; user and floor filters are bound, never formatted
fn search_statement(query: &SemanticQuery, embedding: &[f32]) -> Statement {
    let mut values: Vec<sea_orm::Value> = vec![
        vector_literal(embedding).into(),
        query.granularity.as_str().into(),
        (query.min_score as f64).into(),
        (query.top_k as i64).into(),
    ];

    let user_filter = match query.user_id {
        Some(user_id) => {
            values.push(user_id.into());
            "AND (e.user_id = $5 OR e.user_id IS NULL)"
        }
        None => "",
    };

    let sql = format!(
        r#"
        SELECT
            e.order_id,
            e.content,
            e.metadata,
            1 - (e.embedding <=> $1::vector) AS score
        FROM invoice_embeddings e
        WHERE e.granularity = $2
          AND 1 - (e.embedding <=> $1::vector) >= $3
          {}
        ORDER BY e.embedding <=> $1::vector
        LIMIT $4
        "#,
        user_filter
    );

    Statement::from_sql_and_values(DbBackend::Postgres, &sql, values)
}

#[async_trait]
impl IndexWriter for PgVectorIndex {
    async fn index_documents(&self, documents: Vec<IndexDocument>) -> Result<usize> {
        self.replace_orders(&documents).await
    }
}

#[async_trait]
impl SemanticIndex for PgVectorIndex {
    async fn search(&self, query: &SemanticQuery) -> Result<Vec<SemanticHit>> {
        let text = query.embedding_text();
        let embedding = self.embedder.embed(&text).await?;
        if embedding.len() != self.embedder.dimension() {
            return Err(AppError::EmbeddingError {
                message: format!(
                    "embedding has {} dimensions, index expects {}",
                    embedding.len(),
                    self.embedder.dimension()
                ),
            });
        }

        let rows = self
            .pool
            .read()
            .query_all(search_statement(query, &embedding))
            .await?;

        let hits: Vec<SemanticHit> = rows
            .into_iter()
            .filter_map(|row| {
                let order_id = row.try_get_by_index::<String>(0).ok()?;
                let content = row.try_get_by_index::<String>(1).ok()?;
                let metadata = row.try_get_by_index::<JsonValue>(2).ok()?;
                let score = row.try_get_by_index::<f64>(3).ok()?;

                let mut payload: Fields = serde_json::from_value(metadata).unwrap_or_default();
                payload.insert("content".into(), json!(content));
                payload.insert("order_id".into(), json!(order_id));

                Some(SemanticHit {
                    granularity: query.granularity,
                    source_id: order_id,
                    payload,
                    score: (score as f32).clamp(0.0, 1.0),
                })
            })
            .collect();

        debug!(
            granularity = %query.granularity,
            hits = hits.len(),
            "Vector search complete"
        );
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EntityRef, Granularity};
    use crate::index::documents_for_invoice;
    use crate::index::fixtures::{invoice, line_item};

    #[test]
    fn test_search_statement_binds_filters() {
        let query = SemanticQuery::new("chai", Granularity::Product, 10)
            .with_min_score(0.3)
            .with_user(Some(4));
        let stmt = search_statement(&query, &[0.1, 0.2]);

        assert!(stmt.sql.contains("e.granularity = $2"));
        assert!(stmt.sql.contains("e.user_id = $5"));
        assert!(stmt.sql.contains("LIMIT $4"));
        let values = stmt.values.unwrap();
        assert_eq!(values.0.len(), 5);
        assert_eq!(values.0[1], sea_orm::Value::from("product"));
    }

    #[test]
    fn test_replacing_an_order_deletes_by_order_id() {
        let stmt = delete_statement("10248");

        assert!(stmt.sql.contains("WHERE order_id = $1"));
        assert_eq!(stmt.values.unwrap().0, vec![sea_orm::Value::from("10248")]);
    }

    #[test]
    fn test_insert_binds_document() {
        let invoice = invoice("10248", "Paul Henriot", (1996, 7, 4), 440.0);
        let documents = documents_for_invoice(&invoice, &[line_item(10248, "Chai", 10.0, 18.0)]);
        let stmt = insert_statement(&documents[1], &[0.5, 0.25]).unwrap();

        assert!(stmt.sql.contains("ON CONFLICT (id)"));
        assert!(!stmt.sql.contains("10248"));
        let values = stmt.values.unwrap();
        assert_eq!(values.0.len(), 7);
        assert_eq!(values.0[0], sea_orm::Value::from("products_10248"));
        assert_eq!(values.0[2], sea_orm::Value::from("10248"));
    }

    #[test]
    fn test_unscoped_search_has_no_user_filter() {
        let query = SemanticQuery::new("order 10250", Granularity::Invoice, 3)
            .with_entity(Some(EntityRef::Order("10250".into())));
        let stmt = search_statement(&query, &[1.0]);

        assert!(!stmt.sql.contains("user_id"));
        assert_eq!(stmt.values.unwrap().0.len(), 4);
    }
}
