use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use ts_rs::TS;

/// An uploaded file attached to a record, grouped by collection name.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS, PartialEq)]
pub struct Media {
    pub id: i64,
    pub model_type: Option<String>,
    pub model_id: Option<i64>,
    pub collection_name: String,
    pub file_name: String,
    pub order_column: Option<i64>,
}

impl Media {
    /// Register an upload that is not yet owned by any record.
    pub async fn create_pending(pool: &SqlitePool, file_name: &str) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Media>(
            r#"INSERT INTO media (file_name)
               VALUES ($1)
               RETURNING id, model_type, model_id, collection_name, file_name, order_column"#,
        )
        .bind(file_name)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: i64) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Media>(
            r#"SELECT id, model_type, model_id, collection_name, file_name, order_column
               FROM media
               WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_for_collection(
        pool: &SqlitePool,
        model_type: &str,
        model_id: i64,
        collection_name: &str,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Media>(
            r#"SELECT id, model_type, model_id, collection_name, file_name, order_column
               FROM media
               WHERE model_type = $1 AND model_id = $2 AND collection_name = $3
               ORDER BY order_column ASC, id ASC"#,
        )
        .bind(model_type)
        .bind(model_id)
        .bind(collection_name)
        .fetch_all(pool)
        .await
    }

    /// Assign `ids` to the owner and collection, ordered as given. Only
    /// pending uploads and the owner's own media are touched; ids owned by
    /// another record are skipped.
    pub async fn attach(
        pool: &SqlitePool,
        ids: &[i64],
        model_type: &str,
        model_id: i64,
        collection_name: &str,
    ) -> Result<u64, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let mut affected = 0;
        for (position, id) in ids.iter().enumerate() {
            let result = sqlx::query(
                r#"UPDATE media
                   SET model_type = $2, model_id = $3, collection_name = $4, order_column = $5
                   WHERE id = $1
                     AND (model_id IS NULL OR (model_type = $2 AND model_id = $3))"#,
            )
            .bind(id)
            .bind(model_type)
            .bind(model_id)
            .bind(collection_name)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
            affected += result.rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }

    /// Delete the owner's media in collection `base` and every nested
    /// collection `base.*`, except `keep_ids`.
    pub async fn prune(
        pool: &SqlitePool,
        model_type: &str,
        model_id: i64,
        base: &str,
        keep_ids: &[i64],
    ) -> Result<u64, sqlx::Error> {
        let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM media WHERE model_type = ");
        builder
            .push_bind(model_type.to_string())
            .push(" AND model_id = ")
            .push_bind(model_id)
            .push(" AND (collection_name = ")
            .push_bind(base.to_string())
            .push(" OR substr(collection_name, 1, ")
            .push_bind(base.len() as i64 + 1)
            .push(") = ")
            .push_bind(format!("{base}."))
            .push(")");

        if !keep_ids.is_empty() {
            builder.push(" AND id NOT IN (");
            let mut separated = builder.separated(", ");
            for id in keep_ids {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
        }

        let result = builder.build().execute(pool).await?;
        Ok(result.rows_affected())
    }
}
