//! Row-level primitives for bulk reordering. Callers own the transaction.

use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use thiserror::Error;
use ts_rs::TS;

use crate::sql::{self, InvalidIdentifier};

#[derive(Debug, Error)]
pub enum SortableError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    InvalidIdentifier(#[from] InvalidIdentifier),
}

/// The table and columns a sortable resource keeps its ordering in.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct SortableTable {
    pub table: String,
    pub key_name: String,
    pub order_column: String,
    pub parent_column: Option<String>,
}

impl SortableTable {
    pub fn new(table: impl Into<String>, order_column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key_name: "id".to_string(),
            order_column: order_column.into(),
            parent_column: None,
        }
    }

    pub fn with_parent_column(mut self, parent_column: impl Into<String>) -> Self {
        self.parent_column = Some(parent_column.into());
        self
    }

    pub fn with_key_name(mut self, key_name: impl Into<String>) -> Self {
        self.key_name = key_name.into();
        self
    }

    fn quoted(&self) -> Result<QuotedColumns, InvalidIdentifier> {
        Ok(QuotedColumns {
            table: sql::ident(&self.table)?,
            key: sql::ident(&self.key_name)?,
            order: sql::ident(&self.order_column)?,
            parent: self.parent_column.as_deref().map(sql::ident).transpose()?,
        })
    }
}

struct QuotedColumns {
    table: String,
    key: String,
    order: String,
    parent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct SortableRow {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub position: Option<i64>,
}

/// A row's target placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct Placement {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub position: i64,
}

/// Take the write lock on `ids` and read their current placement, in
/// statements of at most `chunk_size` ids.
///
/// SQLite has no row locks: the no-op update acquires the database write
/// lock for the surrounding transaction, which serializes concurrent reorders.
pub async fn lock_rows(
    conn: &mut SqliteConnection,
    table: &SortableTable,
    ids: &[i64],
    chunk_size: usize,
) -> Result<Vec<SortableRow>, SortableError> {
    let cols = table.quoted()?;
    let mut rows = Vec::with_capacity(ids.len());

    for chunk in ids.chunks(chunk_size.max(1)) {
        let mut lock = QueryBuilder::<Sqlite>::new("UPDATE ");
        lock.push(&cols.table)
            .push(" SET ")
            .push(&cols.order)
            .push(" = ")
            .push(&cols.order)
            .push(" WHERE ")
            .push(&cols.key)
            .push(" IN (");
        push_id_list(&mut lock, chunk);
        lock.build().execute(&mut *conn).await?;

        let mut select = QueryBuilder::<Sqlite>::new("SELECT ");
        select.push(&cols.key).push(" AS id, ");
        match &cols.parent {
            Some(parent) => select.push(parent).push(" AS parent_id, "),
            None => select.push("NULL AS parent_id, "),
        };
        select
            .push(&cols.order)
            .push(" AS position FROM ")
            .push(&cols.table)
            .push(" WHERE ")
            .push(&cols.key)
            .push(" IN (");
        push_id_list(&mut select, chunk);

        let found = select
            .build_query_as::<(i64, Option<i64>, Option<i64>)>()
            .fetch_all(&mut *conn)
            .await?;
        rows.extend(found.into_iter().map(|(id, parent_id, position)| SortableRow {
            id,
            parent_id,
            position,
        }));
    }

    rows.sort_by_key(|row| row.id);
    rows.dedup_by_key(|row| row.id);
    Ok(rows)
}

/// Write new positions (and parents, when `with_parent` is set) in one
/// `UPDATE … CASE` statement per chunk. Returns the number of rows written.
pub async fn bulk_update(
    conn: &mut SqliteConnection,
    table: &SortableTable,
    placements: &[Placement],
    with_parent: bool,
    chunk_size: usize,
) -> Result<u64, SortableError> {
    let cols = table.quoted()?;
    let parent_col = match (&cols.parent, with_parent) {
        (Some(parent), true) => Some(parent.as_str()),
        _ => None,
    };

    let mut written = 0;
    for chunk in placements.chunks(chunk_size.max(1)) {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE ");
        builder
            .push(&cols.table)
            .push(" SET ")
            .push(&cols.order)
            .push(" = CASE ")
            .push(&cols.key);
        for placement in chunk {
            builder
                .push(" WHEN ")
                .push_bind(placement.id)
                .push(" THEN ")
                .push_bind(placement.position);
        }
        builder.push(" END");

        if let Some(parent) = parent_col {
            builder.push(", ").push(parent).push(" = CASE ").push(&cols.key);
            for placement in chunk {
                builder
                    .push(" WHEN ")
                    .push_bind(placement.id)
                    .push(" THEN ")
                    .push_bind(placement.parent_id);
            }
            builder.push(" END");
        }

        builder.push(" WHERE ").push(&cols.key).push(" IN (");
        let ids: Vec<i64> = chunk.iter().map(|p| p.id).collect();
        push_id_list(&mut builder, &ids);

        written += builder.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(written)
}

fn push_id_list(builder: &mut QueryBuilder<'_, Sqlite>, ids: &[i64]) {
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DBService;

    async fn seeded() -> DBService {
        let db = DBService::new_in_memory().await.unwrap();
        sqlx::query(
            "CREATE TABLE pages (id INTEGER PRIMARY KEY, parent_id INTEGER, \
             sort INTEGER NOT NULL DEFAULT 0)",
        )
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO pages (id, parent_id, sort) VALUES (1, NULL, 0), (2, NULL, 1), (3, 1, 0)",
        )
        .execute(&db.pool)
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn lock_rows_reads_current_placement() {
        let db = seeded().await;
        let table = SortableTable::new("pages", "sort").with_parent_column("parent_id");

        let expected = vec![
            SortableRow {
                id: 1,
                parent_id: None,
                position: Some(0),
            },
            SortableRow {
                id: 3,
                parent_id: Some(1),
                position: Some(0),
            },
        ];

        // One id per statement must read the same rows as one statement.
        for chunk_size in [500, 1] {
            let mut tx = db.pool.begin().await.unwrap();
            let rows = lock_rows(&mut tx, &table, &[3, 1, 99], chunk_size)
                .await
                .unwrap();
            tx.commit().await.unwrap();
            assert_eq!(rows, expected);
        }
    }

    #[tokio::test]
    async fn bulk_update_writes_across_chunks() {
        let db = seeded().await;
        let table = SortableTable::new("pages", "sort").with_parent_column("parent_id");
        let placements: Vec<Placement> = [(1, 2), (2, 0), (3, 1)]
            .into_iter()
            .map(|(id, position)| Placement {
                id,
                parent_id: None,
                position,
            })
            .collect();

        let mut tx = db.pool.begin().await.unwrap();
        let written = bulk_update(&mut tx, &table, &placements, true, 2)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(written, 3);

        let rows: Vec<(i64, Option<i64>, i64)> =
            sqlx::query_as("SELECT id, parent_id, sort FROM pages ORDER BY sort")
                .fetch_all(&db.pool)
                .await
                .unwrap();
        assert_eq!(rows, vec![(2, None, 0), (3, None, 1), (1, None, 2)]);
    }

    #[tokio::test]
    async fn invalid_column_names_are_rejected() {
        let db = seeded().await;
        let table = SortableTable::new("pages", "sort; DROP TABLE pages");

        let mut tx = db.pool.begin().await.unwrap();
        let err = lock_rows(&mut tx, &table, &[1], 500).await.unwrap_err();
        assert!(matches!(err, SortableError::InvalidIdentifier(_)));
    }
}
