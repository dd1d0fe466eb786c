//! Dynamically typed database rows backing admin resources.

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use strum_macros::{Display, EnumString};
use thiserror::Error;
use tracing::debug;

use crate::sql::{self, InvalidIdentifier};

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    InvalidIdentifier(#[from] InvalidIdentifier),
    #[error("record in {0} has not been saved yet")]
    NotPersisted(String),
    #[error("unknown relation {0}")]
    UnknownRelation(String),
    #[error("relation {relation} ({kind}) cannot be synced")]
    UnsupportedSync { relation: String, kind: RelationKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RelationKind {
    BelongsTo,
    BelongsToMany,
}

/// How a relation is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relation {
    /// `foreign_key` on this record points at `related_table.id`.
    BelongsTo {
        related_table: String,
        foreign_key: String,
    },
    /// Pivot rows `(foreign_pivot_key, related_pivot_key)` join this record to `related_table`.
    BelongsToMany {
        related_table: String,
        pivot_table: String,
        foreign_pivot_key: String,
        related_pivot_key: String,
    },
}

impl Relation {
    pub fn belongs_to(related_table: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        Self::BelongsTo {
            related_table: related_table.into(),
            foreign_key: foreign_key.into(),
        }
    }

    pub fn belongs_to_many(
        related_table: impl Into<String>,
        pivot_table: impl Into<String>,
        foreign_pivot_key: impl Into<String>,
        related_pivot_key: impl Into<String>,
    ) -> Self {
        Self::BelongsToMany {
            related_table: related_table.into(),
            pivot_table: pivot_table.into(),
            foreign_pivot_key: foreign_pivot_key.into(),
            related_pivot_key: related_pivot_key.into(),
        }
    }

    pub fn kind(&self) -> RelationKind {
        match self {
            Self::BelongsTo { .. } => RelationKind::BelongsTo,
            Self::BelongsToMany { .. } => RelationKind::BelongsToMany,
        }
    }
}

/// Table-level description shared by every record of one resource.
#[derive(Debug, Clone)]
pub struct ModelDefinition {
    pub table: String,
    pub key_name: String,
    /// Columns holding JSON text, decoded on load and encoded on save.
    pub json_columns: Vec<String>,
    pub relations: HashMap<String, Relation>,
}

impl ModelDefinition {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key_name: "id".to_string(),
            json_columns: Vec::new(),
            relations: HashMap::new(),
        }
    }

    pub fn key_name(mut self, key_name: impl Into<String>) -> Self {
        self.key_name = key_name.into();
        self
    }

    pub fn json_column(mut self, column: impl Into<String>) -> Self {
        self.json_columns.push(column.into());
        self
    }

    pub fn relation(mut self, name: impl Into<String>, relation: Relation) -> Self {
        self.relations.insert(name.into(), relation);
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

/// Loaded relation data.
#[derive(Debug, Clone)]
pub enum Related {
    One(Option<Box<Record>>),
    Many(Vec<Record>),
}

#[derive(Debug, Clone)]
pub struct Record {
    definition: Arc<ModelDefinition>,
    attributes: Map<String, Value>,
    relations: HashMap<String, Related>,
    exists: bool,
}

impl Record {
    /// A new, unsaved record.
    pub fn new(definition: Arc<ModelDefinition>) -> Self {
        Self {
            definition,
            attributes: Map::new(),
            relations: HashMap::new(),
            exists: false,
        }
    }

    pub fn definition(&self) -> &ModelDefinition {
        &self.definition
    }

    pub fn table(&self) -> &str {
        &self.definition.table
    }

    pub fn key_name(&self) -> &str {
        &self.definition.key_name
    }

    pub fn key(&self) -> Option<i64> {
        self.attributes
            .get(&self.definition.key_name)
            .and_then(Value::as_i64)
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    pub fn get_attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: Value) {
        self.attributes.insert(name.into(), value);
    }

    pub fn relation(&self, name: &str) -> Option<&Related> {
        self.relations.get(name)
    }

    pub fn set_relation(&mut self, name: impl Into<String>, related: Related) {
        self.relations.insert(name.into(), related);
    }

    pub async fn find(
        pool: &SqlitePool,
        definition: Arc<ModelDefinition>,
        id: i64,
    ) -> Result<Option<Self>, RecordError> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM ");
        builder
            .push(sql::ident(&definition.table)?)
            .push(" WHERE ")
            .push(sql::ident(&definition.key_name)?)
            .push(" = ")
            .push_bind(id);

        let Some(row) = builder.build().fetch_optional(pool).await? else {
            return Ok(None);
        };
        let attributes = sql::row_to_attributes(&row, &definition.json_columns)?;
        Ok(Some(Self {
            definition,
            attributes,
            relations: HashMap::new(),
            exists: true,
        }))
    }

    /// Insert or update the row. After an insert the generated key is set.
    pub async fn save(&mut self, pool: &SqlitePool) -> Result<(), RecordError> {
        let table = sql::ident(&self.definition.table)?;
        let key_name = sql::ident(&self.definition.key_name)?;

        let columns: Vec<(&String, &Value)> = self
            .attributes
            .iter()
            .filter(|(name, _)| **name != self.definition.key_name)
            .collect();

        match self.key().filter(|_| self.exists) {
            Some(id) => {
                if columns.is_empty() {
                    return Ok(());
                }
                let mut builder = QueryBuilder::<Sqlite>::new("UPDATE ");
                builder.push(&table).push(" SET ");
                for (i, (name, value)) in columns.iter().enumerate() {
                    if i > 0 {
                        builder.push(", ");
                    }
                    builder.push(sql::ident(name)?).push(" = ");
                    sql::push_json_bind(&mut builder, value);
                }
                builder.push(" WHERE ").push(&key_name).push(" = ").push_bind(id);
                builder.build().execute(pool).await?;
                debug!(table = %self.definition.table, id, "Updated record");
            }
            None => {
                let mut builder = QueryBuilder::<Sqlite>::new("INSERT INTO ");
                builder.push(&table);
                if columns.is_empty() {
                    builder.push(" DEFAULT VALUES");
                } else {
                    builder.push(" (");
                    for (i, (name, _)) in columns.iter().enumerate() {
                        if i > 0 {
                            builder.push(", ");
                        }
                        builder.push(sql::ident(name)?);
                    }
                    builder.push(") VALUES (");
                    for (i, (_, value)) in columns.iter().enumerate() {
                        if i > 0 {
                            builder.push(", ");
                        }
                        sql::push_json_bind(&mut builder, value);
                    }
                    builder.push(")");
                }
                builder.push(" RETURNING ").push(&key_name);

                let id = builder
                    .build_query_scalar::<i64>()
                    .fetch_one(pool)
                    .await?;
                self.attributes
                    .insert(self.definition.key_name.clone(), Value::from(id));
                self.exists = true;
                debug!(table = %self.definition.table, id, "Inserted record");
            }
        }
        Ok(())
    }

    /// Load a relation so dotted reads like `category.name` can traverse it.
    pub async fn load(&mut self, pool: &SqlitePool, name: &str) -> Result<(), RecordError> {
        let relation = self
            .definition
            .relations
            .get(name)
            .cloned()
            .ok_or_else(|| RecordError::UnknownRelation(name.to_string()))?;

        let related = match relation {
            Relation::BelongsTo {
                related_table,
                foreign_key,
            } => {
                let related_definition = ModelDefinition::new(related_table).into_shared();
                match self.attributes.get(&foreign_key).and_then(Value::as_i64) {
                    Some(id) => Related::One(
                        Self::find(pool, related_definition, id)
                            .await?
                            .map(Box::new),
                    ),
                    None => Related::One(None),
                }
            }
            Relation::BelongsToMany {
                related_table,
                pivot_table,
                foreign_pivot_key,
                related_pivot_key,
            } => {
                let key = self
                    .key()
                    .filter(|_| self.exists)
                    .ok_or_else(|| RecordError::NotPersisted(self.definition.table.clone()))?;
                let related_definition = ModelDefinition::new(&related_table).into_shared();

                let mut builder = QueryBuilder::<Sqlite>::new("SELECT r.* FROM ");
                builder
                    .push(sql::ident(&related_table)?)
                    .push(" r JOIN ")
                    .push(sql::ident(&pivot_table)?)
                    .push(" p ON p.")
                    .push(sql::ident(&related_pivot_key)?)
                    .push(" = r.")
                    .push(sql::ident(&related_definition.key_name)?)
                    .push(" WHERE p.")
                    .push(sql::ident(&foreign_pivot_key)?)
                    .push(" = ")
                    .push_bind(key)
                    .push(" ORDER BY r.")
                    .push(sql::ident(&related_definition.key_name)?);

                let rows = builder.build().fetch_all(pool).await?;
                let mut records = Vec::with_capacity(rows.len());
                for row in rows {
                    records.push(Self {
                        definition: related_definition.clone(),
                        attributes: sql::row_to_attributes(&row, &[])?,
                        relations: HashMap::new(),
                        exists: true,
                    });
                }
                Related::Many(records)
            }
        };

        self.relations.insert(name.to_string(), related);
        Ok(())
    }

    /// Replace the pivot rows of a belongs-to-many relation with `ids`.
    pub async fn sync_relation(
        &mut self,
        pool: &SqlitePool,
        name: &str,
        ids: &[i64],
    ) -> Result<(), RecordError> {
        let relation = self
            .definition
            .relations
            .get(name)
            .cloned()
            .ok_or_else(|| RecordError::UnknownRelation(name.to_string()))?;
        let kind = relation.kind();

        let Relation::BelongsToMany {
            pivot_table,
            foreign_pivot_key,
            related_pivot_key,
            ..
        } = relation
        else {
            return Err(RecordError::UnsupportedSync {
                relation: name.to_string(),
                kind,
            });
        };

        let key = self
            .key()
            .filter(|_| self.exists)
            .ok_or_else(|| RecordError::NotPersisted(self.definition.table.clone()))?;
        let pivot = sql::ident(&pivot_table)?;
        let foreign = sql::ident(&foreign_pivot_key)?;
        let related = sql::ident(&related_pivot_key)?;

        let mut tx = pool.begin().await?;

        let mut delete = QueryBuilder::<Sqlite>::new("DELETE FROM ");
        delete
            .push(&pivot)
            .push(" WHERE ")
            .push(&foreign)
            .push(" = ")
            .push_bind(key);
        delete.build().execute(&mut *tx).await?;

        let mut unique_ids = ids.to_vec();
        unique_ids.sort_unstable();
        unique_ids.dedup();

        if !unique_ids.is_empty() {
            let mut insert = QueryBuilder::<Sqlite>::new("INSERT INTO ");
            insert
                .push(&pivot)
                .push(" (")
                .push(&foreign)
                .push(", ")
                .push(&related)
                .push(") ");
            insert.push_values(&unique_ids, |mut row, id| {
                row.push_bind(key).push_bind(*id);
            });
            insert.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        self.relations.remove(name);
        debug!(
            table = %self.definition.table,
            key,
            relation = name,
            count = unique_ids.len(),
            "Synced relation"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::DBService;

    async fn setup() -> (DBService, Arc<ModelDefinition>) {
        let db = DBService::new_in_memory().await.unwrap();
        sqlx::query(
            "CREATE TABLE categories (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL)",
        )
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            "CREATE TABLE posts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                category_id INTEGER,
                content TEXT
            )",
        )
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query("CREATE TABLE tags (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
            .execute(&db.pool)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE post_tag (post_id INTEGER NOT NULL, tag_id INTEGER NOT NULL)")
            .execute(&db.pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO tags (id, name) VALUES (1, 'rust'), (2, 'sql'), (3, 'web')")
            .execute(&db.pool)
            .await
            .unwrap();

        let posts = ModelDefinition::new("posts")
            .json_column("content")
            .relation("category", Relation::belongs_to("categories", "category_id"))
            .relation(
                "tags",
                Relation::belongs_to_many("tags", "post_tag", "post_id", "tag_id"),
            )
            .into_shared();
        (db, posts)
    }

    #[tokio::test]
    async fn save_populates_generated_key_and_round_trips_json_columns() {
        let (db, posts) = setup().await;

        let mut post = Record::new(posts.clone());
        post.set_attribute("title", json!("Hello"));
        post.set_attribute("content", json!({"blocks": [{"type": "text"}]}));
        post.save(&db.pool).await.unwrap();

        let id = post.key().unwrap();
        assert!(post.exists());

        let loaded = Record::find(&db.pool, posts, id).await.unwrap().unwrap();
        assert_eq!(loaded.get_attribute("title"), Some(&json!("Hello")));
        assert_eq!(
            loaded.get_attribute("content"),
            Some(&json!({"blocks": [{"type": "text"}]}))
        );
    }

    #[tokio::test]
    async fn save_updates_existing_rows() {
        let (db, posts) = setup().await;

        let mut post = Record::new(posts.clone());
        post.set_attribute("title", json!("Draft"));
        post.save(&db.pool).await.unwrap();
        let id = post.key().unwrap();

        post.set_attribute("title", json!("Published"));
        post.save(&db.pool).await.unwrap();

        let loaded = Record::find(&db.pool, posts, id).await.unwrap().unwrap();
        assert_eq!(loaded.get_attribute("title"), Some(&json!("Published")));
        assert_eq!(loaded.key(), Some(id));
    }

    #[tokio::test]
    async fn sync_relation_replaces_pivot_rows() {
        let (db, posts) = setup().await;

        let mut post = Record::new(posts);
        post.set_attribute("title", json!("Tagged"));
        post.save(&db.pool).await.unwrap();

        post.sync_relation(&db.pool, "tags", &[1, 2]).await.unwrap();
        post.sync_relation(&db.pool, "tags", &[3, 2, 3]).await.unwrap();

        post.load(&db.pool, "tags").await.unwrap();
        let Some(Related::Many(tags)) = post.relation("tags") else {
            panic!("tags not loaded");
        };
        let names: Vec<_> = tags
            .iter()
            .map(|t| t.get_attribute("name").cloned().unwrap())
            .collect();
        assert_eq!(names, vec![json!("sql"), json!("web")]);
    }

    #[tokio::test]
    async fn sync_requires_a_saved_record() {
        let (db, posts) = setup().await;
        let mut post = Record::new(posts);

        let err = post.sync_relation(&db.pool, "tags", &[1]).await.unwrap_err();
        assert!(matches!(err, RecordError::NotPersisted(_)));
    }

    #[tokio::test]
    async fn belongs_to_cannot_be_synced() {
        let (db, posts) = setup().await;
        let mut post = Record::new(posts);
        post.set_attribute("title", json!("x"));
        post.save(&db.pool).await.unwrap();

        let err = post
            .sync_relation(&db.pool, "category", &[1])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RecordError::UnsupportedSync {
                kind: RelationKind::BelongsTo,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn load_belongs_to() {
        let (db, posts) = setup().await;
        sqlx::query("INSERT INTO categories (id, name) VALUES (7, 'News')")
            .execute(&db.pool)
            .await
            .unwrap();

        let mut post = Record::new(posts);
        post.set_attribute("title", json!("x"));
        post.set_attribute("category_id", json!(7));
        post.save(&db.pool).await.unwrap();
        post.load(&db.pool, "category").await.unwrap();

        let Some(Related::One(Some(category))) = post.relation("category") else {
            panic!("category not loaded");
        };
        assert_eq!(category.get_attribute("name"), Some(&json!("News")));
    }
}
