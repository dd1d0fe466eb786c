//! Uniform read/write access to form values, backed by a database record or
//! by a plain JSON structure.

use async_trait::async_trait;
use db::models::record::{Record, RecordError, Related};
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, warn};
use utils::state_path;

#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("cannot write nested path {0:?} on a record; nested values go through a JSON column")]
    NestedModelWrite(String),
    #[error("empty state path")]
    EmptyPath,
    #[error("index {index} in {path:?} is past the end of a list of {len}")]
    IndexOutOfRange {
        path: String,
        index: usize,
        len: usize,
    },
    #[error(transparent)]
    Record(#[from] RecordError),
}

#[async_trait]
pub trait DataSource: Send + Sync {
    /// Resolve a dotted path. `None` when any segment is missing.
    fn get(&self, path: &str) -> Option<&Value>;

    fn set(&mut self, path: &str, value: Value) -> Result<(), DataSourceError>;

    fn has(&self, path: &str) -> bool;

    fn to_array(&self) -> Map<String, Value>;

    /// Replace the related ids of `relation`. Failures are logged, never returned.
    async fn sync(&mut self, relation: &str, ids: &[i64]);

    /// Whether `set` accepts multi-segment paths.
    fn supports_nested_writes(&self) -> bool;

    async fn save(&mut self) -> Result<(), DataSourceError> {
        Ok(())
    }

    /// The persisted record, once there is one.
    fn record(&self) -> Option<&Record> {
        None
    }

    /// Pool for follow-up writes tied to the record.
    fn pool(&self) -> Option<&SqlitePool> {
        None
    }
}

/// Walk `segments` through nested objects and arrays.
fn lookup<'a, 'p>(
    mut current: &'a Value,
    segments: impl Iterator<Item = &'p str>,
) -> Option<&'a Value> {
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Assign `value` at `path`, creating containers for missing or scalar
/// intermediates: arrays for index segments, objects otherwise. An index
/// may address an existing item or append one; anything further out is
/// rejected.
fn assign(root: &mut Value, path: &str, value: Value) -> Result<(), DataSourceError> {
    let segments: Vec<&str> = state_path::segments(path).collect();
    let Some((last, parents)) = segments.split_last() else {
        return Err(DataSourceError::EmptyPath);
    };

    let mut current = root;
    for segment in parents {
        current = child_mut(current, segment, path)?;
    }
    *child_mut(current, last, path)? = value;
    Ok(())
}

fn child_mut<'a>(
    current: &'a mut Value,
    segment: &str,
    path: &str,
) -> Result<&'a mut Value, DataSourceError> {
    let index = state_path::is_index_segment(segment)
        .then(|| segment.parse::<usize>().ok())
        .flatten();

    match (current, index) {
        (Value::Array(items), Some(index)) => {
            if index > items.len() {
                return Err(DataSourceError::IndexOutOfRange {
                    path: path.to_string(),
                    index,
                    len: items.len(),
                });
            }
            if index == items.len() {
                items.push(Value::Null);
            }
            Ok(&mut items[index])
        }
        (Value::Object(map), _) => Ok(map.entry(segment.to_string()).or_insert(Value::Null)),
        (slot, index) => {
            *slot = match index {
                Some(_) => Value::Array(Vec::new()),
                None => Value::Object(Map::new()),
            };
            child_mut(slot, segment, path)
        }
    }
}

/// A JSON structure, e.g. a submitted payload or a JSON column's content.
#[derive(Debug, Clone, Default)]
pub struct ArraySource {
    data: Value,
}

impl ArraySource {
    pub fn new(data: Value) -> Self {
        let data = if data.is_null() {
            Value::Object(Map::new())
        } else {
            data
        };
        Self { data }
    }

    pub fn as_value(&self) -> &Value {
        &self.data
    }

    pub fn into_inner(self) -> Value {
        self.data
    }
}

#[async_trait]
impl DataSource for ArraySource {
    fn get(&self, path: &str) -> Option<&Value> {
        lookup(&self.data, state_path::segments(path))
    }

    fn set(&mut self, path: &str, value: Value) -> Result<(), DataSourceError> {
        assign(&mut self.data, path, value)
    }

    fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    fn to_array(&self) -> Map<String, Value> {
        match &self.data {
            Value::Object(map) => map.clone(),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v.clone()))
                .collect(),
            _ => Map::new(),
        }
    }

    async fn sync(&mut self, relation: &str, _ids: &[i64]) {
        debug!(relation, "Relation sync ignored for array source");
    }

    fn supports_nested_writes(&self) -> bool {
        true
    }
}

/// A database record. Attributes are written one column at a time; nested
/// data lives in JSON columns and is written whole.
#[derive(Debug, Clone)]
pub struct ModelSource {
    record: Record,
    pool: SqlitePool,
}

impl ModelSource {
    pub fn new(record: Record, pool: SqlitePool) -> Self {
        Self { record, pool }
    }

    pub fn into_record(self) -> Record {
        self.record
    }

    fn lookup_record<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
        let mut segments = state_path::segments(path);
        let first = segments.next()?;

        if let Some(value) = record.get_attribute(first) {
            return lookup(value, segments);
        }

        match record.relation(first)? {
            Related::One(related) => {
                let related = related.as_deref()?;
                let rest: Vec<&str> = segments.collect();
                if rest.is_empty() {
                    return None;
                }
                Self::lookup_record(related, &rest.join(state_path::SEPARATOR))
            }
            Related::Many(items) => {
                let index = segments.next()?.parse::<usize>().ok()?;
                let rest: Vec<&str> = segments.collect();
                if rest.is_empty() {
                    return None;
                }
                Self::lookup_record(items.get(index)?, &rest.join(state_path::SEPARATOR))
            }
        }
    }
}

#[async_trait]
impl DataSource for ModelSource {
    fn get(&self, path: &str) -> Option<&Value> {
        Self::lookup_record(&self.record, path)
    }

    fn set(&mut self, path: &str, value: Value) -> Result<(), DataSourceError> {
        let mut segments = state_path::segments(path);
        let Some(attribute) = segments.next() else {
            return Err(DataSourceError::EmptyPath);
        };
        if segments.next().is_some() {
            return Err(DataSourceError::NestedModelWrite(path.to_string()));
        }
        self.record.set_attribute(attribute, value);
        Ok(())
    }

    fn has(&self, path: &str) -> bool {
        self.get(path).is_some_and(|value| !value.is_null())
    }

    fn to_array(&self) -> Map<String, Value> {
        self.record.attributes().clone()
    }

    async fn sync(&mut self, relation: &str, ids: &[i64]) {
        if let Err(e) = self.record.sync_relation(&self.pool, relation, ids).await {
            warn!(
                table = %self.record.table(),
                relation,
                error = %e,
                "Relation sync failed, continuing"
            );
        }
    }

    fn supports_nested_writes(&self) -> bool {
        false
    }

    async fn save(&mut self) -> Result<(), DataSourceError> {
        self.record.save(&self.pool).await?;
        Ok(())
    }

    fn record(&self) -> Option<&Record> {
        Some(&self.record)
    }

    fn pool(&self) -> Option<&SqlitePool> {
        Some(&self.pool)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use db::{
        DBService,
        models::record::{ModelDefinition, Relation},
    };
    use serde_json::json;

    use super::*;

    #[test]
    fn array_get_walks_objects_and_arrays() {
        let source = ArraySource::new(json!({
            "sections": [{"title": "One"}, {"title": "Two", "image": null}]
        }));

        assert_eq!(source.get("sections.1.title"), Some(&json!("Two")));
        assert_eq!(source.get("sections.2.title"), None);
        assert_eq!(source.get("sections.0.missing"), None);
        assert_eq!(source.get("sections.x"), None);
    }

    #[test]
    fn array_has_distinguishes_null_from_absent() {
        let source = ArraySource::new(json!({"a": null, "b": {"c": null}}));
        assert!(source.has("a"));
        assert!(source.has("b.c"));
        assert!(!source.has("b.d"));
        assert!(!source.has("z"));
    }

    #[test]
    fn array_set_creates_intermediates() {
        let mut source = ArraySource::default();
        source.set("sections.0.title", json!("First")).unwrap();
        source.set("sections.1.title", json!("Second")).unwrap();
        source.set("seo.title", json!("SEO")).unwrap();

        assert_eq!(
            source.into_inner(),
            json!({
                "sections": [{"title": "First"}, {"title": "Second"}],
                "seo": {"title": "SEO"}
            })
        );
    }

    #[test]
    fn array_set_rejects_indexes_past_the_end() {
        let mut source = ArraySource::new(json!({"sections": [{"title": "Only"}]}));

        let err = source.set("sections.3.title", json!("Gap")).unwrap_err();
        assert!(matches!(
            err,
            DataSourceError::IndexOutOfRange { index: 3, len: 1, .. }
        ));
        assert!(source.set("sections.100000000000.title", json!("Far")).is_err());
        assert!(source.set("fresh.2", json!("x")).is_err());
        assert_eq!(source.get("sections"), Some(&json!([{"title": "Only"}])));
    }

    #[test]
    fn array_set_overwrites_scalars_in_the_way() {
        let mut source = ArraySource::new(json!({"seo": "flat"}));
        source.set("seo.title", json!("T")).unwrap();
        assert_eq!(source.get("seo.title"), Some(&json!("T")));
    }

    #[test]
    fn array_set_rejects_empty_path() {
        let mut source = ArraySource::default();
        assert!(matches!(
            source.set("", json!(1)),
            Err(DataSourceError::EmptyPath)
        ));
    }

    fn posts() -> Arc<ModelDefinition> {
        ModelDefinition::new("posts")
            .json_column("content")
            .relation("category", Relation::belongs_to("categories", "category_id"))
            .relation(
                "tags",
                Relation::belongs_to_many("tags", "post_tag", "post_id", "tag_id"),
            )
            .into_shared()
    }

    #[tokio::test]
    async fn model_set_rejects_nested_paths() {
        let db = DBService::new_in_memory().await.unwrap();
        let mut source = ModelSource::new(Record::new(posts()), db.pool.clone());

        source.set("title", json!("Hello")).unwrap();
        let err = source.set("content.blocks", json!([])).unwrap_err();
        assert!(matches!(err, DataSourceError::NestedModelWrite(_)));
        assert_eq!(source.get("title"), Some(&json!("Hello")));
        assert_eq!(source.get("content"), None);
    }

    #[tokio::test]
    async fn model_get_traverses_json_columns_and_relations() {
        let db = DBService::new_in_memory().await.unwrap();
        let mut record = Record::new(posts());
        record.set_attribute("content", json!({"blocks": [{"type": "quote"}]}));
        record.set_attribute("subtitle", Value::Null);

        let mut category = Record::new(ModelDefinition::new("categories").into_shared());
        category.set_attribute("name", json!("News"));
        record.set_relation("category", Related::One(Some(Box::new(category))));

        let source = ModelSource::new(record, db.pool.clone());
        assert_eq!(source.get("content.blocks.0.type"), Some(&json!("quote")));
        assert_eq!(source.get("category.name"), Some(&json!("News")));
        assert_eq!(source.get("category.missing"), None);

        assert!(source.has("category.name"));
        assert!(!source.has("subtitle"));
        assert!(!source.has("nothing"));
    }

    #[tokio::test]
    async fn model_sync_failure_is_swallowed() {
        let db = DBService::new_in_memory().await.unwrap();
        // No pivot table exists, and the record is unsaved.
        let mut source = ModelSource::new(Record::new(posts()), db.pool.clone());
        source.sync("tags", &[1, 2]).await;
        source.sync("unknown", &[1]).await;
        assert!(source.to_array().is_empty());
    }

    #[tokio::test]
    async fn array_sync_is_a_no_op() {
        let mut source = ArraySource::new(json!({"tags": [1]}));
        source.sync("tags", &[2, 3]).await;
        assert_eq!(source.get("tags"), Some(&json!([1])));
    }
}
