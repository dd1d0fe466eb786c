//! Writes a submitted form payload into a data source.
//!
//! Plain values are written first and the record is saved. Relations are
//! synced and media attached afterwards, since both need the saved key.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use db::models::{
    media::Media,
    record::{Record, RecordError},
};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, info, warn};
use ts_rs::TS;
use utils::state_path;

use super::{
    data_source::{ArraySource, DataSource, DataSourceError},
    form::{
        FormError, FormTree,
        collection::collection_base,
        schema::{self, Component, ComponentRef, FieldsetChild, PersistMode},
    },
};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error(transparent)]
    DataSource(#[from] DataSourceError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Form(#[from] FormError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, TS)]
pub struct PersistOutcome {
    /// State paths of the values written.
    pub written: Vec<String>,
    /// Relations a sync was attempted for.
    pub synced: Vec<String>,
    pub actions_run: usize,
}

/// Work that needs the saved owner record.
#[async_trait]
pub trait DeferredAction: Send + Sync {
    fn describe(&self) -> String;

    async fn run(&self, owner: &Record, pool: &SqlitePool) -> Result<(), PersistError>;
}

fn owner_key(owner: &Record) -> Result<i64, RecordError> {
    owner
        .key()
        .filter(|_| owner.exists())
        .ok_or_else(|| RecordError::NotPersisted(owner.table().to_string()))
}

/// Assign uploaded media to one field instance's collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachMedia {
    pub collection: String,
    pub ids: Vec<i64>,
}

#[async_trait]
impl DeferredAction for AttachMedia {
    fn describe(&self) -> String {
        format!("attach {:?} to {}", self.ids, self.collection)
    }

    async fn run(&self, owner: &Record, pool: &SqlitePool) -> Result<(), PersistError> {
        let key = owner_key(owner)?;
        Media::attach(pool, &self.ids, owner.table(), key, &self.collection).await?;
        Ok(())
    }
}

/// Delete the owner's media under `base` that the submission no longer
/// references, including collections of removed repeated items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneMedia {
    pub base: String,
    pub keep_ids: Vec<i64>,
}

#[async_trait]
impl DeferredAction for PruneMedia {
    fn describe(&self) -> String {
        format!("prune {} keeping {:?}", self.base, self.keep_ids)
    }

    async fn run(&self, owner: &Record, pool: &SqlitePool) -> Result<(), PersistError> {
        let key = owner_key(owner)?;
        let deleted = Media::prune(pool, owner.table(), key, &self.base, &self.keep_ids).await?;
        if deleted > 0 {
            debug!(base = %self.base, deleted, "Pruned media");
        }
        Ok(())
    }
}

struct MediaValue {
    base: String,
    collection: String,
    ids: Vec<i64>,
}

/// Ids from a submitted relation or media value: a single id or a list.
fn ids_from(value: &Value) -> Vec<i64> {
    let one = |v: &Value| match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    match value {
        Value::Array(items) => items.iter().filter_map(one).collect(),
        other => one(other).into_iter().collect(),
    }
}

/// Rewrite object-keyed fieldset items (`{"0": .., "7": ..}`) as a dense
/// list in ascending key order. Keys that are not indexes, such as the
/// template marker, are dropped.
fn normalize_items<'s>(components: impl Iterator<Item = ComponentRef<'s>>, data: &mut Value) {
    for component in components {
        match component {
            ComponentRef::Field(_) => {}
            ComponentRef::Group(group) => {
                let children = group.children().iter().map(Component::view);
                match group.key() {
                    Some(key) => {
                        if let Some(nested) = data.get_mut(key) {
                            normalize_items(children, nested);
                        }
                    }
                    None => normalize_items(children, data),
                }
            }
            ComponentRef::Fieldset(fieldset) => {
                let Some(slot) = data.get_mut(fieldset.key()) else {
                    continue;
                };
                if let Value::Object(map) = slot {
                    let mut keyed: Vec<(String, Value)> = std::mem::take(map)
                        .into_iter()
                        .filter(|(key, _)| state_path::is_index_segment(key))
                        .collect();
                    // Compare as numbers without parsing, so any length of key sorts.
                    keyed.sort_by(|(a, _), (b, _)| {
                        let (a, b) = (a.trim_start_matches('0'), b.trim_start_matches('0'));
                        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
                    });
                    *slot = Value::Array(keyed.into_iter().map(|(_, item)| item).collect());
                }
                if let Value::Array(items) = slot {
                    for item in items {
                        normalize_items(fieldset.children().iter().map(FieldsetChild::view), item);
                    }
                }
            }
        }
    }
}

/// The shape of a submitted container: one empty object per fieldset item,
/// with nested keyed groups and fieldsets laid out inside it.
fn skeleton<'s>(
    components: impl Iterator<Item = ComponentRef<'s>>,
    data: &Value,
) -> Map<String, Value> {
    let mut out = Map::new();
    for component in components {
        match component {
            ComponentRef::Field(_) => {}
            ComponentRef::Group(group) => {
                let children = group.children().iter().map(Component::view);
                match group.key() {
                    Some(key) => {
                        if let Some(nested @ Value::Object(_)) = data.get(key) {
                            let nested = skeleton(children, nested);
                            out.insert(key.to_string(), Value::Object(nested));
                        }
                    }
                    None => out.extend(skeleton(children, data)),
                }
            }
            ComponentRef::Fieldset(fieldset) => {
                if let Some(Value::Array(items)) = data.get(fieldset.key()) {
                    out.insert(
                        fieldset.key().to_string(),
                        fieldset_skeleton(fieldset.children(), items),
                    );
                }
            }
        }
    }
    out
}

fn fieldset_skeleton(children: &[FieldsetChild], items: &[Value]) -> Value {
    Value::Array(
        items
            .iter()
            .map(|item| {
                Value::Object(skeleton(children.iter().map(FieldsetChild::view), item))
            })
            .collect(),
    )
}

/// Containers present in a submission outside any fieldset.
#[derive(Debug, Default)]
struct Containers {
    /// Keyed groups, by state path.
    groups: Vec<String>,
    /// Outermost fieldsets, by state path, with their item skeletons.
    fieldsets: Vec<(String, Value)>,
}

fn collect_containers<'s>(
    components: impl Iterator<Item = ComponentRef<'s>>,
    data: &Value,
    prefix: Option<&str>,
    out: &mut Containers,
) {
    for component in components {
        match component {
            ComponentRef::Field(_) => {}
            ComponentRef::Group(group) => {
                let children = group.children().iter().map(Component::view);
                match group.key() {
                    Some(key) => {
                        if let Some(nested @ Value::Object(_)) = data.get(key) {
                            let path = state_path::compose_path(prefix, key);
                            collect_containers(children, nested, Some(&path), out);
                            if stores_values(group.children()) {
                                out.groups.push(path);
                            }
                        }
                    }
                    None => collect_containers(children, data, prefix, out),
                }
            }
            ComponentRef::Fieldset(fieldset) => {
                if let Some(Value::Array(items)) = data.get(fieldset.key()) {
                    out.fieldsets.push((
                        state_path::compose_path(prefix, fieldset.key()),
                        fieldset_skeleton(fieldset.children(), items),
                    ));
                }
            }
        }
    }
}

/// Whether anything under `components` is kept in the record's columns.
fn stores_values(components: &[Component]) -> bool {
    schema::flatten(components)
        .into_iter()
        .any(|(_, component)| match component {
            ComponentRef::Field(field) => {
                field.is_dehydrated() && field.kind().persist_mode() == PersistMode::Attribute
            }
            ComponentRef::Fieldset(_) => true,
            ComponentRef::Group(_) => false,
        })
}

fn push_root(roots: &mut Vec<String>, path: &str) {
    if let Some(root) = state_path::segments(path).next() {
        if !roots.iter().any(|r| r == root) {
            roots.push(root.to_string());
        }
    }
}

pub struct FormPersister<'s> {
    schema: &'s [Component],
}

impl<'s> FormPersister<'s> {
    pub fn new(schema: &'s [Component]) -> Self {
        Self { schema }
    }

    pub async fn persist(
        &self,
        payload: &Value,
        source: &mut dyn DataSource,
    ) -> Result<PersistOutcome, PersistError> {
        let mut payload = payload.clone();
        normalize_items(self.schema.iter().map(Component::view), &mut payload);
        let submitted = ArraySource::new(payload);
        let tree = FormTree::build(self.schema, &submitted);
        let nested_writes = source.supports_nested_writes();

        let mut outcome = PersistOutcome::default();
        let mut scratch = ArraySource::default();
        let mut roots: Vec<String> = Vec::new();

        // Submitted lists replace what is stored, even when they are empty
        // or their items carry no plain values.
        let mut containers = Containers::default();
        collect_containers(
            self.schema.iter().map(Component::view),
            submitted.as_value(),
            None,
            &mut containers,
        );
        if nested_writes {
            for (path, items) in containers.fieldsets {
                source.set(&path, items)?;
            }
        } else {
            for path in &containers.groups {
                if !scratch.has(path) {
                    scratch.set(path, Value::Object(Map::new()))?;
                }
                push_root(&mut roots, path);
            }
            for (path, items) in containers.fieldsets {
                scratch.set(&path, items)?;
                push_root(&mut roots, &path);
            }
        }

        let mut relations: Vec<(String, Vec<i64>)> = Vec::new();
        let mut media: Vec<MediaValue> = Vec::new();

        for id in tree.fields() {
            let Some(field) = tree.field(id) else {
                continue;
            };
            if !field.is_dehydrated() {
                continue;
            }
            let path = tree.state_path(id)?;
            if state_path::is_template_state_path(&path) {
                debug!(path = %path, "Skipping template path");
                continue;
            }
            let Some(value) = submitted.get(&path) else {
                continue;
            };

            match field.kind().persist_mode() {
                PersistMode::Attribute => {
                    if nested_writes {
                        source.set(&path, value.clone())?;
                    } else {
                        scratch.set(&path, value.clone())?;
                        push_root(&mut roots, &path);
                    }
                    outcome.written.push(path);
                }
                PersistMode::Relation(relation) => {
                    if state_path::parent_path(&path).is_some() {
                        warn!(
                            path = %path,
                            relation = %relation,
                            "Relation fields inside containers are not synced"
                        );
                        continue;
                    }
                    relations.push((relation, ids_from(value)));
                }
                PersistMode::Media => media.push(MediaValue {
                    base: collection_base(field.collection_override()).to_string(),
                    collection: tree.collection_name(id)?,
                    ids: ids_from(value),
                }),
            }
        }

        // Records take nested values one top-level attribute at a time.
        for root in &roots {
            let value = scratch.get(root).cloned().unwrap_or(Value::Null);
            source.set(root, value)?;
        }

        source.save().await?;

        for (relation, ids) in relations {
            source.sync(&relation, &ids).await;
            outcome.synced.push(relation);
        }

        let actions = self.media_actions(&submitted, media);
        let (Some(owner), Some(pool)) = (source.record(), source.pool()) else {
            if !actions.is_empty() {
                debug!(count = actions.len(), "No saved record, skipping deferred actions");
            }
            return Ok(outcome);
        };

        for action in &actions {
            debug!(action = %action.describe(), "Running deferred action");
            action.run(owner, pool).await?;
            outcome.actions_run += 1;
        }

        info!(
            table = %owner.table(),
            written = outcome.written.len(),
            synced = outcome.synced.len(),
            actions = outcome.actions_run,
            "Persisted form"
        );
        Ok(outcome)
    }

    /// One attach per media field instance, then one prune per collection
    /// base. A base is only pruned when every media field using it was part
    /// of the submission, so untouched fields keep their files.
    fn media_actions(
        &self,
        submitted: &ArraySource,
        media: Vec<MediaValue>,
    ) -> Vec<Box<dyn DeferredAction>> {
        let mut bases: BTreeMap<String, bool> = BTreeMap::new();
        for (path, component) in schema::flatten(self.schema) {
            let ComponentRef::Field(field) = component else {
                continue;
            };
            if field.kind().persist_mode() != PersistMode::Media || !field.is_dehydrated() {
                continue;
            }
            let root_submitted = state_path::segments(&path)
                .next()
                .is_some_and(|root| submitted.has(root));
            let entry = bases
                .entry(collection_base(field.collection_override()).to_string())
                .or_insert(true);
            *entry &= root_submitted;
        }

        let mut keep: BTreeMap<&str, BTreeSet<i64>> = BTreeMap::new();
        for value in &media {
            keep.entry(value.base.as_str())
                .or_default()
                .extend(value.ids.iter().copied());
        }

        let mut actions: Vec<Box<dyn DeferredAction>> = Vec::new();
        for value in &media {
            if !value.ids.is_empty() {
                actions.push(Box::new(AttachMedia {
                    collection: value.collection.clone(),
                    ids: value.ids.clone(),
                }));
            }
        }
        for (base, complete) in bases {
            if !complete {
                debug!(base = %base, "Media fields missing from submission, not pruning");
                continue;
            }
            let keep_ids = keep
                .get(base.as_str())
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default();
            actions.push(Box::new(PruneMedia { base, keep_ids }));
        }
        actions
    }
}
